use crate::protocol::ResultCode;
use thiserror::Error;

/// The error type for fluxmux operations.
///
/// Errors raised while serving a client are confined to that client: the
/// dispatcher logs them, sends a best-effort result frame where one makes
/// sense, and closes the connection. Only errors from setting up the daemon
/// itself (binding, polling, configuration) propagate to the caller.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed its end of the socket.
    #[error("Peer closed the connection")]
    PeerClosed,

    /// A bridging connection lost its tunnel to the remote multiplexer.
    #[error("Tunnel to remote multiplexer is gone")]
    TunnelGone,

    // ============================================================================
    // Framing Errors
    // ============================================================================

    /// Header announces a total length below the header size.
    #[error("Frame is too short ({length} bytes)")]
    FrameTooShort {
        /// The announced total length.
        length: u32,
    },

    /// Header announces a total length above the receive capacity.
    #[error("Frame is too long ({length} bytes, capacity {capacity})")]
    FrameTooLarge {
        /// The announced total length.
        length: u32,
        /// Receive capacity of the connection.
        capacity: usize,
    },

    /// A command frame arrived while the connection was not accepting commands.
    #[error("Command received in state {state}")]
    UnexpectedCommand {
        /// Name of the state the connection was in.
        state: &'static str,
    },

    // ============================================================================
    // Payload Errors
    // ============================================================================

    /// The plist payload could not be parsed or serialized.
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    /// The plist payload is not a dictionary.
    #[error("Plist payload is not a dictionary")]
    NotADictionary,

    /// A required field is absent or has the wrong type.
    #[error("Missing or invalid field '{field}'")]
    MissingField {
        /// The plist key.
        field: &'static str,
        /// Result code reported to the client before teardown.
        code: ResultCode,
    },

    // ============================================================================
    // Resource Errors
    // ============================================================================

    /// Growing a buffer failed.
    #[error("Buffer allocation failed: {0}")]
    Allocation(#[from] std::collections::TryReserveError),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Result code to send back before tearing the connection down, if any.
    ///
    /// Transport failures get no reply: the socket is either gone or the
    /// reply could not be queued in the first place.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            Error::MissingField { code, .. } => Some(*code),
            Error::UnexpectedCommand { .. } | Error::Plist(_) | Error::NotADictionary => {
                Some(ResultCode::BAD_COMMAND)
            }
            _ => None,
        }
    }
}

// ============================================================================
// Remote Multiplexer Errors
// ============================================================================

/// Failures reported by the remote multiplexer for instance management.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The instance is already registered.
    #[error("Instance already present")]
    AlreadyPresent,

    /// The instance is not registered.
    #[error("Instance not found")]
    NotFound,

    /// Any other failure, e.g. the instance could not be reached.
    #[error("Remote failure: {0}")]
    Failed(String),
}

impl RemoteError {
    /// The result code reported to the client for this failure.
    pub fn result_code(&self) -> ResultCode {
        match self {
            RemoteError::AlreadyPresent | RemoteError::NotFound => ResultCode::BAD_DEVICE,
            RemoteError::Failed(_) => ResultCode::CONNECTION_REFUSED,
        }
    }
}
