//! fluxmux - client side of a device multiplexing daemon
//!
//! Local programs connect to a unix socket and speak the mux protocol: a
//! 16-byte header followed by either a binary payload (legacy clients) or an
//! XML property list. fluxmux parses their commands, answers queries, fans
//! out device arrival and removal notifications to listeners, and once a
//! client connects to a device port, bridges raw bytes between the client
//! socket and a tunnel owned by the remote multiplexer.
//!
//! The remote multiplexer is supplied by the embedding program through the
//! [`RemoteMux`] trait and talks back through [`ClientInterface`].

// Internal-only modules
pub(crate) mod client;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod remote;

pub mod buffer;
pub mod protocol;

// These are the intended public API
pub use buffer::GrowableBuffer;
pub use client::{
    ClientHandle, ClientInterface, ClientRegistry, Connection, ConnectionDispatcher,
    ConnectionState, Readiness, SharedConnection,
};
pub use config::ClientConfig;
pub use error::{Error, RemoteError};
pub use protocol::{DeviceRecord, ProtocolVariant, ResultCode};
pub use remote::{ConnectOutcome, RemoteMux, Tunnel, TunnelQueues};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::client::{ClientHandle, ClientInterface, ConnectionDispatcher};
    pub use crate::error::{Error, RemoteError};
    pub use crate::protocol::{DeviceRecord, ResultCode};
    pub use crate::remote::{ConnectOutcome, RemoteMux, Tunnel};
}
