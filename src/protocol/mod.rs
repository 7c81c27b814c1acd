//! Wire codec for the mux protocol.
//!
//! Every message starts with a fixed 16-byte little-endian header
//! (`version`, `total_length`, `message_type`, `tag`). The payload is either a
//! fixed binary record (legacy clients) or an XML property list (plist
//! clients). The family is chosen per connection by the first frame a client
//! sends and is never changed afterwards.

mod command;
mod device;
mod frame;
mod reply;

pub use command::{parse_legacy_command, parse_plist_command, ClientInfo, Command};
pub use device::{DeviceRecord, DEVICE_RECORD_SIZE, SERIAL_NUMBER_SIZE};
pub use frame::{Frame, Header, HEADER_SIZE};
pub use reply::{
    device_add_frame, device_list_message, device_remove_frame, instances_message,
    listener_list_message, plist_frame, result_frame, ListenerEntry,
};

use std::fmt;

/// Numeric message types carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Result = 1,
    Connect = 2,
    Listen = 3,
    DeviceAdd = 4,
    DeviceRemove = 5,
    Plist = 8,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Result),
            2 => Some(Self::Connect),
            3 => Some(Self::Listen),
            4 => Some(Self::DeviceAdd),
            5 => Some(Self::DeviceRemove),
            8 => Some(Self::Plist),
            _ => None,
        }
    }
}

/// Result code carried by `Result` replies.
///
/// The named constants cover the codes the daemon produces itself; the
/// remote multiplexer may report others, which are passed through verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const OK: ResultCode = ResultCode(0);
    pub const BAD_COMMAND: ResultCode = ResultCode(1);
    pub const BAD_DEVICE: ResultCode = ResultCode(2);
    pub const CONNECTION_REFUSED: ResultCode = ResultCode(3);
    pub const BAD_VERSION: ResultCode = ResultCode(6);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::OK => "Ok",
            Self::BAD_COMMAND => "BadCommand",
            Self::BAD_DEVICE => "BadDevice",
            Self::CONNECTION_REFUSED => "ConnectionRefused",
            Self::BAD_VERSION => "BadVersion",
            ResultCode(code) => return write!(f, "Result({code})"),
        };
        f.write_str(name)
    }
}

/// Wire format family negotiated by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVariant {
    /// Binary records only; header version 0.
    #[default]
    Legacy,
    /// XML plist payloads; header version 1.
    Plist,
}

impl ProtocolVariant {
    /// Header version written on outgoing frames.
    pub fn header_version(self) -> u32 {
        match self {
            ProtocolVariant::Legacy => 0,
            ProtocolVariant::Plist => 1,
        }
    }

    /// Whether a client-supplied header version is one the daemon speaks.
    pub fn is_supported_version(version: u32) -> bool {
        version == 0 || version == 1
    }
}
