//! Local client side of the daemon.
//!
//! [`ConnectionDispatcher`] owns the event loop, [`ClientRegistry`] tracks
//! every live [`Connection`], and [`ClientInterface`] lets other threads
//! (usually the remote multiplexer) reach them.

mod connection;
mod dispatcher;
mod interface;
mod registry;

pub use connection::{Connection, ConnectionState};
pub use dispatcher::ConnectionDispatcher;
pub use interface::{ClientHandle, ClientInterface};
pub use registry::{ClientRegistry, SharedConnection};

use mio::event::Event;

/// Readiness reported for a client descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
    };
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        // Errors and hang-ups surface through the next read or write.
        Readiness {
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed(),
        }
    }
}
