use crate::protocol::{DeviceRecord, ResultCode};
use crate::remote::{ConnectOutcome, Tunnel};
use mio::Waker;
use plist::Value;
use std::sync::{mpsc::Sender, Arc, Weak};
use tracing::warn;

// Internal request type for cross-thread communication
#[derive(Debug)]
pub(crate) enum ClientRequest {
    // Connection Notifications

    ConnectResult {
        id: usize,
        outcome: ConnectOutcome,
    },
    TunnelReady {
        id: usize,
    },
    RemoteClosed {
        id: usize,
    },
    UnsetRemote {
        tunnel: Weak<Tunnel>,
    },

    // Replies

    SendResult {
        id: usize,
        tag: u32,
        code: ResultCode,
    },
    SendPlist {
        id: usize,
        tag: u32,
        message: Value,
    },

    // Broadcasts

    DeviceAdd {
        device: DeviceRecord,
    },
    DeviceRemove {
        device_id: u32,
    },

    Shutdown,
}

/// Thread-safe interface into a running
/// [`ConnectionDispatcher`](super::ConnectionDispatcher).
///
/// Requests are queued and executed on the event loop thread before its next
/// poll, so no caller ever touches a connection while it is being
/// dispatched. Obtain an instance with
/// [`ConnectionDispatcher::interface()`](super::ConnectionDispatcher::interface).
#[derive(Debug, Clone)]
pub struct ClientInterface {
    pub(crate) sender: Sender<ClientRequest>,
    pub(crate) waker: Arc<Waker>,
}

impl ClientInterface {
    /// Sends a device arrival notification to every listening client.
    pub fn notify_device_add(&self, device: DeviceRecord) {
        self.post(ClientRequest::DeviceAdd { device });
    }

    /// Sends a device removal notification to every listening client.
    pub fn notify_device_remove(&self, device_id: u32) {
        self.post(ClientRequest::DeviceRemove { device_id });
    }

    /// Clears the reference to `tunnel` on whichever client holds it.
    ///
    /// The client is not closed; it notices the missing tunnel on its next
    /// I/O and is torn down then.
    pub fn unset_remote(&self, tunnel: &Arc<Tunnel>) {
        self.post(ClientRequest::UnsetRemote {
            tunnel: Arc::downgrade(tunnel),
        });
    }

    /// Closes every client connection.
    pub fn shutdown(&self) {
        self.post(ClientRequest::Shutdown);
    }

    /// A handle addressing a single client connection.
    pub fn handle(&self, id: usize) -> ClientHandle {
        ClientHandle {
            id,
            interface: self.clone(),
        }
    }

    pub(crate) fn post(&self, request: ClientRequest) {
        if self.sender.send(request).is_err() {
            warn!("Event loop is gone, dropping client request");
            return;
        }
        if let Err(err) = self.waker.wake() {
            warn!(?err, "Failed to wake event loop");
        }
    }
}

/// Addresses one client connection from the remote multiplexer.
///
/// Handed to [`RemoteMux`](crate::RemoteMux) calls so replies and connect
/// outcomes can be delivered later, from any thread. Requests for a client
/// that has meanwhile closed are dropped.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: usize,
    interface: ClientInterface,
}

impl ClientHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Reports the outcome of a connect request accepted earlier.
    pub fn notify_connect(&self, outcome: ConnectOutcome) {
        self.interface.post(ClientRequest::ConnectResult {
            id: self.id,
            outcome,
        });
    }

    /// Sends a `Result` reply with the given tag.
    pub fn send_result(&self, tag: u32, code: ResultCode) {
        self.interface.post(ClientRequest::SendResult {
            id: self.id,
            tag,
            code,
        });
    }

    /// Sends a plist reply with the given tag.
    pub fn send_plist(&self, tag: u32, message: Value) {
        self.interface.post(ClientRequest::SendPlist {
            id: self.id,
            tag,
            message,
        });
    }

    /// Signals that the client's tunnel queues changed.
    ///
    /// Must be called after appending to `to_client` and after draining
    /// `to_device`; reads from a bridged client stay suspended until the
    /// tunnel has forwarded what it already holds.
    pub fn tunnel_ready(&self) {
        self.interface.post(ClientRequest::TunnelReady { id: self.id });
    }

    /// Closes the client because its tunnel was torn down remotely.
    pub fn remote_closed(&self) {
        self.interface.post(ClientRequest::RemoteClosed { id: self.id });
    }
}
