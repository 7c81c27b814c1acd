//! Contract with the remote device multiplexer.
//!
//! The remote multiplexer owns device discovery, pairing records and the
//! tunnels to devices. The daemon core only consumes the [`RemoteMux`] trait
//! and borrows [`Tunnel`] queues while bridging a client.

use crate::buffer::GrowableBuffer;
use crate::client::ClientHandle;
use crate::error::{Error, RemoteError};
use crate::protocol::{DeviceRecord, ResultCode};
use parking_lot::{Mutex, MutexGuard};
use plist::{Dictionary, Value};
use std::sync::Arc;

/// Operations the daemon core requests from the remote multiplexer.
///
/// Methods are called from the event loop thread and must not block on
/// network I/O. Replies that are not available immediately are delivered
/// later through the [`ClientHandle`] passed in.
pub trait RemoteMux: Send + Sync {
    /// Devices currently known, in the order listeners should see them.
    fn device_list(&self) -> Vec<DeviceRecord>;

    /// Description of the configured instances, forwarded to clients as is.
    fn instances(&self) -> Value;

    /// Starts opening a channel to a device.
    ///
    /// `Err(code)` rejects the request immediately. `Ok(())` means the
    /// outcome will arrive later via [`ClientHandle::notify_connect`].
    fn connect(
        &self,
        device_id: u32,
        tag: u32,
        request: &Dictionary,
        client: ClientHandle,
    ) -> Result<(), ResultCode>;

    /// Answers a `ReadBUID` request through `client`.
    fn read_buid(&self, tag: u32, client: ClientHandle) -> Result<(), ResultCode>;

    /// Answers a `ReadPairRecord` request through `client`.
    fn read_pair_record(
        &self,
        record_id: Option<&str>,
        tag: u32,
        client: ClientHandle,
    ) -> Result<(), ResultCode>;

    /// Answers a `SavePairRecord` request through `client`.
    fn save_pair_record(
        &self,
        record_id: Option<&str>,
        request: &Dictionary,
        tag: u32,
        client: ClientHandle,
    ) -> Result<(), ResultCode>;

    /// Answers a `DeletePairRecord` request through `client`.
    fn delete_pair_record(
        &self,
        record_id: Option<&str>,
        tag: u32,
        client: ClientHandle,
    ) -> Result<(), ResultCode>;

    /// Registers another remote multiplexer instance.
    fn add_remote(&self, host: &str, port: u16) -> Result<(), RemoteError>;

    /// Unregisters a remote multiplexer instance.
    fn remove_remote(&self, host: &str, port: u16) -> Result<(), RemoteError>;

    /// The client side of a tunnel went away; the tunnel can be released.
    fn notify_client_close(&self, tunnel: &Arc<Tunnel>);
}

/// Outcome of an accepted connect request, reported asynchronously.
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    /// The channel is open. The remote multiplexer keeps the strong
    /// reference; the client only holds a weak one.
    Connected(Arc<Tunnel>),
    Failed(ResultCode),
}

/// Byte queues of a live channel to a device.
///
/// `to_device` holds bytes read from the client and not yet forwarded by the
/// remote multiplexer; `to_client` holds bytes from the device waiting to be
/// written to the client.
#[derive(Debug)]
pub struct Tunnel {
    queues: Mutex<TunnelQueues>,
}

#[derive(Debug)]
pub struct TunnelQueues {
    pub to_device: GrowableBuffer,
    pub to_client: GrowableBuffer,
}

impl Tunnel {
    /// Creates a tunnel whose queues start with `capacity` bytes each.
    pub fn new(capacity: usize) -> Result<Arc<Self>, Error> {
        Ok(Arc::new(Self {
            queues: Mutex::new(TunnelQueues {
                to_device: GrowableBuffer::new(capacity)?,
                to_client: GrowableBuffer::new(capacity)?,
            }),
        }))
    }

    pub fn lock(&self) -> MutexGuard<'_, TunnelQueues> {
        self.queues.lock()
    }
}
