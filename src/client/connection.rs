//! Per-client protocol state machine and byte bridging.
//!
//! A connection starts in [`ConnectionState::Command`] and is driven by
//! readiness events from the dispatcher and by notifications from the remote
//! multiplexer. Every method that can fail returns an [`Error`]; the
//! dispatcher answers any error by closing the connection.

use super::interface::ClientInterface;
use super::registry::ClientRegistry;
use super::Readiness;
use crate::buffer::GrowableBuffer;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::protocol::{
    device_add_frame, device_list_message, device_remove_frame, instances_message,
    listener_list_message, parse_legacy_command, parse_plist_command, plist_frame, result_frame,
    ClientInfo, Command, DeviceRecord, Frame, Header, ListenerEntry, MessageType,
    ProtocolVariant, ResultCode, HEADER_SIZE,
};
use crate::remote::{ConnectOutcome, RemoteMux, Tunnel};
use mio::net::UnixStream;
use mio::Interest;
use plist::Value;
use std::io::ErrorKind;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, trace, warn};

/// Lifecycle state of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for a command frame.
    Command,
    /// Subscribed to device notifications.
    Listening,
    /// Connect request accepted by the remote multiplexer, outcome pending.
    ConnectingRequestSent,
    /// Connected; waiting for the `Result` reply to reach the client.
    ConnectingAwaitingFlush,
    /// Forwarding raw bytes between the client and its tunnel.
    Bridging,
    Dead,
}

impl ConnectionState {
    pub fn name(self) -> &'static str {
        match self {
            ConnectionState::Command => "Command",
            ConnectionState::Listening => "Listening",
            ConnectionState::ConnectingRequestSent => "ConnectingRequestSent",
            ConnectionState::ConnectingAwaitingFlush => "ConnectingAwaitingFlush",
            ConnectionState::Bridging => "Bridging",
            ConnectionState::Dead => "Dead",
        }
    }
}

/// What a connection needs from its surroundings while handling a command.
pub(crate) struct CommandContext<'a> {
    pub(crate) remote: &'a dyn RemoteMux,
    pub(crate) clients: &'a ClientRegistry,
    pub(crate) interface: &'a ClientInterface,
}

#[derive(Debug, Clone, Copy)]
struct PendingConnect {
    tag: u32,
    device_id: u32,
}

/// One accepted client socket and everything the daemon knows about it.
#[derive(Debug)]
pub struct Connection {
    id: usize,
    fd: RawFd,
    stream: UnixStream,
    state: ConnectionState,
    variant: Option<ProtocolVariant>,
    // Released once the connection stops parsing commands.
    inbound: Option<GrowableBuffer>,
    // Released once the connection starts bridging.
    outbound: Option<GrowableBuffer>,
    receive_capacity: usize,
    pending: Option<PendingConnect>,
    info: Option<ClientInfo>,
    remote: Option<Weak<Tunnel>>,
    read_deferred: bool,
    registered: Option<Interest>,
}

// ============================================================================
// Constructors and Accessors
// ============================================================================

impl Connection {
    pub fn new(id: usize, stream: UnixStream, config: &ClientConfig) -> Result<Self, Error> {
        let fd = stream.as_raw_fd();
        Ok(Self {
            id,
            fd,
            stream,
            state: ConnectionState::Command,
            variant: None,
            inbound: Some(GrowableBuffer::with_page_size(
                config.receive_buffer_size,
                config.buffer_page_size,
            )?),
            outbound: Some(GrowableBuffer::with_page_size(
                config.send_buffer_size,
                config.buffer_page_size,
            )?),
            receive_capacity: config.receive_buffer_size,
            pending: None,
            info: None,
            remote: None,
            read_deferred: false,
            registered: None,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn descriptor(&self) -> RawFd {
        self.fd
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Wire family, or `None` before the first valid frame.
    pub fn variant(&self) -> Option<ProtocolVariant> {
        self.variant
    }

    pub fn info(&self) -> Option<&ClientInfo> {
        self.info.as_ref()
    }

    /// Tag and device of an outstanding connect request.
    pub fn pending_connect(&self) -> Option<(u32, u32)> {
        self.pending.map(|p| (p.tag, p.device_id))
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Whether the connection references `tunnel`.
    pub fn is_bridged_to(&self, tunnel: &Weak<Tunnel>) -> bool {
        self.remote
            .as_ref()
            .is_some_and(|remote| Weak::ptr_eq(remote, tunnel))
    }

    /// Readiness the connection currently wants.
    ///
    /// `None` once dead, or while a bridged read is deferred and there is
    /// nothing to write.
    pub fn interest(&self) -> Option<Interest> {
        let (wants_read, wants_write) = match self.state {
            ConnectionState::Dead => return None,
            ConnectionState::ConnectingAwaitingFlush => return Some(Interest::WRITABLE),
            ConnectionState::Bridging => match self.tunnel() {
                Some(tunnel) => {
                    let pending = !tunnel.lock().to_client.is_empty();
                    (!self.read_deferred, pending)
                }
                // Stay readable so the next event notices the missing tunnel.
                None => (true, false),
            },
            _ => (true, self.outbound.as_ref().is_some_and(|buf| !buf.is_empty())),
        };
        match (wants_read, wants_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Whether a bridged read waits for the tunnel to drain.
    pub fn read_deferred(&self) -> bool {
        self.read_deferred
    }

    pub(crate) fn registered_interest(&self) -> Option<Interest> {
        self.registered
    }

    pub(crate) fn set_registered_interest(&mut self, interest: Option<Interest>) {
        self.registered = interest;
    }

    pub(crate) fn source_mut(&mut self) -> &mut UnixStream {
        &mut self.stream
    }

    /// Row for a `ListListeners` reply.
    pub fn listener_entry(&self) -> ListenerEntry {
        let info = self.info.as_ref();
        ListenerEntry {
            connection_id: self.id,
            bundle_id: info.and_then(|i| i.bundle_id.clone()),
            prog_name: info.and_then(|i| i.prog_name.clone()),
            lib_version: info.and_then(|i| i.lib_version),
        }
    }

    fn tunnel(&self) -> Option<Arc<Tunnel>> {
        self.remote.as_ref().and_then(Weak::upgrade)
    }

    fn reply_variant(&self) -> ProtocolVariant {
        self.variant.unwrap_or_default()
    }
}

// ============================================================================
// Event Handling
// ============================================================================

impl Connection {
    /// Handles a readiness event.
    pub(crate) fn process(
        &mut self,
        readiness: Readiness,
        ctx: &CommandContext<'_>,
    ) -> Result<(), Error> {
        match self.state {
            ConnectionState::Dead => Ok(()),
            ConnectionState::Bridging => self.bridge(readiness),
            _ => {
                if readiness.readable {
                    self.read_frames(ctx)?;
                }
                self.flush_outbound()
            }
        }
    }

    /// Applies the asynchronous outcome of an accepted connect request.
    pub(crate) fn on_connect_result(&mut self, outcome: ConnectOutcome) -> Result<(), Error> {
        if self.state != ConnectionState::ConnectingRequestSent {
            if self.state != ConnectionState::Dead {
                error!(id = self.id, state = self.state.name(), "Connect result outside of a connect request");
            }
            return Ok(());
        }
        let tag = self.pending.map_or(0, |p| p.tag);
        match outcome {
            ConnectOutcome::Connected(tunnel) => {
                // Referenced before the reply so a failed enqueue still releases it on close.
                self.remote = Some(Arc::downgrade(&tunnel));
                self.queue_result(tag, ResultCode::OK)?;
                self.inbound = None;
                self.state = ConnectionState::ConnectingAwaitingFlush;
                debug!(id = self.id, tag, "Connect succeeded, flushing reply");
            }
            ConnectOutcome::Failed(code) => {
                self.pending = None;
                self.queue_result(tag, code)?;
                self.state = ConnectionState::Command;
                info!(id = self.id, tag, %code, "Connect failed");
            }
        }
        Ok(())
    }

    /// Drops the tunnel reference without closing the connection.
    pub(crate) fn unset_remote(&mut self) {
        self.remote = None;
    }

    /// Queues a device arrival notification; only listeners receive these.
    pub(crate) fn notify_device_add(&mut self, device: &DeviceRecord) -> Result<(), Error> {
        let frame = device_add_frame(self.reply_variant(), device)?;
        self.queue_frame(&frame)
    }

    /// Queues a device removal notification; only listeners receive these.
    pub(crate) fn notify_device_remove(&mut self, device_id: u32) -> Result<(), Error> {
        let frame = device_remove_frame(self.reply_variant(), device_id)?;
        self.queue_frame(&frame)
    }

    pub(crate) fn queue_result(&mut self, tag: u32, code: ResultCode) -> Result<(), Error> {
        debug!(id = self.id, tag, %code, "Sending result");
        let frame = result_frame(self.reply_variant(), tag, code)?;
        self.queue_frame(&frame)
    }

    pub(crate) fn queue_plist(&mut self, tag: u32, message: &Value) -> Result<(), Error> {
        let frame = plist_frame(self.reply_variant(), tag, message)?;
        self.queue_frame(&frame)
    }

    /// Writes queued replies once, ignoring failures. Used right before an
    /// error close so the client can see why.
    pub(crate) fn flush_best_effort(&mut self) {
        if let Some(outbound) = self.outbound.as_mut() {
            let _ = outbound.drain_into(&mut self.stream);
        }
    }

    /// Tears the connection down. Safe to call more than once.
    pub(crate) fn close(&mut self, remote: &dyn RemoteMux) {
        if self.state == ConnectionState::Dead {
            return;
        }
        if let Some(pending) = self.pending.take() {
            info!(id = self.id, device_id = pending.device_id, "Client died mid-connect");
        }
        self.state = ConnectionState::Dead;
        if let Some(tunnel) = self.remote.take().and_then(|weak| weak.upgrade()) {
            remote.notify_client_close(&tunnel);
        }
        self.inbound = None;
        self.outbound = None;
        self.read_deferred = false;
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            trace!(id = self.id, ?err, "Shutdown on close failed");
        }
    }
}

// ============================================================================
// Command Processing
// ============================================================================

impl Connection {
    // Reads and handles complete frames until the socket would block.
    fn read_frames(&mut self, ctx: &CommandContext<'_>) -> Result<(), Error> {
        loop {
            let Some(inbound) = self.inbound.as_mut() else {
                return Ok(());
            };

            let header = Header::parse(inbound.as_slice());
            let want = match header {
                None => HEADER_SIZE - inbound.len(),
                Some(header) => {
                    header.validate(self.receive_capacity)?;
                    header.length as usize - inbound.len()
                }
            };

            if want > 0 {
                match inbound.fill_from(&mut self.stream, want) {
                    Ok(0) => return Err(Error::PeerClosed),
                    Ok(n) => {
                        trace!(id = self.id, len = n, "Read from client");
                        continue;
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            }

            // A complete frame is buffered; the header is known at this point.
            let Some(header) = header else {
                return Ok(());
            };
            let payload = inbound.as_slice()[HEADER_SIZE..].to_vec();
            inbound.clear();

            if let Err(err) = self.handle_frame(&header, &payload, ctx) {
                if let Some(code) = err.result_code() {
                    // Best effort; the connection is closed either way.
                    let _ = self.queue_result(header.tag, code);
                }
                return Err(err);
            }
        }
    }

    fn handle_frame(
        &mut self,
        header: &Header,
        payload: &[u8],
        ctx: &CommandContext<'_>,
    ) -> Result<(), Error> {
        debug!(
            id = self.id,
            len = header.length,
            version = header.version,
            message = header.message,
            tag = header.tag,
            "Client command"
        );

        if self.state != ConnectionState::Command {
            warn!(id = self.id, state = self.state.name(), "Command received in the wrong state");
            return Err(Error::UnexpectedCommand {
                state: self.state.name(),
            });
        }

        if !ProtocolVariant::is_supported_version(header.version) {
            info!(id = self.id, version = header.version, "Client version mismatch");
            return self.queue_result(header.tag, ResultCode::BAD_VERSION);
        }

        let is_plist = header.message == MessageType::Plist as u32;
        if self.variant.is_none() {
            self.variant = Some(if is_plist {
                ProtocolVariant::Plist
            } else {
                ProtocolVariant::Legacy
            });
        }

        let command = if is_plist {
            let (command, info) = parse_plist_command(payload)?;
            self.info = Some(info);
            command
        } else {
            parse_legacy_command(header, payload)?
        };
        self.execute(command, header.tag, ctx)
    }

    fn execute(&mut self, command: Command, tag: u32, ctx: &CommandContext<'_>) -> Result<(), Error> {
        debug!(id = self.id, command = command.name(), tag, "Executing command");
        let remote = ctx.remote;

        match command {
            Command::Listen => {
                self.queue_result(tag, ResultCode::OK)?;
                self.start_listen(remote)
            }
            Command::Connect {
                device_id,
                port,
                request,
            } => {
                debug!(
                    id = self.id,
                    device_id,
                    port = u16::from_be_bytes(port.to_le_bytes()),
                    "Connection request"
                );
                match remote.connect(device_id, tag, &request, ctx.interface.handle(self.id)) {
                    Ok(()) => {
                        self.pending = Some(PendingConnect { tag, device_id });
                        self.state = ConnectionState::ConnectingRequestSent;
                        Ok(())
                    }
                    Err(code) => self.queue_result(tag, code),
                }
            }
            Command::ListDevices => {
                let devices = remote.device_list();
                self.queue_plist(tag, &device_list_message(&devices))
            }
            Command::ListListeners => {
                let listeners = ctx.clients.listener_entries(self.id);
                self.queue_plist(tag, &listener_list_message(&listeners))
            }
            Command::Instances => self.queue_plist(tag, &instances_message(remote.instances())),
            Command::ReadBuid => {
                let handle = ctx.interface.handle(self.id);
                self.reply_on_reject(tag, remote.read_buid(tag, handle))
            }
            Command::ReadPairRecord { record_id } => {
                let handle = ctx.interface.handle(self.id);
                let outcome = remote.read_pair_record(record_id.as_deref(), tag, handle);
                self.reply_on_reject(tag, outcome)
            }
            Command::SavePairRecord { record_id, request } => {
                let handle = ctx.interface.handle(self.id);
                let outcome = remote.save_pair_record(record_id.as_deref(), &request, tag, handle);
                self.reply_on_reject(tag, outcome)
            }
            Command::DeletePairRecord { record_id } => {
                let handle = ctx.interface.handle(self.id);
                let outcome = remote.delete_pair_record(record_id.as_deref(), tag, handle);
                self.reply_on_reject(tag, outcome)
            }
            Command::AddInstance { host, port } => {
                let code = match remote.add_remote(&host, port) {
                    Ok(()) => ResultCode::OK,
                    Err(err) => {
                        warn!(id = self.id, %host, port, %err, "Failed to add remote");
                        err.result_code()
                    }
                };
                self.queue_result(tag, code)
            }
            Command::RemoveInstance { host, port } => {
                let code = match remote.remove_remote(&host, port) {
                    Ok(()) => ResultCode::OK,
                    Err(err) => {
                        warn!(id = self.id, %host, port, %err, "Failed to remove remote");
                        err.result_code()
                    }
                };
                self.queue_result(tag, code)
            }
            Command::Unknown(name) => {
                warn!(id = self.id, command = %name, "Unexpected command");
                self.queue_result(tag, ResultCode::BAD_COMMAND)
            }
        }
    }

    fn start_listen(&mut self, remote: &dyn RemoteMux) -> Result<(), Error> {
        self.state = ConnectionState::Listening;
        info!(id = self.id, "Client now listening");
        for device in remote.device_list() {
            self.notify_device_add(&device)?;
        }
        Ok(())
    }

    fn reply_on_reject(&mut self, tag: u32, outcome: Result<(), ResultCode>) -> Result<(), Error> {
        match outcome {
            Ok(()) => Ok(()),
            Err(code) => self.queue_result(tag, code),
        }
    }

    fn queue_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        let Some(outbound) = self.outbound.as_mut() else {
            warn!(id = self.id, state = self.state.name(), "Connection no longer sends frames, dropping");
            return Ok(());
        };
        let header = frame.header().to_bytes();
        outbound.enqueue_parts(&[&header, &frame.payload])
    }

    // Writes queued frames until drained or the socket would block.
    fn flush_outbound(&mut self) -> Result<(), Error> {
        let Some(outbound) = self.outbound.as_mut() else {
            return Ok(());
        };
        while !outbound.is_empty() {
            match outbound.drain_into(&mut self.stream) {
                Ok(0) => return Err(Error::PeerClosed),
                Ok(n) => {
                    trace!(id = self.id, len = n, remaining = outbound.len(), "Wrote to client");
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        if self.state == ConnectionState::ConnectingAwaitingFlush {
            self.enter_bridging()?;
        }
        Ok(())
    }

    fn enter_bridging(&mut self) -> Result<(), Error> {
        self.state = ConnectionState::Bridging;
        self.outbound = None;
        self.pending = None;
        info!(id = self.id, "Client switching to bridging");
        self.bridge(Readiness::WRITABLE)
    }
}

// ============================================================================
// Bridging
// ============================================================================

impl Connection {
    fn bridge(&mut self, readiness: Readiness) -> Result<(), Error> {
        let tunnel = self.tunnel().ok_or(Error::TunnelGone)?;
        if readiness.readable || self.read_deferred {
            self.bridge_read(&tunnel)?;
        }
        if readiness.writable {
            self.bridge_write(&tunnel)?;
        }
        Ok(())
    }

    // Client -> tunnel. Suspended while the tunnel still holds unforwarded
    // bytes or has no room left.
    fn bridge_read(&mut self, tunnel: &Tunnel) -> Result<(), Error> {
        let mut queues = tunnel.lock();
        if !queues.to_device.is_empty() {
            trace!(id = self.id, "Tunnel has not forwarded yet, deferring read");
            self.read_deferred = true;
            return Ok(());
        }
        loop {
            if queues.to_device.remaining() == 0 {
                trace!(id = self.id, "Tunnel buffer is full, deferring read");
                self.read_deferred = true;
                return Ok(());
            }
            match queues.to_device.fill_from(&mut self.stream, usize::MAX) {
                Ok(0) => return Err(Error::PeerClosed),
                Ok(n) => trace!(id = self.id, len = n, "Read from client into tunnel"),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    self.read_deferred = false;
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    // Tunnel -> client. Unsent bytes stay at the front of the tunnel queue.
    fn bridge_write(&mut self, tunnel: &Tunnel) -> Result<(), Error> {
        let mut queues = tunnel.lock();
        while !queues.to_client.is_empty() {
            match queues.to_client.drain_into(&mut self.stream) {
                Ok(0) => return Err(Error::PeerClosed),
                Ok(n) => trace!(
                    id = self.id,
                    len = n,
                    remaining = queues.to_client.len(),
                    "Wrote tunnel data to client"
                ),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
