//! Event loop driving all client connections.
//!
//! Uses mio for non-blocking readiness on a unix listener and every accepted
//! client socket. Work arriving from other threads is queued through
//! [`ClientInterface`] and applied on the loop thread between polls.

use super::connection::{CommandContext, Connection, ConnectionState};
use super::interface::{ClientInterface, ClientRequest};
use super::registry::{ClientRegistry, SharedConnection};
use super::Readiness;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::protocol::DeviceRecord;
use crate::remote::{ConnectOutcome, RemoteMux, Tunnel};
use ::config::Config;

use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::fmt;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    mpsc::{channel, Receiver},
    Arc, Weak,
};
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

// Client tokens are raw descriptors, so the fixed tokens live at the top.
const WAKE_TOKEN: Token = Token(usize::MAX);
const LISTENER_TOKEN: Token = Token(usize::MAX - 1);
const RUN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Accepts local clients and drives their connections.
///
/// Not thread-safe; use [`ClientInterface`] from other threads.
pub struct ConnectionDispatcher {
    poll: Poll,
    listener: Option<(UnixListener, PathBuf)>,
    clients: Arc<ClientRegistry>,
    remote: Arc<dyn RemoteMux>,
    config: ClientConfig,
    next_id: usize,
    interface: ClientInterface,
    receiver: Receiver<ClientRequest>,
}

impl fmt::Debug for ConnectionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDispatcher")
            .field("listener", &self.listener)
            .field("clients", &self.clients.len())
            .field("config", &self.config)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ConnectionDispatcher {
    /// Creates a dispatcher using the top-level configuration keys.
    pub fn new(config: &Config, remote: Arc<dyn RemoteMux>) -> Result<Self, Error> {
        Self::new_named(config, "", remote)
    }

    /// Creates a dispatcher with configuration namespacing.
    ///
    /// Configuration lookup follows this priority:
    /// 1. `{name}.{key}` (e.g., `usbmux.receive_buffer_size`)
    /// 2. `{key}` (e.g., `receive_buffer_size`)
    /// 3. Default value
    pub fn new_named(
        config: &Config,
        name: &str,
        remote: Arc<dyn RemoteMux>,
    ) -> Result<Self, Error> {
        Self::with_client_config(ClientConfig::from_config(config, name), remote)
    }

    pub fn with_client_config(
        config: ClientConfig,
        remote: Arc<dyn RemoteMux>,
    ) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (sender, receiver) = channel();

        Ok(Self {
            poll,
            listener: None,
            clients: Arc::new(ClientRegistry::new()),
            remote,
            config,
            next_id: 1,
            interface: ClientInterface { sender, waker },
            receiver,
        })
    }
}

// ============================================================================
// Listener and Connection Management
// ============================================================================

impl ConnectionDispatcher {
    /// Binds the unix socket clients connect to.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn listen<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let mut listener = UnixListener::bind(path)?;
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        info!("Listening for clients");
        if let Some((mut old, old_path)) = self.listener.replace((listener, path.to_owned())) {
            self.poll.registry().deregister(&mut old)?;
            warn!(old_path = %old_path.display(), "Replaced previous listener");
        }
        Ok(())
    }

    /// Stops accepting clients and removes the socket file.
    #[instrument(skip(self))]
    pub fn close_listener(&mut self) {
        let Some((mut listener, path)) = self.listener.take() else {
            return;
        };
        if let Err(err) = self.poll.registry().deregister(&mut listener) {
            warn!(?err, "Failed to deregister listener");
        }
        if let Err(err) = std::fs::remove_file(&path) {
            debug!(?err, path = %path.display(), "Failed to remove socket file");
        }
        info!(path = %path.display(), "Closed listener");
    }

    /// Accepts every pending client. Returns the id and descriptor of each
    /// new connection.
    #[instrument(skip(self))]
    pub fn accept(&mut self) -> Result<Vec<(usize, RawFd)>, Error> {
        let Some((listener, _)) = self.listener.as_ref() else {
            return Ok(Vec::new());
        };

        let mut new_streams = Vec::new();
        loop {
            match listener.accept() {
                Ok((stream, _)) => new_streams.push(stream),
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(?err, "Transient accept error");
                        continue;
                    }
                    _ => {
                        error!(?err, "Error accepting client");
                        self.close_listener();
                        return Err(err.into());
                    }
                },
            }
        }

        let mut accepted = Vec::with_capacity(new_streams.len());
        for stream in new_streams {
            let fd = stream.as_raw_fd();
            match self.adopt(stream) {
                Ok(id) => accepted.push((id, fd)),
                Err(err) => error!(%err, "Failed to set up client"),
            }
        }
        Ok(accepted)
    }

    /// Takes ownership of an already connected client socket.
    pub fn adopt(&mut self, mut stream: UnixStream) -> Result<usize, Error> {
        let fd = stream.as_raw_fd();
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        let interest = Interest::READABLE;
        self.poll
            .registry()
            .register(&mut stream, client_token(fd), interest)?;
        let mut connection = Connection::new(id, stream, &self.config)?;
        connection.set_registered_interest(Some(interest));

        if !self
            .clients
            .register(id, fd, Arc::new(Mutex::new(connection)))
        {
            // The registry kept nothing; dropping the stream closes it, which
            // also removes it from the poll set.
            return Err(std::io::Error::new(
                ErrorKind::AlreadyExists,
                "descriptor already registered",
            )
            .into());
        }
        info!(id, fd, "Accepted client");
        Ok(id)
    }

    /// Closes one client connection. Closing twice is harmless.
    #[instrument(skip(self, connection), fields(id = connection.id()))]
    fn close_connection(&self, connection: &mut Connection) {
        if connection.registered_interest().is_some() {
            if let Err(err) = self.poll.registry().deregister(connection.source_mut()) {
                debug!(?err, "Failed to deregister client");
            }
            connection.set_registered_interest(None);
        }
        let was_dead = connection.state() == ConnectionState::Dead;
        connection.close(self.remote.as_ref());
        self.clients.remove(connection.id());
        if !was_dead {
            info!(fd = connection.descriptor(), "Closed client");
        }
    }

    /// Closes every client connection.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        info!(count = self.clients.len(), "Closing all clients");
        self.clients.for_each(|shared| {
            let mut connection = shared.lock();
            self.close_connection(&mut connection);
        });
    }
}

// ============================================================================
// Dispatch
// ============================================================================

impl ConnectionDispatcher {
    /// Drives the connection owning `fd` after a readiness event.
    #[instrument(skip(self))]
    pub fn dispatch(&self, fd: RawFd, readiness: Readiness) {
        let Some(shared) = self.clients.find_by_descriptor(fd) else {
            trace!("No client for descriptor");
            return;
        };
        let mut connection = shared.lock();
        let result = connection.process(readiness, &self.context());
        self.settle(&mut connection, result);
    }

    /// Broadcasts a device arrival to every listening client.
    #[instrument(skip(self, device), fields(device_id = device.device_id()))]
    pub fn notify_device_add(&self, device: &DeviceRecord) {
        self.for_each_listener(|connection| connection.notify_device_add(device));
    }

    /// Broadcasts a device removal to every listening client.
    #[instrument(skip(self))]
    pub fn notify_device_remove(&self, device_id: u32) {
        self.for_each_listener(|connection| connection.notify_device_remove(device_id));
    }

    /// Clears the back-reference to a tunnel torn down remotely.
    #[instrument(skip(self, tunnel))]
    pub fn unset_remote(&self, tunnel: &Weak<Tunnel>) {
        let cleared = self.clients.clear_remote(tunnel);
        if cleared == 0 {
            debug!("No client referenced the tunnel");
        }
    }

    /// Descriptor and wanted readiness of every client, for external loops.
    pub fn descriptors_and_interest(&self) -> Vec<(RawFd, Interest)> {
        self.clients.descriptors_and_interest()
    }

    fn for_each_listener<F>(&self, mut notify: F)
    where
        F: FnMut(&mut Connection) -> Result<(), Error>,
    {
        let ctx = self.context();
        self.clients.for_each(|shared| {
            let mut connection = shared.lock();
            if connection.state() != ConnectionState::Listening {
                return;
            }
            let result = notify(&mut connection)
                .and_then(|()| connection.process(Readiness::WRITABLE, &ctx));
            self.settle(&mut connection, result);
        });
    }

    // Applies a request from the collaborator to one connection, then tries
    // to write whatever it queued.
    fn with_connection<F>(&self, id: usize, apply: F)
    where
        F: FnOnce(&mut Connection) -> Result<(), Error>,
    {
        let Some(shared) = self.clients.find(id) else {
            debug!(id, "Client is gone, dropping request");
            return;
        };
        let mut connection = shared.lock();
        let result = apply(&mut connection)
            .and_then(|()| connection.process(Readiness::WRITABLE, &self.context()));
        self.settle(&mut connection, result);
    }

    // Closes the connection on error, otherwise brings its poll registration
    // up to date.
    fn settle(&self, connection: &mut Connection, result: Result<(), Error>) {
        let result = result.and_then(|()| self.sync_interest(connection));
        let Err(err) = result else {
            return;
        };

        let id = connection.id();
        match &err {
            Error::PeerClosed => info!(id, "Client disconnected"),
            Error::TunnelGone => info!(id, "Tunnel closed, dropping client"),
            Error::Io(io)
                if matches!(io.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) =>
            {
                info!(id, ?io, "Client connection lost")
            }
            err if err.result_code().is_some() => {
                warn!(id, %err, "Protocol violation, closing client");
                connection.flush_best_effort();
            }
            Error::FrameTooShort { .. } | Error::FrameTooLarge { .. } => {
                warn!(id, %err, "Bad frame, closing client")
            }
            err => error!(id, %err, "Client failed"),
        }
        self.close_connection(connection);
    }

    fn sync_interest(&self, connection: &mut Connection) -> Result<(), Error> {
        let registered = connection.registered_interest();
        let wanted = connection.interest();
        if registered == wanted {
            return Ok(());
        }

        let token = client_token(connection.descriptor());
        let registry = self.poll.registry();
        match (registered, wanted) {
            (Some(_), Some(interest)) => {
                registry.reregister(connection.source_mut(), token, interest)?
            }
            (None, Some(interest)) => registry.register(connection.source_mut(), token, interest)?,
            (Some(_), None) => registry.deregister(connection.source_mut())?,
            (None, None) => {}
        }
        trace!(id = connection.id(), ?wanted, "Updated interest");
        connection.set_registered_interest(wanted);
        Ok(())
    }

    fn context(&self) -> CommandContext<'_> {
        CommandContext {
            remote: self.remote.as_ref(),
            clients: &self.clients,
            interface: &self.interface,
        }
    }
}

// ============================================================================
// Event Loop
// ============================================================================

impl ConnectionDispatcher {
    /// Runs one poll cycle. Returns the number of client events handled.
    #[instrument(skip(self))]
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize, Error> {
        self.process_requests();

        let mut events = Events::with_capacity(self.config.poll_capacity);
        match self.poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err.into()),
        }

        let mut handled = 0;
        for event in events.iter() {
            match event.token() {
                WAKE_TOKEN => {}
                LISTENER_TOKEN => {
                    self.accept()?;
                }
                Token(fd) => {
                    self.dispatch(fd as RawFd, Readiness::from(event));
                    handled += 1;
                }
            }
        }

        self.process_requests();
        Ok(handled)
    }

    /// Polls until `running` is cleared, then closes every client and the
    /// listener.
    pub fn run(&mut self, running: &AtomicBool) -> Result<(), Error> {
        while running.load(Ordering::Acquire) {
            self.run_once(Some(RUN_POLL_INTERVAL))?;
        }
        self.shutdown();
        self.close_listener();
        Ok(())
    }
}

// ============================================================================
// Utilities
// ============================================================================

impl ConnectionDispatcher {
    /// Gets a thread-safe interface for the remote multiplexer and other
    /// threads.
    pub fn interface(&self) -> ClientInterface {
        self.interface.clone()
    }

    /// The registry of live clients.
    pub fn clients(&self) -> Arc<ClientRegistry> {
        self.clients.clone()
    }

    pub fn find(&self, id: usize) -> Option<SharedConnection> {
        self.clients.find(id)
    }
}

// ============================================================================
// Internal Request Processing
// ============================================================================

impl ConnectionDispatcher {
    fn process_requests(&mut self) {
        let requests: Vec<ClientRequest> = self.receiver.try_iter().collect();

        for request in requests {
            match request {
                ClientRequest::ConnectResult { id, outcome } => self.apply_connect_result(id, outcome),
                ClientRequest::TunnelReady { id } => self.with_connection(id, |_| Ok(())),
                ClientRequest::RemoteClosed { id } => {
                    if let Some(shared) = self.clients.find(id) {
                        let mut connection = shared.lock();
                        info!(id, "Tunnel closed remotely");
                        self.close_connection(&mut connection);
                    }
                }
                ClientRequest::UnsetRemote { tunnel } => self.unset_remote(&tunnel),
                ClientRequest::SendResult { id, tag, code } => {
                    self.with_connection(id, |connection| connection.queue_result(tag, code))
                }
                ClientRequest::SendPlist { id, tag, message } => {
                    self.with_connection(id, |connection| connection.queue_plist(tag, &message))
                }
                ClientRequest::DeviceAdd { device } => self.notify_device_add(&device),
                ClientRequest::DeviceRemove { device_id } => self.notify_device_remove(device_id),
                ClientRequest::Shutdown => self.shutdown(),
            }
        }
    }

    fn apply_connect_result(&self, id: usize, outcome: ConnectOutcome) {
        let orphaned = match self.clients.find(id) {
            Some(shared) => {
                let mut connection = shared.lock();
                if connection.state() == ConnectionState::ConnectingRequestSent {
                    let result = connection
                        .on_connect_result(outcome)
                        .and_then(|()| connection.process(Readiness::WRITABLE, &self.context()));
                    self.settle(&mut connection, result);
                    None
                } else {
                    warn!(id, state = connection.state().name(), "Client is not connecting");
                    Some(outcome)
                }
            }
            None => {
                debug!(id, "Connect result for a closed client");
                Some(outcome)
            }
        };

        // Nobody will ever bridge this tunnel, so hand it straight back.
        if let Some(ConnectOutcome::Connected(tunnel)) = orphaned {
            self.remote.notify_client_close(&tunnel);
        }
    }
}

fn client_token(fd: RawFd) -> Token {
    Token(fd as usize)
}
