use super::connection::{Connection, ConnectionState};
use crate::protocol::ListenerEntry;
use crate::remote::Tunnel;
use mio::Interest;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// A connection shared between the registry and whoever is working on it.
pub type SharedConnection = Arc<Mutex<Connection>>;

#[derive(Debug, Default)]
struct RegistryInner {
    // Keyed by connection id so iteration follows accept order.
    connections: BTreeMap<usize, SharedConnection>,
    by_fd: HashMap<RawFd, usize>,
}

/// Thread-safe collection of all live client connections.
///
/// Every operation takes the single registry lock for its own duration only.
/// The lock is never held while a connection is locked from inside the
/// registry, so callers may hold a connection lock while calling in here.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    inner: Mutex<RegistryInner>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection. Returns `false`, leaving the registry unchanged, if
    /// its id or descriptor is already registered.
    pub fn register(&self, id: usize, fd: RawFd, connection: SharedConnection) -> bool {
        let mut inner = self.inner.lock();
        if inner.connections.contains_key(&id) || inner.by_fd.contains_key(&fd) {
            warn!(id, fd, "Connection already registered");
            return false;
        }
        inner.connections.insert(id, connection);
        inner.by_fd.insert(fd, id);
        debug!(id, fd, count = inner.connections.len(), "Registered connection");
        true
    }

    /// Removes a connection by id. Removing an unknown id is a no-op.
    pub fn remove(&self, id: usize) -> Option<SharedConnection> {
        let mut inner = self.inner.lock();
        let connection = inner.connections.remove(&id)?;
        inner.by_fd.retain(|_, v| *v != id);
        debug!(id, count = inner.connections.len(), "Removed connection");
        Some(connection)
    }

    pub fn find(&self, id: usize) -> Option<SharedConnection> {
        self.inner.lock().connections.get(&id).cloned()
    }

    pub fn find_by_descriptor(&self, fd: RawFd) -> Option<SharedConnection> {
        let inner = self.inner.lock();
        let id = inner.by_fd.get(&fd)?;
        inner.connections.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().connections.is_empty()
    }

    /// Ids of all registered connections, in accept order.
    pub fn ids(&self) -> Vec<usize> {
        self.inner.lock().connections.keys().copied().collect()
    }

    /// Calls `f` for every connection registered at the time of the call.
    ///
    /// Works on a snapshot taken under the lock, so `f` may register or remove
    /// connections (including the one it was called for) without affecting
    /// the remaining iteration.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&SharedConnection),
    {
        for (_, connection) in self.snapshot() {
            f(&connection);
        }
    }

    fn snapshot(&self) -> Vec<(usize, SharedConnection)> {
        let inner = self.inner.lock();
        inner
            .connections
            .iter()
            .map(|(id, connection)| (*id, connection.clone()))
            .collect()
    }

    /// Descriptor and wanted readiness of every live connection.
    pub fn descriptors_and_interest(&self) -> Vec<(RawFd, Interest)> {
        let mut result = Vec::new();
        self.for_each(|connection| {
            let connection = connection.lock();
            if let Some(interest) = connection.interest() {
                result.push((connection.descriptor(), interest));
            }
        });
        result
    }

    /// Listener rows for every `Listening` connection except `exclude_id`.
    ///
    /// The caller usually holds the lock of `exclude_id` itself, which is why
    /// it is skipped by id instead of locked.
    pub fn listener_entries(&self, exclude_id: usize) -> Vec<ListenerEntry> {
        self.snapshot()
            .into_iter()
            .filter(|(id, _)| *id != exclude_id)
            .filter_map(|(_, connection)| {
                let connection = connection.lock();
                (connection.state() == ConnectionState::Listening)
                    .then(|| connection.listener_entry())
            })
            .collect()
    }

    /// Clears the tunnel reference on every connection bridged to `tunnel`.
    /// Returns how many were cleared.
    pub fn clear_remote(&self, tunnel: &Weak<Tunnel>) -> usize {
        let mut cleared = 0;
        self.for_each(|connection| {
            let mut connection = connection.lock();
            if connection.is_bridged_to(tunnel) {
                connection.unset_remote();
                debug!(id = connection.id(), "Cleared remote reference");
                cleared += 1;
            }
        });
        cleared
    }
}
