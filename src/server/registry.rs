//! Live-connection bookkeeping.
//!
//! Many readers (statistics, health checks) and one writer at a time (accept and
//! close), so the map sits behind a read/write lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::connection::ConnectionId;

#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub peer: Option<SocketAddr>,
    pub opened_at: Instant,
    pub websocket: bool,
}

#[derive(Debug, Default, Clone)]
pub struct ConnectionRegistry {
    entries: Arc<RwLock<HashMap<ConnectionId, ConnectionEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` unless `max` connections are already live.
    ///
    /// The entry is removed when the returned [`Registration`] is dropped.
    pub fn try_register(
        &self,
        id: ConnectionId,
        peer: Option<SocketAddr>,
        max: usize,
    ) -> Option<Registration> {
        let mut entries = self.entries.write();
        if entries.len() >= max {
            return None;
        }
        entries.insert(
            id,
            ConnectionEntry {
                peer,
                opened_at: Instant::now(),
                websocket: false,
            },
        );
        Some(Registration {
            id,
            entries: Arc::clone(&self.entries),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn websocket_count(&self) -> usize {
        self.entries.read().values().filter(|e| e.websocket).count()
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionEntry> {
        self.entries.read().get(&id).cloned()
    }
}

/// Keeps a connection registered for as long as it lives.
#[derive(Debug)]
pub struct Registration {
    id: ConnectionId,
    entries: Arc<RwLock<HashMap<ConnectionId, ConnectionEntry>>>,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn mark_websocket(&self) {
        if let Some(entry) = self.entries.write().get_mut(&self.id) {
            entry.websocket = true;
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.entries.write().remove(&self.id);
    }
}
