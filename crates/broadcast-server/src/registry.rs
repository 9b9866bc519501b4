//! Registry of currently open listener connections.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::connection::{ConnectionId, Sender};

/// Tracks open connections.
///
/// Entries are added by the connect path and removed by the close path.
/// Fan-out works on a [`snapshot`](Self::snapshot), so connections may come
/// and go while a dispatch is in progress.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Sender>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection. Re-registering an id replaces its sender.
    pub fn register(&self, id: ConnectionId, sender: Sender) {
        let mut conns = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        conns.insert(id, sender);
        tracing::debug!(conn = %id, total = conns.len(), "connection registered");
    }

    /// Removes a connection. Returns `false` if it was already gone.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let mut conns = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let removed = conns.remove(&id).is_some();
        if removed {
            tracing::debug!(conn = %id, total = conns.len(), "connection unregistered");
        }
        removed
    }

    /// Copies the current membership.
    pub fn snapshot(&self) -> Vec<(ConnectionId, Sender)> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, sender)| (*id, sender.clone()))
            .collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
