//! Registry of live connections.

use super::connection::Connection;
use super::ConnectionId;
use crate::error::TransportError;
use dashmap::DashMap;
use mesh_core::Package;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Tracks every open connection of one instance and hands out ids.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    next_id: AtomicUsize,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn add(&self, connection: Arc<Connection>) {
        self.connections.insert(connection.id, connection);
    }

    pub(crate) fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// Sends `package` on connection `id`.
    ///
    /// # Errors
    ///
    /// [`TransportError::UnknownConnection`] when `id` is not registered, or
    /// whatever [`Connection::send`] reports.
    pub fn send(&self, id: ConnectionId, package: &Package) -> Result<(), TransportError> {
        let conn = self.get(id).ok_or(TransportError::UnknownConnection(id))?;
        conn.send(package)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Closes every connection.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().close();
        }
    }
}
