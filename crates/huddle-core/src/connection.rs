//! Per-connection state.
//!
//! The registry owns one [`Connection`] record per live peer. Its room set
//! mirrors the room index kept by the membership service and is only ever
//! mutated from there.

use crate::message::now_millis;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use huddle_protocol::{RoomId, ServerEvent, UserId};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Receiving half of a connection's outbound queue, drained by the transport.
pub type Outbound = mpsc::Receiver<Arc<ServerEvent>>;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate an identifier unique within this process.
    #[must_use]
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{}", nanos, counter))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Failure to hand an event to one connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// No such connection in the registry.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The connection's writer is gone.
    #[error("Connection closed: {0}")]
    Closed(ConnectionId),

    /// The connection's outbound queue is full.
    #[error("Outbound queue full: {0}")]
    Stalled(ConnectionId),
}

/// A live connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user_id: Option<UserId>,
    pub(crate) rooms: HashSet<RoomId>,
    sender: mpsc::Sender<Arc<ServerEvent>>,
    closing: bool,
    connected_at: u64,
}

impl Connection {
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    #[must_use]
    pub fn rooms(&self) -> &HashSet<RoomId> {
        &self.rooms
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    fn info(&self) -> ConnectionInfo {
        let mut rooms: Vec<RoomId> = self.rooms.iter().cloned().collect();
        rooms.sort();
        ConnectionInfo {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            rooms,
            connected_at: self.connected_at,
        }
    }
}

/// A point-in-time copy of a connection's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub user_id: Option<UserId>,
    /// Joined rooms, sorted.
    pub rooms: Vec<RoomId>,
    /// Accept time in milliseconds since the Unix epoch.
    pub connected_at: u64,
}

/// Registry of live connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
    outbound_capacity: usize,
}

impl ConnectionRegistry {
    /// Create a registry whose connections buffer up to `outbound_capacity` events.
    #[must_use]
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    /// Register a new connection.
    pub fn register(&self, user_id: Option<UserId>) -> (ConnectionId, Outbound) {
        let id = ConnectionId::generate();
        let (sender, receiver) = mpsc::channel(self.outbound_capacity);

        self.connections.insert(
            id.clone(),
            Connection {
                id: id.clone(),
                user_id,
                rooms: HashSet::new(),
                sender,
                closing: false,
                connected_at: now_millis(),
            },
        );

        debug!(connection = %id, "Connection registered");
        (id, receiver)
    }

    /// Mark a connection as closing.
    ///
    /// Returns `false` if the connection is unknown or already closing, so
    /// exactly one caller wins teardown.
    pub fn begin_close(&self, id: &ConnectionId) -> bool {
        match self.connections.get_mut(id) {
            Some(mut conn) if !conn.closing => {
                conn.closing = true;
                true
            }
            _ => false,
        }
    }

    /// Discard a connection, dropping its outbound sender.
    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        let (_, conn) = self.connections.remove(id)?;
        debug!(connection = %id, "Connection removed");
        Some(conn.info())
    }

    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    #[must_use]
    pub fn info(&self, id: &ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(id).map(|c| c.info())
    }

    #[must_use]
    pub fn user_of(&self, id: &ConnectionId) -> Option<UserId> {
        self.connections.get(id).and_then(|c| c.user_id.clone())
    }

    /// Snapshot of the rooms a connection belongs to.
    #[must_use]
    pub fn rooms_of(&self, id: &ConnectionId) -> Vec<RoomId> {
        self.connections
            .get(id)
            .map(|c| c.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Queue an event for one connection without waiting.
    ///
    /// # Errors
    ///
    /// Fails if the connection is unknown, its writer is gone, or its queue is full.
    pub fn emit(&self, id: &ConnectionId, event: Arc<ServerEvent>) -> Result<(), DeliveryError> {
        let conn = self
            .connections
            .get(id)
            .ok_or_else(|| DeliveryError::UnknownConnection(id.clone()))?;

        conn.sender.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Stalled(id.clone()),
            TrySendError::Closed(_) => DeliveryError::Closed(id.clone()),
        })
    }

    pub(crate) fn get_mut(
        &self,
        id: &ConnectionId,
    ) -> Option<RefMut<'_, ConnectionId, Connection>> {
        self.connections.get_mut(id)
    }

    /// Every (connection, room) pair, for invariant checks.
    pub(crate) fn memberships(&self) -> Vec<(ConnectionId, RoomId)> {
        self.connections
            .iter()
            .flat_map(|entry| {
                let id = entry.key().clone();
                entry
                    .rooms
                    .iter()
                    .map(|room| (id.clone(), room.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_register_and_remove() {
        let registry = ConnectionRegistry::new(8);
        let (id, _rx) = registry.register(Some("alice".into()));

        assert!(registry.contains(&id));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.user_of(&id).as_deref(), Some("alice"));
        assert!(registry.rooms_of(&id).is_empty());

        let info = registry.remove(&id).unwrap();
        assert_eq!(info.user_id.as_deref(), Some("alice"));
        assert!(registry.is_empty());
        assert!(registry.remove(&id).is_none());
    }

    #[test]
    fn test_begin_close_once() {
        let registry = ConnectionRegistry::new(8);
        let (id, _rx) = registry.register(None);

        assert!(registry.begin_close(&id));
        assert!(!registry.begin_close(&id));
        assert!(!registry.begin_close(&ConnectionId::from("missing")));
    }

    #[tokio::test]
    async fn test_emit_delivers_in_order() {
        let registry = ConnectionRegistry::new(8);
        let (id, mut rx) = registry.register(None);

        registry.emit(&id, Arc::new(ServerEvent::joined("a"))).unwrap();
        registry.emit(&id, Arc::new(ServerEvent::left("a"))).unwrap();

        assert_eq!(*rx.recv().await.unwrap(), ServerEvent::joined("a"));
        assert_eq!(*rx.recv().await.unwrap(), ServerEvent::left("a"));
    }

    #[test]
    fn test_emit_failures() {
        let registry = ConnectionRegistry::new(1);
        let (id, rx) = registry.register(None);
        let event = Arc::new(ServerEvent::joined("a"));

        registry.emit(&id, event.clone()).unwrap();
        assert_eq!(
            registry.emit(&id, event.clone()),
            Err(DeliveryError::Stalled(id.clone()))
        );

        drop(rx);
        assert_eq!(
            registry.emit(&id, event.clone()),
            Err(DeliveryError::Closed(id.clone()))
        );

        let missing = ConnectionId::from("missing");
        assert_eq!(
            registry.emit(&missing, event),
            Err(DeliveryError::UnknownConnection(missing.clone()))
        );
    }
}
