//! Room membership.
//!
//! Membership is kept as two mirrored indices: each [`Connection`] record
//! holds its room set, and the room index maps a room to its members. For
//! every connection C and room R, R is in C's rooms iff C is in R's members.
//!
//! Mutations always lock the connection entry first and the room entry
//! second. Broadcast copies the member list, releases the room entry, then
//! delivers, so it never holds two locks at once.
//!
//! [`Connection`]: crate::connection::Connection

use crate::connection::{ConnectionId, ConnectionRegistry, DeliveryError};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use huddle_protocol::{RoomId, ServerEvent};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Membership errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    /// The connection is not registered.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The connection is being torn down.
    #[error("Connection is closing: {0}")]
    ConnectionClosing(ConnectionId),

    /// The connection already belongs to the maximum number of rooms.
    #[error("Maximum rooms per connection reached ({0})")]
    TooManyRooms(usize),

    /// The gateway already hosts the maximum number of rooms.
    #[error("Maximum number of rooms reached ({0})")]
    RoomLimitReached(usize),

    /// A backing store failed.
    #[error("Membership backend error: {0}")]
    Backend(String),
}

/// Membership limits.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Maximum number of non-empty rooms.
    pub max_rooms: usize,
    /// Maximum rooms a single connection may join.
    pub max_rooms_per_connection: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            max_rooms: 10_000,
            max_rooms_per_connection: 100,
        }
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Members sampled when the broadcast started.
    pub recipients: usize,
    /// Members the event was queued for.
    pub delivered: usize,
    /// Members whose delivery failed.
    pub failed: usize,
}

/// Membership statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomStats {
    /// Number of non-empty rooms.
    pub room_count: usize,
    /// Number of registered connections.
    pub connection_count: usize,
    /// Total (connection, room) pairs.
    pub total_memberships: usize,
}

/// The membership contract used by handlers and the lifecycle controller.
///
/// Join and leave are idempotent. Broadcast samples membership once and
/// isolates per-member delivery failures; it does not exclude the sender.
/// A distributed backing store can sit behind this trait without the
/// handlers noticing.
#[async_trait]
pub trait RoomService: Send + Sync {
    /// Add a connection to a room.
    ///
    /// Returns `true` if the connection was not already a member.
    async fn join_room(&self, connection: &ConnectionId, room: &str) -> Result<bool, RoomError>;

    /// Remove a connection from a room.
    ///
    /// Returns `true` if the connection was a member.
    async fn leave_room(&self, connection: &ConnectionId, room: &str) -> Result<bool, RoomError>;

    /// Deliver an event to every current member of a room.
    async fn broadcast_to_room(&self, room: &str, event: ServerEvent) -> BroadcastReport;

    /// Drop every local record of a connection in the given rooms.
    ///
    /// Runs during teardown for rooms whose `leave_room` failed, so the
    /// room index never outlives the connection record. Must not fail.
    /// Returns the number of rooms the connection was removed from.
    fn purge_connection(&self, connection: &ConnectionId, rooms: &[RoomId]) -> usize;

    /// Current members of a room.
    fn members(&self, room: &str) -> Vec<ConnectionId>;

    /// Membership statistics.
    fn stats(&self) -> RoomStats;
}

/// In-process membership backed by the connection registry.
pub struct LocalRooms {
    registry: Arc<ConnectionRegistry>,
    rooms: DashMap<RoomId, HashSet<ConnectionId>>,
    config: MembershipConfig,
}

impl LocalRooms {
    /// Create a membership service with default limits.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_config(registry, MembershipConfig::default())
    }

    #[must_use]
    pub fn with_config(registry: Arc<ConnectionRegistry>, config: MembershipConfig) -> Self {
        info!(
            max_rooms = config.max_rooms,
            max_rooms_per_connection = config.max_rooms_per_connection,
            "Creating local room membership"
        );
        Self {
            registry,
            rooms: DashMap::new(),
            config,
        }
    }

    /// Add a connection to a room.
    ///
    /// # Errors
    ///
    /// Fails for unknown or closing connections and when limits are reached.
    pub fn join(&self, connection: &ConnectionId, room: &str) -> Result<bool, RoomError> {
        let mut conn = self
            .registry
            .get_mut(connection)
            .ok_or_else(|| RoomError::UnknownConnection(connection.clone()))?;

        if conn.is_closing() {
            return Err(RoomError::ConnectionClosing(connection.clone()));
        }
        if conn.rooms.contains(room) {
            return Ok(false);
        }
        if conn.rooms.len() >= self.config.max_rooms_per_connection {
            return Err(RoomError::TooManyRooms(self.config.max_rooms_per_connection));
        }
        // Soft limit: two joins racing to create rooms may overshoot by one each.
        if !self.rooms.contains_key(room) && self.rooms.len() >= self.config.max_rooms {
            return Err(RoomError::RoomLimitReached(self.config.max_rooms));
        }

        let members = {
            let mut entry = self.rooms.entry(room.to_string()).or_default();
            entry.insert(connection.clone());
            entry.len()
        };
        conn.rooms.insert(room.to_string());

        debug!(room = %room, connection = %connection, members, "Joined room");
        Ok(true)
    }

    /// Remove a connection from a room. Unknown connections and non-members are a no-op.
    pub fn leave(&self, connection: &ConnectionId, room: &str) -> bool {
        let Some(mut conn) = self.registry.get_mut(connection) else {
            return false;
        };
        if !conn.rooms.remove(room) {
            return false;
        }

        self.remove_member(room, connection);
        debug!(room = %room, connection = %connection, "Left room");
        true
    }

    /// Remove a connection from the room index, and from its own room set
    /// if it is still registered.
    fn purge(&self, connection: &ConnectionId, rooms: &[RoomId]) -> usize {
        let mut conn = self.registry.get_mut(connection);
        let mut purged = 0;
        for room in rooms {
            if let Some(conn) = conn.as_mut() {
                conn.rooms.remove(room);
            }
            if self.remove_member(room, connection) {
                purged += 1;
            }
        }
        purged
    }

    /// Take one member out of the room index, dropping the room once empty.
    fn remove_member(&self, room: &str, connection: &ConnectionId) -> bool {
        let Entry::Occupied(mut entry) = self.rooms.entry(room.to_string()) else {
            return false;
        };
        let removed = entry.get_mut().remove(connection);
        if entry.get().is_empty() {
            entry.remove();
            debug!(room = %room, "Room is empty, dropped");
        }
        removed
    }

    /// Deliver a shared event to every member sampled at call time.
    pub fn broadcast(&self, room: &str, event: Arc<ServerEvent>) -> BroadcastReport {
        let members: Vec<ConnectionId> = match self.rooms.get(room) {
            Some(entry) => entry.iter().cloned().collect(),
            None => {
                trace!(room = %room, "Broadcast to empty room");
                return BroadcastReport::default();
            }
        };

        let mut report = BroadcastReport {
            recipients: members.len(),
            ..BroadcastReport::default()
        };

        let mut stale = Vec::new();
        for member in &members {
            match self.registry.emit(member, Arc::clone(&event)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(room = %room, connection = %member, error = %e, "Delivery failed");
                    if matches!(e, DeliveryError::UnknownConnection(_)) {
                        stale.push(member);
                    }
                }
            }
        }

        // Members without a registry record can never be reached again.
        for member in stale {
            if self.remove_member(room, member) {
                debug!(room = %room, connection = %member, "Pruned stale member");
            }
        }

        trace!(
            room = %room,
            event = %event.kind(),
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast complete"
        );
        report
    }

    #[must_use]
    pub fn room_exists(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    #[must_use]
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn room_names(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|e| e.key().clone()).collect()
    }

    /// Verify that both indices agree and no empty room is kept.
    ///
    /// # Errors
    ///
    /// Describes the first mismatch found.
    pub fn check_consistency(&self) -> Result<(), String> {
        let by_connection: HashSet<(ConnectionId, RoomId)> =
            self.registry.memberships().into_iter().collect();

        let mut by_room = HashSet::new();
        for entry in self.rooms.iter() {
            if entry.value().is_empty() {
                return Err(format!("room {} is indexed with no members", entry.key()));
            }
            for member in entry.value() {
                by_room.insert((member.clone(), entry.key().clone()));
            }
        }

        if let Some((conn, room)) = by_connection.difference(&by_room).next() {
            return Err(format!("{} lists {} but the room does not list it", conn, room));
        }
        if let Some((conn, room)) = by_room.difference(&by_connection).next() {
            return Err(format!("{} lists {} but the connection does not list it", room, conn));
        }
        Ok(())
    }
}

#[async_trait]
impl RoomService for LocalRooms {
    async fn join_room(&self, connection: &ConnectionId, room: &str) -> Result<bool, RoomError> {
        self.join(connection, room)
    }

    async fn leave_room(&self, connection: &ConnectionId, room: &str) -> Result<bool, RoomError> {
        Ok(self.leave(connection, room))
    }

    async fn broadcast_to_room(&self, room: &str, event: ServerEvent) -> BroadcastReport {
        self.broadcast(room, Arc::new(event))
    }

    fn purge_connection(&self, connection: &ConnectionId, rooms: &[RoomId]) -> usize {
        self.purge(connection, rooms)
    }

    fn members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn stats(&self) -> RoomStats {
        let room_count = self.rooms.len();
        let total_memberships = self.rooms.iter().map(|m| m.len()).sum();
        RoomStats {
            room_count,
            connection_count: self.registry.len(),
            total_memberships,
        }
    }
}
