//! Connection lifecycle.
//!
//! The gateway binds the handler set to every accepted connection and tears
//! membership down exactly once when the connection ends, however it ends.

use crate::connection::{ConnectionId, ConnectionRegistry, Outbound};
use crate::handler::{Handler, Listeners, Socket};
use crate::handlers::{MessageHandler, RoomHandler};
use crate::membership::{LocalRooms, MembershipConfig, RoomService};
use futures_util::future::join_all;
use huddle_protocol::{ClientEvent, UserId};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Membership limits.
    pub membership: MembershipConfig,
    /// Events buffered per connection before deliveries to it fail.
    pub outbound_capacity: usize,
    /// Maximum `message:send` text length in bytes.
    pub max_message_length: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            membership: MembershipConfig::default(),
            outbound_capacity: 256,
            max_message_length: 16 * 1024,
        }
    }
}

/// Summary of one connection teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Teardown {
    /// Rooms the connection was removed from.
    pub rooms_left: usize,
    /// Rooms whose leave failed.
    pub failures: usize,
}

/// The connection lifecycle controller.
pub struct Gateway {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<dyn RoomService>,
    handlers: Vec<Arc<dyn Handler>>,
}

impl Gateway {
    /// Create a gateway with no handlers.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, rooms: Arc<dyn RoomService>) -> Self {
        Self {
            registry,
            rooms,
            handlers: Vec::new(),
        }
    }

    /// In-memory membership with the room and message handlers.
    #[must_use]
    pub fn standard(config: GatewayConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.outbound_capacity));
        let rooms: Arc<dyn RoomService> = Arc::new(LocalRooms::with_config(
            Arc::clone(&registry),
            config.membership,
        ));

        Self::new(registry, Arc::clone(&rooms))
            .with_handler(RoomHandler::new(Arc::clone(&rooms)))
            .with_handler(MessageHandler::new(rooms, config.max_message_length))
    }

    /// Append a handler. Handlers attach in the order they were added.
    #[must_use]
    pub fn with_handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn rooms(&self) -> &Arc<dyn RoomService> {
        &self.rooms
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Accept a connection and attach every handler to it.
    ///
    /// The returned [`Outbound`] yields the events queued for this
    /// connection; it ends once the connection is torn down.
    pub fn connect(&self, user_id: Option<UserId>) -> (Session, Outbound) {
        let (id, outbound) = self.registry.register(user_id.clone());
        let span = info_span!(
            "connection",
            connection = %id,
            user = user_id.as_deref().unwrap_or("-")
        );

        let socket = Socket::new(id, user_id, Arc::clone(&self.registry), span);
        let mut listeners = Listeners::default();
        for handler in &self.handlers {
            handler.attach(&mut listeners);
        }

        socket.span().in_scope(|| {
            info!(handlers = self.handlers.len(), "Connection accepted");
        });

        (Session { socket, listeners }, outbound)
    }

    /// Tear a connection down: leave every room, then discard its record.
    ///
    /// Rooms whose leave fails are still purged from the local index before
    /// the record goes away. Only the first call for a connection does anything.
    pub async fn disconnect(&self, id: &ConnectionId) -> Teardown {
        if !self.registry.begin_close(id) {
            debug!(connection = %id, "Connection already torn down");
            return Teardown::default();
        }

        let rooms = self.registry.rooms_of(id);
        let results = join_all(rooms.iter().map(|room| async move {
            (room, self.rooms.leave_room(id, room).await)
        }))
        .await;

        let mut teardown = Teardown::default();
        let mut failed = Vec::new();
        for (room, result) in results {
            match result {
                Ok(_) => teardown.rooms_left += 1,
                Err(e) => {
                    teardown.failures += 1;
                    warn!(connection = %id, room = %room, error = %e, "Failed to leave room on disconnect");
                    failed.push(room.clone());
                }
            }
        }

        if !failed.is_empty() {
            let purged = self.rooms.purge_connection(id, &failed);
            debug!(connection = %id, purged, "Purged rooms left with errors");
        }

        self.registry.remove(id);
        info!(
            connection = %id,
            rooms = teardown.rooms_left,
            failures = teardown.failures,
            "Connection closed"
        );
        teardown
    }
}

/// One accepted connection and its attached listeners.
pub struct Session {
    socket: Socket,
    listeners: Listeners,
}

impl Session {
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        self.socket.id()
    }

    #[must_use]
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Handle one inbound event. Callers await this before reading the next
    /// frame, which keeps per-connection ordering.
    pub async fn dispatch(&self, event: ClientEvent) {
        let span = self.socket.span().clone();
        self.listeners
            .dispatch(&self.socket, event)
            .instrument(span)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerError;
    use crate::membership::{BroadcastReport, RoomError, RoomStats};
    use huddle_protocol::{ErrorCode, LeaveRoom, MessageReceived, RoomId, ServerEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        gateway: Gateway,
        rooms: Arc<LocalRooms>,
    }

    fn fixture(config: GatewayConfig) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new(config.outbound_capacity));
        let rooms = Arc::new(LocalRooms::with_config(
            Arc::clone(&registry),
            config.membership,
        ));
        let service: Arc<dyn RoomService> = rooms.clone();
        let gateway = Gateway::new(registry, Arc::clone(&service))
            .with_handler(RoomHandler::new(Arc::clone(&service)))
            .with_handler(MessageHandler::new(service, config.max_message_length));
        Fixture { gateway, rooms }
    }

    fn drain(outbound: &mut Outbound) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = outbound.try_recv() {
            events.push((*event).clone());
        }
        events
    }

    #[tokio::test]
    async fn test_lobby_message_reaches_every_member() {
        let f = fixture(GatewayConfig::default());
        let (a, mut out_a) = f.gateway.connect(Some("alice".into()));
        let (b, mut out_b) = f.gateway.connect(Some("bob".into()));
        let (_c, mut out_c) = f.gateway.connect(Some("carol".into()));

        a.dispatch(ClientEvent::join("lobby")).await;
        b.dispatch(ClientEvent::join("lobby")).await;
        assert_eq!(drain(&mut out_a), vec![ServerEvent::joined("lobby")]);
        assert_eq!(drain(&mut out_b), vec![ServerEvent::joined("lobby")]);

        a.dispatch(ClientEvent::send("lobby", "hi")).await;

        for events in [drain(&mut out_a), drain(&mut out_b)] {
            assert_eq!(events.len(), 1);
            match &events[0] {
                ServerEvent::MessageReceive(MessageReceived {
                    message,
                    from,
                    timestamp,
                }) => {
                    assert_eq!(message, "hi");
                    assert_eq!(from.as_deref(), Some("alice"));
                    assert!(*timestamp > 0);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(drain(&mut out_c).is_empty());
    }

    #[tokio::test]
    async fn test_abrupt_disconnect_clears_membership() {
        let f = fixture(GatewayConfig::default());
        let (a, mut out_a) = f.gateway.connect(None);
        let (b, mut out_b) = f.gateway.connect(None);

        a.dispatch(ClientEvent::join("x")).await;
        a.dispatch(ClientEvent::join("y")).await;
        b.dispatch(ClientEvent::join("x")).await;
        drain(&mut out_a);
        drain(&mut out_b);

        let teardown = f.gateway.disconnect(a.id()).await;
        assert_eq!(
            teardown,
            Teardown {
                rooms_left: 2,
                failures: 0
            }
        );

        assert!(!f.gateway.registry().contains(a.id()));
        assert!(!f.rooms.room_exists("y"));
        assert_eq!(f.rooms.members("x"), vec![b.id().clone()]);
        f.rooms.check_consistency().unwrap();

        let report = f
            .gateway
            .rooms()
            .broadcast_to_room("x", ServerEvent::joined("x"))
            .await;
        assert_eq!(report.delivered, 1);
        f.gateway
            .rooms()
            .broadcast_to_room("y", ServerEvent::joined("y"))
            .await;

        // The writer side sees the queue close instead of new events.
        assert!(out_a.recv().await.is_none());
        assert_eq!(drain(&mut out_b), vec![ServerEvent::joined("x")]);
    }

    #[tokio::test]
    async fn test_disconnect_runs_once_and_without_rooms() {
        let f = fixture(GatewayConfig::default());
        let (a, _out) = f.gateway.connect(None);

        assert_eq!(f.gateway.disconnect(a.id()).await, Teardown::default());
        assert_eq!(f.gateway.disconnect(a.id()).await, Teardown::default());
        assert!(f.gateway.registry().is_empty());
    }

    #[tokio::test]
    async fn test_events_after_disconnect_do_not_rejoin() {
        let f = fixture(GatewayConfig::default());
        let (a, _out) = f.gateway.connect(None);
        f.gateway.disconnect(a.id()).await;

        a.dispatch(ClientEvent::join("lobby")).await;
        assert!(!f.rooms.room_exists("lobby"));
    }

    #[tokio::test]
    async fn test_leave_unjoined_room_is_acknowledged_noop() {
        let f = fixture(GatewayConfig::default());
        let (a, mut out_a) = f.gateway.connect(None);
        let (b, _out_b) = f.gateway.connect(None);
        b.dispatch(ClientEvent::join("lobby")).await;

        a.dispatch(ClientEvent::leave("lobby")).await;

        assert_eq!(drain(&mut out_a), vec![ServerEvent::left("lobby")]);
        assert_eq!(f.rooms.members("lobby"), vec![b.id().clone()]);
        f.rooms.check_consistency().unwrap();
    }

    #[tokio::test]
    async fn test_repeated_join_keeps_single_membership() {
        let f = fixture(GatewayConfig::default());
        let (a, mut out_a) = f.gateway.connect(None);

        a.dispatch(ClientEvent::join("lobby")).await;
        a.dispatch(ClientEvent::join("lobby")).await;
        a.dispatch(ClientEvent::send("lobby", "once")).await;

        let events = drain(&mut out_a);
        assert_eq!(events.len(), 3);
        assert_eq!(f.rooms.member_count("lobby"), 1);
        assert_eq!(a.socket().rooms(), vec!["lobby".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_room_reports_error_and_keeps_connection() {
        let f = fixture(GatewayConfig::default());
        let (a, mut out_a) = f.gateway.connect(None);

        a.dispatch(ClientEvent::join("")).await;
        a.dispatch(ClientEvent::leave("$system")).await;
        a.dispatch(ClientEvent::send("", "hi")).await;
        a.dispatch(ClientEvent::join("lobby")).await;

        let events = drain(&mut out_a);
        let codes: Vec<ErrorCode> = events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::Error(payload) => Some(payload.code),
                _ => None,
            })
            .collect();
        assert_eq!(
            codes,
            vec![
                ErrorCode::RoomJoinError,
                ErrorCode::RoomLeaveError,
                ErrorCode::MessageSendError
            ]
        );
        assert_eq!(events.last(), Some(&ServerEvent::joined("lobby")));
        assert!(f.gateway.registry().contains(a.id()));
    }

    #[tokio::test]
    async fn test_room_limit_reports_join_error() {
        let f = fixture(GatewayConfig {
            membership: MembershipConfig {
                max_rooms: 10,
                max_rooms_per_connection: 1,
            },
            ..GatewayConfig::default()
        });
        let (a, mut out_a) = f.gateway.connect(None);

        a.dispatch(ClientEvent::join("one")).await;
        a.dispatch(ClientEvent::join("two")).await;

        assert_eq!(
            drain(&mut out_a),
            vec![
                ServerEvent::joined("one"),
                ServerEvent::error(ErrorCode::RoomJoinError, "Failed to join room"),
            ]
        );
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let f = fixture(GatewayConfig {
            max_message_length: 4,
            ..GatewayConfig::default()
        });
        let (a, mut out_a) = f.gateway.connect(None);
        a.dispatch(ClientEvent::join("lobby")).await;
        drain(&mut out_a);

        a.dispatch(ClientEvent::send("lobby", "too long")).await;

        match drain(&mut out_a).as_slice() {
            [ServerEvent::Error(payload)] => assert_eq!(payload.code, ErrorCode::MessageSendError),
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stalled_member_does_not_block_room() {
        let f = fixture(GatewayConfig {
            outbound_capacity: 2,
            ..GatewayConfig::default()
        });
        let (a, mut out_a) = f.gateway.connect(None);
        let (b, _out_b) = f.gateway.connect(None);
        a.dispatch(ClientEvent::join("lobby")).await;
        b.dispatch(ClientEvent::join("lobby")).await;
        drain(&mut out_a);

        // b never drains, so its queue fills up after the first message.
        for _ in 0..5 {
            a.dispatch(ClientEvent::send("lobby", "ping")).await;
            assert_eq!(drain(&mut out_a).len(), 1);
        }
        assert_eq!(f.rooms.member_count("lobby"), 2);
        f.rooms.check_consistency().unwrap();
    }

    /// Delegates to [`LocalRooms`] but refuses to leave one room.
    struct FailingLeave {
        inner: Arc<LocalRooms>,
        broken: &'static str,
    }

    #[async_trait::async_trait]
    impl RoomService for FailingLeave {
        async fn join_room(&self, connection: &ConnectionId, room: &str) -> Result<bool, RoomError> {
            self.inner.join_room(connection, room).await
        }

        async fn leave_room(&self, connection: &ConnectionId, room: &str) -> Result<bool, RoomError> {
            if room == self.broken {
                return Err(RoomError::Backend("store unavailable".into()));
            }
            self.inner.leave_room(connection, room).await
        }

        async fn broadcast_to_room(&self, room: &str, event: ServerEvent) -> BroadcastReport {
            self.inner.broadcast_to_room(room, event).await
        }

        fn purge_connection(&self, connection: &ConnectionId, rooms: &[RoomId]) -> usize {
            self.inner.purge_connection(connection, rooms)
        }

        fn members(&self, room: &str) -> Vec<ConnectionId> {
            self.inner.members(room)
        }

        fn stats(&self) -> RoomStats {
            self.inner.stats()
        }
    }

    #[tokio::test]
    async fn test_failed_leave_does_not_strand_membership() {
        let registry = Arc::new(ConnectionRegistry::new(16));
        let local = Arc::new(LocalRooms::new(Arc::clone(&registry)));
        let service: Arc<dyn RoomService> = Arc::new(FailingLeave {
            inner: Arc::clone(&local),
            broken: "bad",
        });
        let gateway = Gateway::new(registry, Arc::clone(&service))
            .with_handler(RoomHandler::new(service));

        let (a, _out_a) = gateway.connect(None);
        let (b, _out_b) = gateway.connect(None);
        for room in ["x", "bad", "y"] {
            a.dispatch(ClientEvent::join(room)).await;
        }
        b.dispatch(ClientEvent::join("bad")).await;

        let teardown = gateway.disconnect(a.id()).await;
        assert_eq!(
            teardown,
            Teardown {
                rooms_left: 2,
                failures: 1
            }
        );

        assert!(!local.room_exists("x"));
        assert!(!local.room_exists("y"));
        assert_eq!(local.members("bad"), vec![b.id().clone()]);
        local.check_consistency().unwrap();

        let report = gateway
            .rooms()
            .broadcast_to_room("bad", ServerEvent::joined("bad"))
            .await;
        assert_eq!((report.recipients, report.failed), (1, 0));
    }

    struct LeaveCounter(Arc<AtomicUsize>);

    impl Handler for LeaveCounter {
        fn attach(&self, listeners: &mut Listeners) {
            let seen = Arc::clone(&self.0);
            listeners.on(move |_socket: Socket, _request: LeaveRoom| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(HandlerError::new(ErrorCode::RoomLeaveError, "audit failed"))
                }
            });
        }
    }

    #[tokio::test]
    async fn test_extra_handler_is_independent() {
        let seen = Arc::new(AtomicUsize::new(0));
        let f = fixture(GatewayConfig::default());
        let gateway = f.gateway.with_handler(LeaveCounter(Arc::clone(&seen)));
        assert_eq!(gateway.handler_count(), 3);

        let (a, mut out_a) = gateway.connect(None);
        a.dispatch(ClientEvent::join("lobby")).await;
        a.dispatch(ClientEvent::leave("lobby")).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let events = drain(&mut out_a);
        assert!(events.contains(&ServerEvent::left("lobby")));
        assert!(events.contains(&ServerEvent::error(ErrorCode::RoomLeaveError, "audit failed")));
        assert!(!f.rooms.room_exists("lobby"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sessions_stay_consistent() {
        let f = fixture(GatewayConfig::default());
        let gateway = Arc::new(f.gateway);

        let mut tasks = Vec::new();
        for i in 0..16usize {
            let gateway = Arc::clone(&gateway);
            tasks.push(tokio::spawn(async move {
                let (session, _out) = gateway.connect(None);
                for j in 0..20usize {
                    session
                        .dispatch(ClientEvent::join(format!("room-{}", (i + j) % 4)))
                        .await;
                    session
                        .dispatch(ClientEvent::send(format!("room-{}", j % 4), "hey"))
                        .await;
                }
                if i % 2 == 0 {
                    gateway.disconnect(session.id()).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        f.rooms.check_consistency().unwrap();
        assert_eq!(gateway.registry().len(), 8);
    }
}
