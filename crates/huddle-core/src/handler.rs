//! Handler abstraction.
//!
//! A [`Handler`] attaches typed listeners to each new connection. Listeners
//! are keyed by payload type, so a listener for `room:join` can only ever be
//! handed a [`JoinRoom`].
//!
//! A listener that fails returns a [`HandlerError`]. The dispatch boundary
//! logs it and sends an `error` event back to the originating connection;
//! the connection stays open. A listener that panics is reported the same way.

use crate::connection::{ConnectionId, ConnectionRegistry, DeliveryError};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use huddle_protocol::{
    ClientEvent, ErrorCode, EventKind, JoinRoom, LeaveRoom, RoomId, SendMessage, ServerEvent,
    UserId,
};
use std::any::Any;
use std::error::Error as StdError;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace, warn, Span};

/// A unit of behavior composed into every connection.
pub trait Handler: Send + Sync {
    /// Register this handler's listeners on a freshly accepted connection.
    fn attach(&self, listeners: &mut Listeners);
}

/// A failure inside a listener, reported to the peer as an `error` event.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Code sent to the peer.
    pub code: ErrorCode,
    /// Message sent to the peer.
    pub message: String,
    /// Underlying cause, logged but not sent.
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl HandlerError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    #[must_use]
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

/// Future returned by a listener.
pub type ListenerFuture = BoxFuture<'static, Result<(), HandlerError>>;

/// A boxed listener for payload type `E`.
pub type Listener<E> = Box<dyn Fn(Socket, E) -> ListenerFuture + Send + Sync>;

/// An inbound payload type that listeners can be registered for.
pub trait Inbound: Clone + Send + Sized + 'static {
    /// The event this payload belongs to.
    const KIND: EventKind;

    #[doc(hidden)]
    fn slot(listeners: &mut Listeners) -> &mut Vec<Listener<Self>>;
}

impl Inbound for JoinRoom {
    const KIND: EventKind = EventKind::RoomJoin;

    fn slot(listeners: &mut Listeners) -> &mut Vec<Listener<Self>> {
        &mut listeners.room_join
    }
}

impl Inbound for LeaveRoom {
    const KIND: EventKind = EventKind::RoomLeave;

    fn slot(listeners: &mut Listeners) -> &mut Vec<Listener<Self>> {
        &mut listeners.room_leave
    }
}

impl Inbound for SendMessage {
    const KIND: EventKind = EventKind::MessageSend;

    fn slot(listeners: &mut Listeners) -> &mut Vec<Listener<Self>> {
        &mut listeners.message_send
    }
}

/// The listeners attached to one connection.
#[derive(Default)]
pub struct Listeners {
    room_join: Vec<Listener<JoinRoom>>,
    room_leave: Vec<Listener<LeaveRoom>>,
    message_send: Vec<Listener<SendMessage>>,
}

impl Listeners {
    /// Register a listener for the event carrying payload `E`.
    pub fn on<E, F, Fut>(&mut self, listener: F) -> &mut Self
    where
        E: Inbound,
        F: Fn(Socket, E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        trace!(event = %E::KIND, "Listener attached");
        E::slot(self).push(Box::new(move |socket: Socket, payload: E| -> ListenerFuture {
            Box::pin(listener(socket, payload))
        }));
        self
    }

    /// Number of listeners registered for an event.
    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::RoomJoin => self.room_join.len(),
            EventKind::RoomLeave => self.room_leave.len(),
            EventKind::MessageSend => self.message_send.len(),
            _ => 0,
        }
    }

    /// Run every listener registered for `event`, one after another.
    pub async fn dispatch(&self, socket: &Socket, event: ClientEvent) {
        let kind = event.kind();
        let pending: Vec<ListenerFuture> = match event {
            ClientEvent::RoomJoin(payload) => invoke(&self.room_join, socket, payload),
            ClientEvent::RoomLeave(payload) => invoke(&self.room_leave, socket, payload),
            ClientEvent::MessageSend(payload) => invoke(&self.message_send, socket, payload),
        };

        if pending.is_empty() {
            debug!(event = %kind, "No listener registered");
            return;
        }

        for listener in pending {
            match AssertUnwindSafe(listener).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => report_failure(socket, kind, err),
                Err(panic) => {
                    let err = HandlerError::new(failure_code(kind), "Internal error")
                        .with_cause(ListenerPanic(panic_message(panic.as_ref())));
                    report_failure(socket, kind, err);
                }
            }
        }
    }
}

/// A listener panicked; the panic is contained at the dispatch boundary.
#[derive(Debug, Error)]
#[error("listener panicked: {0}")]
struct ListenerPanic(String);

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn failure_code(kind: EventKind) -> ErrorCode {
    match kind {
        EventKind::RoomJoin => ErrorCode::RoomJoinError,
        EventKind::RoomLeave => ErrorCode::RoomLeaveError,
        EventKind::MessageSend => ErrorCode::MessageSendError,
        _ => ErrorCode::InvalidPayload,
    }
}

fn invoke<E: Inbound>(
    listeners: &[Listener<E>],
    socket: &Socket,
    payload: E,
) -> Vec<ListenerFuture> {
    listeners
        .iter()
        .map(|listener| listener(socket.clone(), payload.clone()))
        .collect()
}

fn report_failure(socket: &Socket, kind: EventKind, err: HandlerError) {
    error!(
        event = %kind,
        code = %err.code,
        error = %err,
        cause = ?err.cause.as_ref().map(|c| c.to_string()),
        "Handler failed"
    );

    if let Err(e) = socket.emit(ServerEvent::error(err.code, err.message)) {
        warn!(event = %kind, error = %e, "Could not report failure to peer");
    }
}

struct SocketInner {
    id: ConnectionId,
    user_id: Option<UserId>,
    registry: Arc<ConnectionRegistry>,
    span: Span,
}

/// Handle to one connection, passed to listeners.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    pub(crate) fn new(
        id: ConnectionId,
        user_id: Option<UserId>,
        registry: Arc<ConnectionRegistry>,
        span: Span,
    ) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                id,
                user_id,
                registry,
                span,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// The authenticated user, if any.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.inner.user_id.as_deref()
    }

    /// Rooms this connection currently belongs to, sorted.
    #[must_use]
    pub fn rooms(&self) -> Vec<RoomId> {
        let mut rooms = self.inner.registry.rooms_of(&self.inner.id);
        rooms.sort();
        rooms
    }

    /// Queue an event for this connection only.
    ///
    /// # Errors
    ///
    /// Fails if the connection is gone or its queue is full.
    pub fn emit(&self, event: ServerEvent) -> Result<(), DeliveryError> {
        self.inner.registry.emit(&self.inner.id, Arc::new(event))
    }

    /// The connection's tracing span.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.inner.span
    }
}
