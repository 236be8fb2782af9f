//! Event vocabulary for the Huddle protocol.
//!
//! Every frame on the wire is an envelope of the form
//! `{"event": "<name>", "data": { ... }}`. Inbound and outbound events are
//! separate enums so a peer can never produce a gateway-only event.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A room identifier.
pub type RoomId = String;

/// An opaque authenticated user identifier.
pub type UserId = String;

/// Which side produces an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Raised by the transport itself, never framed.
    Transport,
    /// Sent by a peer to the gateway.
    Inbound,
    /// Sent by the gateway to a peer.
    Outbound,
}

/// The closed set of event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    RoomJoin,
    RoomJoined,
    RoomLeave,
    RoomLeft,
    MessageSend,
    MessageReceive,
    Error,
}

impl EventKind {
    /// All event kinds.
    pub const ALL: [EventKind; 9] = [
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::RoomJoin,
        EventKind::RoomJoined,
        EventKind::RoomLeave,
        EventKind::RoomLeft,
        EventKind::MessageSend,
        EventKind::MessageReceive,
        EventKind::Error,
    ];

    /// The stable wire name of this event.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::RoomJoin => "room:join",
            EventKind::RoomJoined => "room:joined",
            EventKind::RoomLeave => "room:leave",
            EventKind::RoomLeft => "room:left",
            EventKind::MessageSend => "message:send",
            EventKind::MessageReceive => "message:receive",
            EventKind::Error => "error",
        }
    }

    /// Look up an event kind by wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Which side produces this event.
    #[must_use]
    pub const fn direction(self) -> Direction {
        match self {
            EventKind::Connect | EventKind::Disconnect => Direction::Transport,
            EventKind::RoomJoin | EventKind::RoomLeave | EventKind::MessageSend => {
                Direction::Inbound
            }
            EventKind::RoomJoined
            | EventKind::RoomLeft
            | EventKind::MessageReceive
            | EventKind::Error => Direction::Outbound,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable machine-readable error codes carried by `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RoomJoinError,
    RoomLeaveError,
    MessageSendError,
    /// The frame could not be decoded into a known event.
    InvalidPayload,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::RoomJoinError => "ROOM_JOIN_ERROR",
            ErrorCode::RoomLeaveError => "ROOM_LEAVE_ERROR",
            ErrorCode::MessageSendError => "MESSAGE_SEND_ERROR",
            ErrorCode::InvalidPayload => "INVALID_PAYLOAD",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `room:join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub room_id: RoomId,
}

/// Payload of `room:leave`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRoom {
    pub room_id: RoomId,
}

/// Payload of `message:send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub room_id: RoomId,
    pub message: String,
}

/// Payload of `message:receive`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceived {
    pub message: String,
    /// Sender's user id, `None` for anonymous connections.
    pub from: Option<UserId>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Payload of `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub code: ErrorCode,
}

/// Payload of `room:joined` and `room:left`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomAck {
    pub room_id: RoomId,
}

/// An event sent by a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "room:join")]
    RoomJoin(JoinRoom),

    #[serde(rename = "room:leave")]
    RoomLeave(LeaveRoom),

    #[serde(rename = "message:send")]
    MessageSend(SendMessage),
}

impl ClientEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::RoomJoin(_) => EventKind::RoomJoin,
            ClientEvent::RoomLeave(_) => EventKind::RoomLeave,
            ClientEvent::MessageSend(_) => EventKind::MessageSend,
        }
    }

    /// The room this event targets.
    #[must_use]
    pub fn room_id(&self) -> &str {
        match self {
            ClientEvent::RoomJoin(p) => &p.room_id,
            ClientEvent::RoomLeave(p) => &p.room_id,
            ClientEvent::MessageSend(p) => &p.room_id,
        }
    }

    #[must_use]
    pub fn join(room_id: impl Into<RoomId>) -> Self {
        ClientEvent::RoomJoin(JoinRoom {
            room_id: room_id.into(),
        })
    }

    #[must_use]
    pub fn leave(room_id: impl Into<RoomId>) -> Self {
        ClientEvent::RoomLeave(LeaveRoom {
            room_id: room_id.into(),
        })
    }

    #[must_use]
    pub fn send(room_id: impl Into<RoomId>, message: impl Into<String>) -> Self {
        ClientEvent::MessageSend(SendMessage {
            room_id: room_id.into(),
            message: message.into(),
        })
    }
}

/// An event sent by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message:receive")]
    MessageReceive(MessageReceived),

    #[serde(rename = "error")]
    Error(ErrorPayload),

    #[serde(rename = "room:joined")]
    RoomJoined(RoomAck),

    #[serde(rename = "room:left")]
    RoomLeft(RoomAck),
}

impl ServerEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::MessageReceive(_) => EventKind::MessageReceive,
            ServerEvent::Error(_) => EventKind::Error,
            ServerEvent::RoomJoined(_) => EventKind::RoomJoined,
            ServerEvent::RoomLeft(_) => EventKind::RoomLeft,
        }
    }

    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            message: message.into(),
            code,
        })
    }

    #[must_use]
    pub fn joined(room_id: impl Into<RoomId>) -> Self {
        ServerEvent::RoomJoined(RoomAck {
            room_id: room_id.into(),
        })
    }

    #[must_use]
    pub fn left(room_id: impl Into<RoomId>) -> Self {
        ServerEvent::RoomLeft(RoomAck {
            room_id: room_id.into(),
        })
    }
}
