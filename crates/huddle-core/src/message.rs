//! Transient chat messages.
//!
//! A message only lives for the duration of one fan-out; nothing is stored.

use huddle_protocol::{MessageReceived, RoomId, ServerEvent, UserId};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A message on its way to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Target room.
    pub room: RoomId,
    /// Sender's user id, if the connection is authenticated.
    pub from: Option<UserId>,
    /// Message text.
    pub text: String,
    /// Send time in milliseconds since the Unix epoch.
    pub sent_at: u64,
}

impl ChatMessage {
    /// Create a message stamped with the current time.
    #[must_use]
    pub fn new(room: impl Into<RoomId>, from: Option<UserId>, text: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            from,
            text: text.into(),
            sent_at: now_millis(),
        }
    }

    /// The `message:receive` event delivered to room members.
    #[must_use]
    pub fn into_event(self) -> ServerEvent {
        ServerEvent::MessageReceive(MessageReceived {
            message: self.text,
            from: self.from,
            timestamp: self.sent_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let before = now_millis();
        let msg = ChatMessage::new("lobby", Some("alice".into()), "hi");
        assert_eq!(msg.room, "lobby");
        assert!(msg.sent_at >= before);
    }

    #[test]
    fn test_into_event() {
        let msg = ChatMessage {
            room: "lobby".into(),
            from: None,
            text: "hi".into(),
            sent_at: 7,
        };
        match msg.into_event() {
            ServerEvent::MessageReceive(payload) => {
                assert_eq!(payload.message, "hi");
                assert_eq!(payload.from, None);
                assert_eq!(payload.timestamp, 7);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
