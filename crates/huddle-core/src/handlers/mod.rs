//! The standard handler set.

mod message;
mod room;

pub use message::MessageHandler;
pub use room::RoomHandler;

use huddle_protocol::ErrorCode;
use thiserror::Error;

use crate::handler::HandlerError;
use crate::room::validate_room_id;

/// A room id rejected before reaching the membership service.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct InvalidRoomId(pub &'static str);

fn checked_room(room_id: &str, code: ErrorCode, action: &str) -> Result<(), HandlerError> {
    validate_room_id(room_id).map_err(|reason| {
        HandlerError::new(code, format!("{action}: {reason}")).with_cause(InvalidRoomId(reason))
    })
}
