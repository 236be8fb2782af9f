use super::checked_room;
use crate::handler::{Handler, HandlerError, Listeners, Socket};
use crate::membership::RoomService;
use crate::message::ChatMessage;
use huddle_protocol::{ErrorCode, SendMessage};
use std::sync::Arc;
use tracing::debug;

/// Handles `message:send` by broadcasting `message:receive` to the room.
///
/// The sender is not filtered out: if it is a member of the room it gets its
/// own message back, which doubles as a delivery receipt.
pub struct MessageHandler {
    rooms: Arc<dyn RoomService>,
    max_message_length: usize,
}

impl MessageHandler {
    #[must_use]
    pub fn new(rooms: Arc<dyn RoomService>, max_message_length: usize) -> Self {
        Self {
            rooms,
            max_message_length,
        }
    }
}

impl Handler for MessageHandler {
    fn attach(&self, listeners: &mut Listeners) {
        let rooms = Arc::clone(&self.rooms);
        let max_len = self.max_message_length;
        listeners.on(move |socket: Socket, request: SendMessage| {
            let rooms = Arc::clone(&rooms);
            async move { send(rooms.as_ref(), &socket, request, max_len).await }
        });
    }
}

async fn send(
    rooms: &dyn RoomService,
    socket: &Socket,
    request: SendMessage,
    max_len: usize,
) -> Result<(), HandlerError> {
    checked_room(&request.room_id, ErrorCode::MessageSendError, "Failed to send message")?;
    if request.message.len() > max_len {
        return Err(HandlerError::new(
            ErrorCode::MessageSendError,
            format!("Failed to send message: longer than {max_len} bytes"),
        ));
    }

    let message = ChatMessage::new(
        request.room_id,
        socket.user_id().map(str::to_owned),
        request.message,
    );
    let room = message.room.clone();
    let report = rooms.broadcast_to_room(&room, message.into_event()).await;

    debug!(
        room = %room,
        recipients = report.recipients,
        delivered = report.delivered,
        failed = report.failed,
        "Message broadcast"
    );
    Ok(())
}
