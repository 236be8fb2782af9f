use super::checked_room;
use crate::handler::{Handler, HandlerError, Listeners, Socket};
use crate::membership::RoomService;
use huddle_protocol::{ErrorCode, JoinRoom, LeaveRoom, ServerEvent};
use std::sync::Arc;
use tracing::{debug, warn};

/// Handles `room:join` and `room:leave`.
///
/// Successful requests are acknowledged to the requester with `room:joined`
/// or `room:left`, including repeated ones.
pub struct RoomHandler {
    rooms: Arc<dyn RoomService>,
}

impl RoomHandler {
    #[must_use]
    pub fn new(rooms: Arc<dyn RoomService>) -> Self {
        Self { rooms }
    }
}

impl Handler for RoomHandler {
    fn attach(&self, listeners: &mut Listeners) {
        let rooms = Arc::clone(&self.rooms);
        listeners.on(move |socket: Socket, request: JoinRoom| {
            let rooms = Arc::clone(&rooms);
            async move { join(rooms.as_ref(), &socket, request).await }
        });

        let rooms = Arc::clone(&self.rooms);
        listeners.on(move |socket: Socket, request: LeaveRoom| {
            let rooms = Arc::clone(&rooms);
            async move { leave(rooms.as_ref(), &socket, request).await }
        });
    }
}

async fn join(
    rooms: &dyn RoomService,
    socket: &Socket,
    request: JoinRoom,
) -> Result<(), HandlerError> {
    checked_room(&request.room_id, ErrorCode::RoomJoinError, "Failed to join room")?;

    let joined = rooms
        .join_room(socket.id(), &request.room_id)
        .await
        .map_err(|e| {
            HandlerError::new(ErrorCode::RoomJoinError, "Failed to join room").with_cause(e)
        })?;

    debug!(room = %request.room_id, new = joined, "Join request handled");
    acknowledge(socket, ServerEvent::joined(request.room_id));
    Ok(())
}

async fn leave(
    rooms: &dyn RoomService,
    socket: &Socket,
    request: LeaveRoom,
) -> Result<(), HandlerError> {
    checked_room(&request.room_id, ErrorCode::RoomLeaveError, "Failed to leave room")?;

    let left = rooms
        .leave_room(socket.id(), &request.room_id)
        .await
        .map_err(|e| {
            HandlerError::new(ErrorCode::RoomLeaveError, "Failed to leave room").with_cause(e)
        })?;

    debug!(room = %request.room_id, was_member = left, "Leave request handled");
    acknowledge(socket, ServerEvent::left(request.room_id));
    Ok(())
}

fn acknowledge(socket: &Socket, ack: ServerEvent) {
    if let Err(e) = socket.emit(ack) {
        warn!(error = %e, "Could not acknowledge room request");
    }
}
