//! # huddle-protocol
//!
//! Wire protocol definitions for the Huddle room gateway.
//!
//! ## Events
//!
//! - `room:join` / `room:leave` - Room membership requests
//! - `message:send` - Broadcast a message to a room
//! - `message:receive` - Fan-out delivery
//! - `room:joined` / `room:left` - Membership acknowledgments
//! - `error` - An operation failed; the connection stays open
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, ClientEvent, Encoding};
//!
//! let frame = codec::encode(&ClientEvent::join("lobby"), Encoding::Json).unwrap();
//! let decoded: ClientEvent = codec::decode(frame.as_bytes(), Encoding::Json).unwrap();
//! assert_eq!(decoded.room_id(), "lobby");
//! ```

pub mod codec;
pub mod events;
pub mod version;

pub use codec::{decode, encode, Encoding, FrameCodec, ProtocolError, WireFrame};
pub use events::{
    ClientEvent, Direction, ErrorCode, ErrorPayload, EventKind, JoinRoom, LeaveRoom,
    MessageReceived, RoomAck, RoomId, SendMessage, ServerEvent, UserId,
};
pub use version::{Version, VersionMismatch, PROTOCOL_VERSION};
