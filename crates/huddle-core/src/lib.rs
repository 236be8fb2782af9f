//! # huddle-core
//!
//! Room membership, event handlers and connection lifecycle for the Huddle
//! messaging gateway.
//!
//! - **Connection** - Registry of live connections and their outbound queues
//! - **Membership** - Room join/leave and broadcast behind [`RoomService`]
//! - **Handler** - Typed listeners attached to every connection
//! - **Gateway** - Binds handlers on connect, tears membership down on disconnect
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Gateway   │────▶│  Handlers   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │                   ▼                   ▼
//!        │            ┌─────────────┐     ┌─────────────┐
//!        └────────────│  Registry   │◀────│ RoomService │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod connection;
pub mod gateway;
pub mod handler;
pub mod handlers;
pub mod membership;
pub mod message;
pub mod room;

pub use connection::{
    ConnectionId, ConnectionInfo, ConnectionRegistry, DeliveryError, Outbound,
};
pub use gateway::{Gateway, GatewayConfig, Session, Teardown};
pub use handler::{Handler, HandlerError, Inbound, Listeners, Socket};
pub use handlers::{MessageHandler, RoomHandler};
pub use membership::{
    BroadcastReport, LocalRooms, MembershipConfig, RoomError, RoomService, RoomStats,
};
pub use message::ChatMessage;
pub use room::{validate_room_id, MAX_ROOM_ID_LENGTH};
