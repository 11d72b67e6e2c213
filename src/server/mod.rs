//! Multi-room chat server
//!
//! ## Task Layout
//!
//! - **Listener**: accepts TCP connections and spawns one session each
//! - **Session task**: reads frames, dispatches commands, owns login and room state
//! - **Writer task**: sole writer of a session's socket, drains its outbox in order
//! - **Rooms**: shared membership sets; broadcast enqueues onto member outboxes

pub mod chat_server;
pub mod outbox;
pub mod room_manager;
pub mod session;

pub use chat_server::{ChatServer, DEFAULT_PORT, DEFAULT_ROOM, ServerConfig, ServerStats, seed_rooms};
pub use outbox::{MemberHandle, Outbox, OutboundQueue, SessionId};
pub use room_manager::{Room, RoomRegistry};
pub use session::{Session, SessionConfig, SessionPhase};
