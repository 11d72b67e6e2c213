//! Multi-room chat server speaking a line-oriented TCP protocol
//!
//! Clients authenticate, select a room, post messages that are relayed to
//! every other member of that room, and fetch recent room history. Users,
//! rooms and messages are persisted through a pluggable [`store::ChatStore`].

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod store;

pub use client::{ChatClient, ChatClientConfig, ClientEvent};
pub use error::{ChatError, Result};
pub use server::{ChatServer, ServerConfig};
pub use store::{ChatStore, MemoryStore, SqliteStore};

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
