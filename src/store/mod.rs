//! Persistence port for users, rooms and message history
//!
//! The server only talks to storage through [`ChatStore`]. Calls are
//! synchronous and are made inline from a session's read task, which is
//! fine for an embedded database such as SQLite.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Numeric user identifier assigned by the store
pub type UserId = i64;

/// Numeric room identifier assigned by the store
pub type RoomId = i64;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Store failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Username already taken
    #[error("user already exists: {0}")]
    DuplicateUser(String),
    /// Room name unknown to the store
    #[error("unknown room: {0}")]
    UnknownRoom(String),
    /// Rejected input (empty names and similar)
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Synchronous persistence contract used by sessions and the server bootstrap.
pub trait ChatStore: Send + Sync {
    /// Check a username/password pair. Unknown users verify as `false`.
    fn verify_login(&self, username: &str, password: &str) -> StoreResult<bool>;

    /// `true` when no user with this name exists yet.
    fn is_unique(&self, username: &str) -> StoreResult<bool>;

    /// Create a user and return its id.
    fn create_user(&self, username: &str, password: &str) -> StoreResult<UserId>;

    /// Append a message to a room's history.
    fn insert_message(&self, room: &str, username: &str, text: &str) -> StoreResult<()>;

    /// Look up a room id by name.
    fn room_id(&self, name: &str) -> StoreResult<Option<RoomId>>;

    /// All room names, sorted.
    fn room_names(&self) -> StoreResult<Vec<String>>;

    /// The newest `limit` messages of a room, oldest first, formatted by
    /// [`format_history`].
    fn recent_messages(&self, room: &str, limit: usize) -> StoreResult<String>;

    /// Create the room if it does not exist yet and return its id.
    fn ensure_room(&self, name: &str) -> StoreResult<RoomId>;
}

/// Render one history line the same way a live broadcast is rendered.
pub fn format_line(username: &str, text: &str) -> String {
    format!("[{}]: {}", username, text)
}

/// Join history entries (oldest first) into the LOGS payload.
pub fn format_history<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    entries
        .into_iter()
        .map(|(username, text)| format_line(username, text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Salted SHA-256 of a password, hex encoded.
pub(crate) fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fresh random salt for a new user.
pub(crate) fn new_salt() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub(crate) fn validate_name(kind: &str, name: &str) -> StoreResult<()> {
    if name.is_empty() || name.contains(['\n', '\r']) {
        return Err(StoreError::InvalidInput(format!("{} name {:?}", kind, name)));
    }
    Ok(())
}
