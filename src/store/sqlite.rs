//! SQLite-backed store

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use tracing::{debug, info};

use super::{
    ChatStore, RoomId, StoreError, StoreResult, UserId, format_history, hash_password, new_salt,
    validate_name,
};
use crate::current_timestamp;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    username      TEXT NOT NULL UNIQUE,
    salt          TEXT NOT NULL,
    password_hash TEXT NOT NULL,
    created_at    INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS rooms (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS messages (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id  INTEGER NOT NULL REFERENCES rooms(id),
    username TEXT NOT NULL,
    body     TEXT NOT NULL,
    sent_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_room ON messages(room_id, id);
";

/// [`ChatStore`] persisted in a single SQLite database file.
///
/// One connection is shared behind a mutex; every call holds it only for the
/// duration of its statements.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!("Opened chat database at {}", path.display());
        Self::init(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lookup_room(conn: &Connection, name: &str) -> StoreResult<Option<RoomId>> {
        Ok(conn
            .query_row("SELECT id FROM rooms WHERE name = ?1", params![name], |row| {
                row.get(0)
            })
            .optional()?)
    }
}

impl ChatStore for SqliteStore {
    fn verify_login(&self, username: &str, password: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let stored: Option<(String, String)> = conn
            .query_row(
                "SELECT salt, password_hash FROM users WHERE username = ?1",
                params![username],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(stored
            .map(|(salt, hash)| hash == hash_password(&salt, password))
            .unwrap_or(false))
    }

    fn is_unique(&self, username: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM users WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )?;
        Ok(count == 0)
    }

    fn create_user(&self, username: &str, password: &str) -> StoreResult<UserId> {
        validate_name("user", username)?;

        let salt = new_salt();
        let password_hash = hash_password(&salt, password);

        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO users (username, salt, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![username, salt, password_hash, current_timestamp() as i64],
        );

        match inserted {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                debug!("Created user {} with id {}", username, id);
                Ok(id)
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateUser(username.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn insert_message(&self, room: &str, username: &str, text: &str) -> StoreResult<()> {
        let conn = self.conn.lock();
        let room_id = Self::lookup_room(&conn, room)?
            .ok_or_else(|| StoreError::UnknownRoom(room.to_string()))?;

        conn.execute(
            "INSERT INTO messages (room_id, username, body, sent_at) VALUES (?1, ?2, ?3, ?4)",
            params![room_id, username, text, current_timestamp() as i64],
        )?;
        Ok(())
    }

    fn room_id(&self, name: &str) -> StoreResult<Option<RoomId>> {
        let conn = self.conn.lock();
        Self::lookup_room(&conn, name)
    }

    fn room_names(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name FROM rooms ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    fn recent_messages(&self, room: &str, limit: usize) -> StoreResult<String> {
        let conn = self.conn.lock();
        let room_id = Self::lookup_room(&conn, room)?
            .ok_or_else(|| StoreError::UnknownRoom(room.to_string()))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(
            "SELECT username, body FROM messages WHERE room_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows = stmt
            .query_map(params![room_id, limit], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        // Newest first from the query, oldest first on the wire
        rows.reverse();
        Ok(format_history(
            rows.iter().map(|(user, body)| (user.as_str(), body.as_str())),
        ))
    }

    fn ensure_room(&self, name: &str) -> StoreResult<RoomId> {
        validate_name("room", name)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO rooms (name) VALUES (?1)",
            params![name],
        )?;
        Self::lookup_room(&conn, name)?.ok_or_else(|| StoreError::UnknownRoom(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_users_round_through_database() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.is_unique("alice").unwrap());

        store.create_user("alice", "secret123").unwrap();
        assert!(!store.is_unique("alice").unwrap());
        assert!(store.verify_login("alice", "secret123").unwrap());
        assert!(!store.verify_login("alice", "nope").unwrap());

        let err = store.create_user("alice", "again").unwrap_err();
        assert!(matches!(err, StoreError::DuplicateUser(_)));
    }

    #[test]
    fn test_history_newest_bounded() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.ensure_room("general").unwrap();
        for i in 0..5 {
            store
                .insert_message("general", "alice", &format!("msg {}", i))
                .unwrap();
        }

        assert_eq!(
            store.recent_messages("general", 2).unwrap(),
            "[alice]: msg 3\n[alice]: msg 4"
        );
        assert!(matches!(
            store.recent_messages("missing", 2),
            Err(StoreError::UnknownRoom(_))
        ));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.ensure_room("general").unwrap();
            store.ensure_room("random").unwrap();
            store.create_user("bob", "hunter2").unwrap();
            store.insert_message("random", "bob", "still here").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.room_names().unwrap(), vec!["general", "random"]);
        assert!(store.verify_login("bob", "hunter2").unwrap());
        assert_eq!(
            store.recent_messages("random", 10).unwrap(),
            "[bob]: still here"
        );
    }
}
