//! In-process store backed by plain collections

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use super::{
    ChatStore, RoomId, StoreError, StoreResult, UserId, format_history, hash_password, new_salt,
    validate_name,
};

#[derive(Debug)]
struct UserRecord {
    salt: String,
    password_hash: String,
}

#[derive(Debug)]
struct RoomRecord {
    id: RoomId,
    /// (username, text), oldest first
    messages: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<String, UserRecord>,
    rooms: BTreeMap<String, RoomRecord>,
    next_user_id: UserId,
    next_room_id: RoomId,
}

/// Volatile [`ChatStore`] implementation.
///
/// Nothing survives a restart. Useful for tests and throwaway servers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already contains the given rooms
    pub fn with_rooms<I, S>(rooms: I) -> StoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let store = Self::new();
        for room in rooms {
            store.ensure_room(room.as_ref())?;
        }
        Ok(store)
    }
}

impl ChatStore for MemoryStore {
    fn verify_login(&self, username: &str, password: &str) -> StoreResult<bool> {
        let inner = self.inner.lock();
        Ok(inner
            .users
            .get(username)
            .map(|user| user.password_hash == hash_password(&user.salt, password))
            .unwrap_or(false))
    }

    fn is_unique(&self, username: &str) -> StoreResult<bool> {
        Ok(!self.inner.lock().users.contains_key(username))
    }

    fn create_user(&self, username: &str, password: &str) -> StoreResult<UserId> {
        validate_name("user", username)?;

        let mut inner = self.inner.lock();
        if inner.users.contains_key(username) {
            return Err(StoreError::DuplicateUser(username.to_string()));
        }

        inner.next_user_id += 1;
        let id = inner.next_user_id;
        let salt = new_salt();
        let password_hash = hash_password(&salt, password);
        inner.users.insert(
            username.to_string(),
            UserRecord {
                salt,
                password_hash,
            },
        );
        Ok(id)
    }

    fn insert_message(&self, room: &str, username: &str, text: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .rooms
            .get_mut(room)
            .ok_or_else(|| StoreError::UnknownRoom(room.to_string()))?;
        record
            .messages
            .push((username.to_string(), text.to_string()));
        Ok(())
    }

    fn room_id(&self, name: &str) -> StoreResult<Option<RoomId>> {
        Ok(self.inner.lock().rooms.get(name).map(|room| room.id))
    }

    fn room_names(&self) -> StoreResult<Vec<String>> {
        Ok(self.inner.lock().rooms.keys().cloned().collect())
    }

    fn recent_messages(&self, room: &str, limit: usize) -> StoreResult<String> {
        let inner = self.inner.lock();
        let record = inner
            .rooms
            .get(room)
            .ok_or_else(|| StoreError::UnknownRoom(room.to_string()))?;

        let skip = record.messages.len().saturating_sub(limit);
        Ok(format_history(
            record.messages[skip..]
                .iter()
                .map(|(user, text)| (user.as_str(), text.as_str())),
        ))
    }

    fn ensure_room(&self, name: &str) -> StoreResult<RoomId> {
        validate_name("room", name)?;

        let mut inner = self.inner.lock();
        if let Some(room) = inner.rooms.get(name) {
            return Ok(room.id);
        }

        inner.next_room_id += 1;
        let id = inner.next_room_id;
        inner.rooms.insert(
            name.to_string(),
            RoomRecord {
                id,
                messages: Vec::new(),
            },
        );
        Ok(id)
    }
}
