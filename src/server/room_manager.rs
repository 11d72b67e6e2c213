//! Room management for the chat server
//!
//! This module handles server-side room state: the fixed set of rooms, which
//! sessions are currently in each room, and fan-out of broadcasts.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::outbox::{MemberHandle, SessionId};
use crate::error::Result;
use crate::store::ChatStore;

/// A chat room
///
/// Membership is a set of non-owning session handles. Join, leave and
/// broadcast may be called concurrently from any session task.
#[derive(Debug)]
pub struct Room {
    /// Room name
    name: String,
    /// Current members indexed by session
    members: Mutex<HashMap<SessionId, MemberHandle>>,
    /// Held for the whole fan-out so every member sees broadcasts in the
    /// same order
    fanout: Mutex<()>,
}

impl Room {
    /// Create an empty room
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Mutex::new(HashMap::new()),
            fanout: Mutex::new(()),
        }
    }

    /// Room name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a session to the room. Returns `false` if it was already a member.
    pub fn join(&self, member: MemberHandle) -> bool {
        let mut members = self.members.lock();
        if members.contains_key(&member.session_id()) {
            return false;
        }
        members.insert(member.session_id(), member);
        true
    }

    /// Remove a session from the room. Returns `false` if it was not a member.
    pub fn leave(&self, session: SessionId) -> bool {
        self.members.lock().remove(&session).is_some()
    }

    /// Check if a session is a member
    pub fn contains(&self, session: SessionId) -> bool {
        self.members.lock().contains_key(&session)
    }

    /// Get member count
    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    /// Get all member session IDs
    pub fn member_ids(&self) -> Vec<SessionId> {
        self.members.lock().keys().copied().collect()
    }

    /// Enqueue `frame` on every member except `sender`.
    ///
    /// Recipients are snapshotted first; members that join after the
    /// snapshot miss this frame and members whose session is already gone
    /// are pruned. Returns the number of sessions the frame was queued for.
    pub fn broadcast(&self, frame: Bytes, sender: SessionId) -> usize {
        let _order = self.fanout.lock();

        let recipients: Vec<MemberHandle> = {
            let members = self.members.lock();
            members
                .values()
                .filter(|member| member.session_id() != sender)
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        let mut stale = Vec::new();
        for member in &recipients {
            if member.deliver(frame.clone()) {
                delivered += 1;
            } else {
                stale.push(member.session_id());
            }
        }

        if !stale.is_empty() {
            let mut members = self.members.lock();
            for session in stale {
                debug!("Pruning closed session {} from room {}", session, self.name);
                members.remove(&session);
            }
        }

        delivered
    }
}

/// Registry of all rooms, fixed for the lifetime of the server
#[derive(Debug, Default)]
pub struct RoomRegistry {
    /// All rooms indexed by name
    rooms: HashMap<String, Arc<Room>>,
}

impl RoomRegistry {
    /// Create a registry from room names
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rooms = names
            .into_iter()
            .map(|name| {
                let name = name.into();
                (name.clone(), Arc::new(Room::new(name)))
            })
            .collect();
        Self { rooms }
    }

    /// Build the registry from the rooms persisted in the store
    pub fn load(store: &dyn ChatStore) -> Result<Self> {
        let names = store.room_names()?;
        for name in &names {
            info!("Loaded room {}", name);
        }
        Ok(Self::new(names))
    }

    /// Get a room by name
    pub fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.get(name).cloned()
    }

    /// All room names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.keys().cloned().collect();
        names.sort();
        names
    }

    /// Member count per room, sorted by room name
    pub fn member_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = self
            .rooms
            .values()
            .map(|room| (room.name().to_string(), room.member_count()))
            .collect();
        counts.sort();
        counts
    }

    /// Number of rooms
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
