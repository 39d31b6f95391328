//! Room membership.
//!
//! Rooms exist while they have members: created by the first join and torn
//! down by the last leave. Their message logs live in the store and outlast
//! them.

use std::collections::HashMap;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use utoipa::ToSchema;

use super::error::ChatError;
use super::session::SessionHandle;

/// Longest accepted room id.
pub const MAX_ROOM_ID_LENGTH: usize = 64;

/// Room ids are 1-64 characters of `[A-Za-z0-9_.-]`.
pub fn validate_room_id(room_id: &str) -> Result<(), ChatError> {
    let valid = !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LENGTH
        && room_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(ChatError::InvalidRoom)
    }
}

#[derive(Default)]
struct Room {
    members: HashMap<String, SessionHandle>,
}

/// Returned by [`RoomRegistry::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomHandle {
    pub room_id: String,
    pub member_count: usize,
}

/// A live room as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct RoomSummary {
    pub room_id: String,
    pub member_count: usize,
    /// Sequence of the newest message in the room, 0 if none.
    pub last_sequence: u64,
}

/// Thread-safe map of room id to current members.
pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Add a session to a room, creating the room if needed. Re-joining
    /// replaces the session's previous handle.
    pub fn join(&self, room_id: &str, handle: SessionHandle) -> RoomHandle {
        let mut room = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            tracing::info!(%room_id, "room created");
            Room::default()
        });
        room.members.insert(handle.session_id.clone(), handle);

        RoomHandle {
            room_id: room_id.to_string(),
            member_count: room.members.len(),
        }
    }

    /// Remove a session from a room, tearing the room down if it empties.
    /// Returns whether the session was a member.
    pub fn leave(&self, room_id: &str, session_id: &str) -> bool {
        let Entry::Occupied(mut entry) = self.rooms.entry(room_id.to_string()) else {
            return false;
        };

        let removed = entry.get_mut().members.remove(session_id).is_some();
        if entry.get().members.is_empty() {
            entry.remove();
            tracing::info!(%room_id, "room torn down");
        }
        removed
    }

    /// Point-in-time snapshot of a room's members.
    pub fn members_of(&self, room_id: &str) -> Vec<SessionHandle> {
        self.rooms
            .get(room_id)
            .map(|room| room.members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, room_id: &str, session_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.members.contains_key(session_id))
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms
            .get(room_id)
            .map(|room| room.members.len())
            .unwrap_or(0)
    }

    /// `(room_id, member_count)` for every live room, sorted by id.
    pub fn rooms(&self) -> Vec<(String, usize)> {
        let mut rooms: Vec<(String, usize)> = self
            .rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().members.len()))
            .collect();
        rooms.sort();
        rooms
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::chat::session::Session;

    fn handle(session_id: &str) -> (Session, SessionHandle) {
        let session = Session::new(session_id.to_string(), Identity::new("usr", "User"), 4);
        let (handle, _) = session.enter_room("general", 0).unwrap();
        (session, handle)
    }

    #[test]
    fn room_ids_are_validated() {
        assert!(validate_room_id("general").is_ok());
        assert!(validate_room_id("team-1.ops_2").is_ok());
        assert!(validate_room_id(&"a".repeat(64)).is_ok());

        assert_eq!(validate_room_id(""), Err(ChatError::InvalidRoom));
        assert_eq!(validate_room_id(&"a".repeat(65)), Err(ChatError::InvalidRoom));
        assert_eq!(validate_room_id("has space"), Err(ChatError::InvalidRoom));
        assert_eq!(validate_room_id("slash/room"), Err(ChatError::InvalidRoom));
        assert_eq!(validate_room_id("café"), Err(ChatError::InvalidRoom));
    }

    #[test]
    fn join_creates_room_and_counts_members() {
        let registry = RoomRegistry::new();
        let (_s1, h1) = handle("s1");
        let (_s2, h2) = handle("s2");

        let first = registry.join("general", h1);
        assert_eq!(first.member_count, 1);
        let second = registry.join("general", h2);
        assert_eq!(second.member_count, 2);

        assert_eq!(registry.len(), 1);
        assert!(registry.contains("general", "s1"));
        assert!(registry.contains("general", "s2"));
        assert!(!registry.contains("other", "s1"));
    }

    #[test]
    fn rejoin_replaces_handle() {
        let registry = RoomRegistry::new();
        let (_s1, h1) = handle("s1");
        registry.join("general", h1.clone());
        registry.join("general", h1);
        assert_eq!(registry.member_count("general"), 1);
    }

    #[test]
    fn last_leave_tears_room_down() {
        let registry = RoomRegistry::new();
        let (_s1, h1) = handle("s1");
        let (_s2, h2) = handle("s2");
        registry.join("general", h1);
        registry.join("general", h2);

        assert!(registry.leave("general", "s1"));
        assert_eq!(registry.member_count("general"), 1);
        assert!(registry.leave("general", "s2"));
        assert!(registry.is_empty());
        assert!(registry.members_of("general").is_empty());
    }

    #[test]
    fn leave_unknown_is_noop() {
        let registry = RoomRegistry::new();
        assert!(!registry.leave("general", "s1"));

        let (_s1, h1) = handle("s1");
        registry.join("general", h1);
        assert!(!registry.leave("general", "nobody"));
        assert_eq!(registry.member_count("general"), 1);
    }

    #[test]
    fn members_of_is_a_snapshot() {
        let registry = RoomRegistry::new();
        let (_s1, h1) = handle("s1");
        let (_s2, h2) = handle("s2");
        registry.join("general", h1);

        let snapshot = registry.members_of("general");
        registry.join("general", h2);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].session_id, "s1");
        assert_eq!(registry.members_of("general").len(), 2);
    }

    #[test]
    fn rooms_are_listed_sorted() {
        let registry = RoomRegistry::new();
        let (_s1, h1) = handle("s1");
        let (_s2, h2) = handle("s2");
        let (_s3, h3) = handle("s3");
        registry.join("zeta", h1);
        registry.join("alpha", h2);
        registry.join("alpha", h3);

        assert_eq!(
            registry.rooms(),
            vec![("alpha".to_string(), 2), ("zeta".to_string(), 1)]
        );
    }
}
