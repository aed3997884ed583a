//! Room membership registry.
//!
//! Rooms live in a `DashMap` keyed by document id, each behind its own
//! `parking_lot::Mutex`, so only operations on the same document serialize.
//! Presence records are stored inside the room state and mutated under the
//! same lock as membership.
//!
//! A room lock may be held while touching the maps, never the reverse: map
//! guards are always dropped before a room lock is taken.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::presence::PresenceRecord;
use super::{ConnectionId, DocumentId, UserId};

/// A connection's membership in a room
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Member {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
}

/// Mutable state of one room, only reachable through the room lock
#[derive(Debug)]
pub struct RoomState {
    document_id: DocumentId,
    members: HashMap<ConnectionId, UserId>,
    presence: HashMap<UserId, PresenceRecord>,
    created_at: DateTime<Utc>,
    closed: bool,
}

impl RoomState {
    fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            members: HashMap::new(),
            presence: HashMap::new(),
            created_at: Utc::now(),
            closed: false,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_member(&self, connection_id: &str) -> bool {
        self.members.contains_key(connection_id)
    }

    pub fn user_of(&self, connection_id: &str) -> Option<&UserId> {
        self.members.get(connection_id)
    }

    pub fn members(&self) -> Vec<Member> {
        self.members
            .iter()
            .map(|(connection_id, user_id)| Member {
                connection_id: connection_id.clone(),
                user_id: user_id.clone(),
            })
            .collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Every member connection except `connection_id`
    pub fn connections_except<'a>(
        &'a self,
        connection_id: &'a str,
    ) -> impl Iterator<Item = &'a ConnectionId> + 'a {
        self.members
            .keys()
            .filter(move |id| id.as_str() != connection_id)
    }

    /// Member connections that do not belong to `user_id`
    pub fn connections_not_of<'a>(
        &'a self,
        user_id: &'a str,
    ) -> impl Iterator<Item = &'a ConnectionId> + 'a {
        self.members
            .iter()
            .filter(move |(_, user)| user.as_str() != user_id)
            .map(|(id, _)| id)
    }

    /// Whether any connection of `user_id` is still a member
    pub fn has_user(&self, user_id: &str) -> bool {
        self.members.values().any(|u| u == user_id)
    }

    pub fn presence(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.presence.get(user_id)
    }

    pub fn presence_mut(&mut self, user_id: &str) -> Option<&mut PresenceRecord> {
        self.presence.get_mut(user_id)
    }

    pub fn presence_records(&self) -> impl Iterator<Item = &PresenceRecord> {
        self.presence.values()
    }

    pub(crate) fn insert_presence(&mut self, record: PresenceRecord) {
        self.presence.insert(record.user_id.clone(), record);
    }

    pub(crate) fn remove_presence(&mut self, user_id: &str) -> Option<PresenceRecord> {
        self.presence.remove(user_id)
    }

    /// Drop every connection of `user_id`; returns the dropped ids
    pub(crate) fn evict_user(&mut self, user_id: &str) -> Vec<ConnectionId> {
        let evicted: Vec<ConnectionId> = self
            .members
            .iter()
            .filter(|(_, user)| user.as_str() == user_id)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &evicted {
            self.members.remove(id);
        }
        self.presence.remove(user_id);

        evicted
    }
}

/// A collaboration room for one document
#[derive(Debug)]
pub struct Room {
    document_id: DocumentId,
    state: Mutex<RoomState>,
    created_at: Instant,
}

impl Room {
    fn new(document_id: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            state: Mutex::new(RoomState::new(document_id)),
            created_at: Instant::now(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn age_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }
}

/// The single source of truth for room membership
#[derive(Debug, Default)]
pub struct SessionRegistry {
    /// Active rooms
    rooms: DashMap<DocumentId, Arc<Room>>,
    /// Reverse index used by `disconnect_all`
    memberships: DashMap<ConnectionId, HashSet<DocumentId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a document's room.
    ///
    /// Returns the other members, or `None` if the connection was already
    /// a member.
    pub fn join(&self, connection_id: &str, document_id: &str, user_id: &str) -> Option<Vec<Member>> {
        self.join_with(connection_id, document_id, user_id, |state| {
            state
                .members()
                .into_iter()
                .filter(|m| m.connection_id != connection_id)
                .collect()
        })
    }

    /// Join and run `f` under the room lock with the new member in place.
    pub fn join_with<R>(
        &self,
        connection_id: &str,
        document_id: &str,
        user_id: &str,
        f: impl FnOnce(&mut RoomState) -> R,
    ) -> Option<R> {
        loop {
            let room = self
                .rooms
                .entry(document_id.to_string())
                .or_insert_with(|| {
                    info!("Created room: {}", document_id);
                    Arc::new(Room::new(document_id))
                })
                .clone();

            let mut state = room.state.lock();
            if state.closed {
                // Lost a race with the last leave; the map entry is about to go.
                drop(state);
                std::thread::yield_now();
                continue;
            }

            if state.is_member(connection_id) {
                debug!("Connection {} already in room {}", connection_id, document_id);
                return None;
            }

            state
                .members
                .insert(connection_id.to_string(), user_id.to_string());
            self.memberships
                .entry(connection_id.to_string())
                .or_default()
                .insert(document_id.to_string());

            debug!(
                "Connection {} (user {}) joined room {}",
                connection_id, user_id, document_id
            );
            return Some(f(&mut state));
        }
    }

    /// Remove a connection from a room. Never fails; returns whether it was a member.
    pub fn leave(&self, connection_id: &str, document_id: &str) -> bool {
        self.leave_with(connection_id, document_id, |_, _| ()).is_some()
    }

    /// Leave and run `f` under the room lock with the member already removed.
    pub fn leave_with<R>(
        &self,
        connection_id: &str,
        document_id: &str,
        f: impl FnOnce(&mut RoomState, &UserId) -> R,
    ) -> Option<R> {
        let room = self.rooms.get(document_id).map(|r| r.clone())?;

        let mut state = room.state.lock();
        let user_id = state.members.remove(connection_id)?;
        self.unindex(connection_id, document_id);

        debug!(
            "Connection {} (user {}) left room {}",
            connection_id, user_id, document_id
        );

        let result = f(&mut state, &user_id);
        self.close_if_empty(&room, &mut state);
        Some(result)
    }

    /// Current members of a room
    pub fn members_of(&self, document_id: &str) -> Vec<Member> {
        self.with_room(document_id, |state| state.members())
            .unwrap_or_default()
    }

    /// Remove a connection from every room it belongs to.
    pub fn disconnect_all(&self, connection_id: &str) -> Vec<DocumentId> {
        self.disconnect_all_with(connection_id, |_, _| ())
    }

    /// Disconnect and run `f` for each room left, under that room's lock.
    pub fn disconnect_all_with(
        &self,
        connection_id: &str,
        mut f: impl FnMut(&mut RoomState, &UserId),
    ) -> Vec<DocumentId> {
        let documents = self
            .memberships
            .remove(connection_id)
            .map(|(_, docs)| docs)
            .unwrap_or_default();

        let mut left = Vec::with_capacity(documents.len());
        for document_id in documents {
            if self
                .leave_with(connection_id, &document_id, |state, user| f(state, user))
                .is_some()
            {
                left.push(document_id);
            }
        }

        if !left.is_empty() {
            debug!("Connection {} disconnected from {} rooms", connection_id, left.len());
        }
        left
    }

    /// Run `f` under the room lock if the room exists
    pub fn with_room<R>(&self, document_id: &str, f: impl FnOnce(&mut RoomState) -> R) -> Option<R> {
        let room = self.rooms.get(document_id).map(|r| r.clone())?;
        let mut state = room.state.lock();
        if state.closed {
            return None;
        }
        Some(f(&mut state))
    }

    /// Visit every room; `f` returns the connections it evicted.
    pub fn sweep_with(&self, mut f: impl FnMut(&mut RoomState) -> Vec<ConnectionId>) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|r| r.value().clone()).collect();

        let mut evicted_total = 0;
        for room in rooms {
            let mut state = room.state.lock();
            if state.closed {
                continue;
            }

            let evicted = f(&mut state);
            for connection_id in &evicted {
                self.unindex(connection_id, room.document_id());
            }
            evicted_total += evicted.len();

            self.close_if_empty(&room, &mut state);
        }
        evicted_total
    }

    /// Rooms a connection currently belongs to
    pub fn rooms_of(&self, connection_id: &str) -> Vec<DocumentId> {
        self.memberships
            .get(connection_id)
            .map(|docs| docs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains_room(&self, document_id: &str) -> bool {
        self.rooms.contains_key(document_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Total memberships across all rooms
    pub fn membership_count(&self) -> usize {
        self.memberships.iter().map(|m| m.len()).sum()
    }

    fn unindex(&self, connection_id: &str, document_id: &str) {
        if let Some(mut docs) = self.memberships.get_mut(connection_id) {
            docs.remove(document_id);
        }
        self.memberships
            .remove_if(connection_id, |_, docs| docs.is_empty());
    }

    fn close_if_empty(&self, room: &Arc<Room>, state: &mut RoomState) {
        if !state.members.is_empty() {
            return;
        }

        state.closed = true;
        state.presence.clear();
        self.rooms
            .remove_if(room.document_id(), |_, current| Arc::ptr_eq(current, room));

        info!(
            "Removed empty room: {} (lived {}s)",
            room.document_id(),
            room.age_secs()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_join_creates_room() {
        let registry = SessionRegistry::new();

        let others = registry.join("conn-a", "doc-1", "alice").unwrap();

        assert!(others.is_empty());
        assert!(registry.contains_room("doc-1"));
        assert_eq!(registry.rooms_of("conn-a"), vec!["doc-1".to_string()]);
    }

    #[test]
    fn test_join_returns_other_members() {
        let registry = SessionRegistry::new();
        registry.join("conn-a", "doc-1", "alice");

        let others = registry.join("conn-b", "doc-1", "bob").unwrap();

        assert_eq!(
            others,
            vec![Member {
                connection_id: "conn-a".to_string(),
                user_id: "alice".to_string()
            }]
        );
        assert_eq!(registry.members_of("doc-1").len(), 2);
    }

    #[test]
    fn test_join_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.join("conn-a", "doc-1", "alice");

        assert!(registry.join("conn-a", "doc-1", "alice").is_none());
        assert_eq!(registry.members_of("doc-1").len(), 1);
    }

    #[test]
    fn test_leave_is_idempotent_and_removes_empty_room() {
        let registry = SessionRegistry::new();
        registry.join("conn-a", "doc-1", "alice");

        assert!(registry.leave("conn-a", "doc-1"));
        assert!(!registry.leave("conn-a", "doc-1"));
        assert!(!registry.leave("conn-x", "doc-unknown"));

        assert!(!registry.contains_room("doc-1"));
        assert!(registry.rooms_of("conn-a").is_empty());
    }

    #[test]
    fn test_disconnect_all() {
        let registry = SessionRegistry::new();
        registry.join("conn-a", "doc-1", "alice");
        registry.join("conn-a", "doc-2", "alice");
        registry.join("conn-b", "doc-2", "bob");

        let mut left = registry.disconnect_all("conn-a");
        left.sort();

        assert_eq!(left, vec!["doc-1".to_string(), "doc-2".to_string()]);
        assert!(!registry.contains_room("doc-1"));
        assert_eq!(registry.members_of("doc-2").len(), 1);
        assert!(registry.disconnect_all("conn-a").is_empty());
    }

    #[test]
    fn test_with_room_on_missing_room() {
        let registry = SessionRegistry::new();
        assert!(registry.with_room("nope", |s| s.member_count()).is_none());
        assert!(registry.members_of("nope").is_empty());
    }

    #[test]
    fn test_rejoin_after_room_closed() {
        let registry = SessionRegistry::new();
        registry.join("conn-a", "doc-1", "alice");
        registry.leave("conn-a", "doc-1");

        let others = registry.join("conn-a", "doc-1", "alice").unwrap();
        assert!(others.is_empty());
        assert_eq!(registry.room_count(), 1);
    }

    #[test]
    fn test_concurrent_joins_create_one_room() {
        let registry = Arc::new(SessionRegistry::new());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    registry.join(&format!("conn-{}", i), "doc-1", &format!("user-{}", i));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.members_of("doc-1").len(), 16);
    }

    #[test]
    fn test_join_leave_churn_leaves_no_rooms() {
        let registry = Arc::new(SessionRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let conn = format!("conn-{}", i);
                    for _ in 0..200 {
                        registry.join(&conn, "doc-1", "user");
                        registry.leave(&conn, "doc-1");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.membership_count(), 0);
    }

    #[test]
    fn test_sweep_evicts_and_closes() {
        let registry = SessionRegistry::new();
        registry.join("conn-a", "doc-1", "alice");
        registry.join("conn-b", "doc-1", "bob");

        let evicted = registry.sweep_with(|state| state.evict_user("alice"));
        assert_eq!(evicted, 1);
        assert!(registry.rooms_of("conn-a").is_empty());
        assert_eq!(registry.members_of("doc-1").len(), 1);

        registry.sweep_with(|state| state.evict_user("bob"));
        assert!(!registry.contains_room("doc-1"));
    }
}
