//! Presence tracking for real-time collaboration.
//!
//! This module handles ephemeral per-user state inside a room:
//! - Roster snapshot for joining connections
//! - Join/leave announcements, once per user rather than per connection
//! - Cursor activity forwarding (payload is opaque)
//! - Expiry of records whose owners went silent without closing

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::connection::ConnectionHub;
use super::protocol::{Collaborator, DocumentSnapshot, ServerMessage};
use super::registry::{RoomState, SessionRegistry};
use super::{ConnectionId, DocumentId, SessionError, SessionResult, UserId};

/// Presence of one user in one room
#[derive(Debug, Clone)]
pub struct PresenceRecord {
    /// Room the record belongs to
    pub document_id: DocumentId,
    /// User the record describes
    pub user_id: UserId,
    /// When the user's first connection joined (milliseconds since epoch)
    pub joined_at_ms: i64,
    /// Last activity (milliseconds since epoch)
    pub last_active_ms: i64,
    /// Latest cursor or selection payload, never interpreted
    pub cursor: Option<Value>,
    /// Monotonic last activity, used for expiry
    last_active: Instant,
}

impl PresenceRecord {
    pub fn new(document_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            document_id: document_id.into(),
            user_id: user_id.into(),
            joined_at_ms: now,
            last_active_ms: now,
            cursor: None,
            last_active: Instant::now(),
        }
    }

    /// Update the last activity timestamp
    pub fn touch(&mut self) {
        self.last_active_ms = Utc::now().timestamp_millis();
        self.last_active = Instant::now();
    }

    /// Store a cursor payload and count it as activity
    pub fn set_cursor(&mut self, cursor: Value) {
        self.cursor = Some(cursor);
        self.touch();
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    /// Whether the record has been idle for longer than `timeout` at `now`
    pub fn is_expired_at(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_active) > timeout
    }

    fn to_collaborator(&self) -> Collaborator {
        Collaborator {
            user_id: self.user_id.clone(),
            joined_at: self.joined_at_ms,
        }
    }
}

/// Presence operations layered over the session registry
pub struct PresenceTracker {
    registry: Arc<SessionRegistry>,
    hub: Arc<ConnectionHub>,
    timeout: Duration,
}

impl PresenceTracker {
    pub fn new(registry: Arc<SessionRegistry>, hub: Arc<ConnectionHub>, timeout: Duration) -> Self {
        Self {
            registry,
            hub,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Join a room and announce it.
    ///
    /// The joining connection gets one `currentCollaborators` event. The
    /// rest of the room gets `memberJoined` only if this is the user's first
    /// connection there. Returns false if the connection was already joined.
    pub fn join(
        &self,
        connection_id: &str,
        document_id: &str,
        user_id: &str,
        snapshot: Option<DocumentSnapshot>,
    ) -> bool {
        let joined = self
            .registry
            .join_with(connection_id, document_id, user_id, |state| {
                let first_connection = match state.presence_mut(user_id) {
                    Some(record) => {
                        record.touch();
                        false
                    }
                    None => {
                        state.insert_presence(PresenceRecord::new(document_id, user_id));
                        true
                    }
                };

                let members = roster_excluding(state, user_id);
                debug!(
                    "Sending roster of {} to {} in {}",
                    members.len(),
                    connection_id,
                    document_id
                );
                self.hub.send(
                    connection_id,
                    ServerMessage::CurrentCollaborators {
                        document_id: document_id.to_string(),
                        members,
                        snapshot,
                    },
                );

                if first_connection {
                    let joined = ServerMessage::MemberJoined {
                        document_id: document_id.to_string(),
                        user_id: user_id.to_string(),
                    };
                    self.hub.send_all(state.connections_not_of(user_id), &joined);
                }
            });

        if joined.is_some() {
            info!("User {} joined document {} via {}", user_id, document_id, connection_id);
        }
        joined.is_some()
    }

    /// Leave a room. Idempotent.
    pub fn leave(&self, connection_id: &str, document_id: &str) -> bool {
        let left = self
            .registry
            .leave_with(connection_id, document_id, |state, user_id| {
                self.depart(state, user_id)
            });

        if left.is_some() {
            info!("Connection {} left document {}", connection_id, document_id);
        }
        left.is_some()
    }

    /// Transport-level disconnect: leave every room
    pub fn disconnect(&self, connection_id: &str) -> Vec<DocumentId> {
        self.registry
            .disconnect_all_with(connection_id, |state, user_id| {
                self.depart(state, user_id);
            })
    }

    /// Record cursor activity and forward it to the other members
    pub fn activity(&self, connection_id: &str, document_id: &str, cursor: Value) -> SessionResult<()> {
        self.registry
            .with_room(document_id, |state| {
                let user_id = state
                    .user_of(connection_id)
                    .cloned()
                    .ok_or_else(|| SessionError::NotJoined(document_id.to_string()))?;

                if let Some(record) = state.presence_mut(&user_id) {
                    record.set_cursor(cursor.clone());
                }

                let moved = ServerMessage::CursorMoved {
                    document_id: document_id.to_string(),
                    user_id,
                    cursor,
                };
                self.hub.send_all(state.connections_except(connection_id), &moved);
                Ok(())
            })
            .unwrap_or_else(|| Err(SessionError::NotJoined(document_id.to_string())))
    }

    /// Refresh presence in every room the connection belongs to
    pub fn heartbeat(&self, connection_id: &str) -> usize {
        self.registry
            .rooms_of(connection_id)
            .iter()
            .filter_map(|document_id| {
                self.registry
                    .with_room(document_id, |state| {
                        let user_id = state.user_of(connection_id).cloned()?;
                        state.presence_mut(&user_id).map(|record| record.touch())
                    })
                    .flatten()
            })
            .count()
    }

    /// Evict records idle past the timeout
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    /// Evict records idle past the timeout as of `now`.
    ///
    /// Returns the number of `memberLeft` announcements made.
    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let timeout = self.timeout;
        let mut expired_users = 0;

        self.registry.sweep_with(|state| {
            let expired: Vec<UserId> = state
                .presence_records()
                .filter(|record| record.is_expired_at(now, timeout))
                .map(|record| record.user_id.clone())
                .collect();

            let mut evicted: Vec<ConnectionId> = Vec::new();
            for user_id in expired {
                let connections = state.evict_user(&user_id);
                info!(
                    "Presence expired for user {} in {} ({} connections evicted)",
                    user_id,
                    state.document_id(),
                    connections.len()
                );

                let left = ServerMessage::MemberLeft {
                    document_id: state.document_id().to_string(),
                    user_id,
                };
                let remaining: Vec<ConnectionId> =
                    state.members().into_iter().map(|m| m.connection_id).collect();
                self.hub.send_all(&remaining, &left);
                // Let a still-open evicted client notice and rejoin.
                self.hub.send_all(&connections, &left);

                evicted.extend(connections);
                expired_users += 1;
            }
            evicted
        });

        expired_users
    }

    /// Current roster of a room
    pub fn roster(&self, document_id: &str) -> Vec<Collaborator> {
        self.registry
            .with_room(document_id, |state| roster_excluding(state, ""))
            .unwrap_or_default()
    }

    /// Forget the user's record once their last connection is gone
    fn depart(&self, state: &mut RoomState, user_id: &UserId) {
        if state.has_user(user_id) {
            return;
        }

        state.remove_presence(user_id);
        let left = ServerMessage::MemberLeft {
            document_id: state.document_id().to_string(),
            user_id: user_id.clone(),
        };
        let remaining: Vec<ConnectionId> =
            state.members().into_iter().map(|m| m.connection_id).collect();
        self.hub.send_all(&remaining, &left);
    }
}

/// Mark a user active inside an already-locked room
pub(crate) fn touch_in(state: &mut RoomState, user_id: &str) {
    if let Some(record) = state.presence_mut(user_id) {
        record.touch();
    }
}

fn roster_excluding(state: &RoomState, user_id: &str) -> Vec<Collaborator> {
    let mut members: Vec<Collaborator> = state
        .presence_records()
        .filter(|record| record.user_id != user_id)
        .map(PresenceRecord::to_collaborator)
        .collect();
    members.sort_by(|a, b| {
        a.joined_at
            .cmp(&b.joined_at)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    members
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        hub: Arc<ConnectionHub>,
        registry: Arc<SessionRegistry>,
        tracker: PresenceTracker,
    }

    fn fixture() -> Fixture {
        let hub = Arc::new(ConnectionHub::new());
        let registry = Arc::new(SessionRegistry::new());
        let tracker = PresenceTracker::new(registry.clone(), hub.clone(), Duration::from_secs(30));
        Fixture {
            hub,
            registry,
            tracker,
        }
    }

    fn connect(
        hub: &ConnectionHub,
        connection_id: &str,
        user_id: &str,
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register(connection_id, user_id, tx);
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn member_left(user_id: &str) -> ServerMessage {
        ServerMessage::MemberLeft {
            document_id: "doc-1".to_string(),
            user_id: user_id.to_string(),
        }
    }

    #[test]
    fn test_join_sends_roster_and_announces() {
        let f = fixture();
        let mut rx_a = connect(&f.hub, "conn-a", "alice");
        let mut rx_b = connect(&f.hub, "conn-b", "bob");

        assert!(f.tracker.join("conn-a", "doc-1", "alice", None));
        match drain(&mut rx_a).as_slice() {
            [ServerMessage::CurrentCollaborators { members, .. }] => assert!(members.is_empty()),
            other => panic!("unexpected: {:?}", other),
        }

        assert!(f.tracker.join("conn-b", "doc-1", "bob", None));

        assert_eq!(
            drain(&mut rx_a),
            vec![ServerMessage::MemberJoined {
                document_id: "doc-1".to_string(),
                user_id: "bob".to_string()
            }]
        );
        match drain(&mut rx_b).as_slice() {
            [ServerMessage::CurrentCollaborators { members, .. }] => {
                assert_eq!(members.len(), 1);
                assert_eq!(members[0].user_id, "alice");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_repeated_join_is_silent() {
        let f = fixture();
        let mut rx_a = connect(&f.hub, "conn-a", "alice");
        let mut rx_b = connect(&f.hub, "conn-b", "bob");
        f.tracker.join("conn-a", "doc-1", "alice", None);
        f.tracker.join("conn-b", "doc-1", "bob", None);
        drain(&mut rx_a);
        drain(&mut rx_b);

        assert!(!f.tracker.join("conn-b", "doc-1", "bob", None));
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_second_connection_of_same_user() {
        let f = fixture();
        let mut rx_a = connect(&f.hub, "conn-a", "alice");
        let mut rx_b1 = connect(&f.hub, "conn-b1", "bob");
        let mut rx_b2 = connect(&f.hub, "conn-b2", "bob");

        f.tracker.join("conn-a", "doc-1", "alice", None);
        f.tracker.join("conn-b1", "doc-1", "bob", None);
        drain(&mut rx_a);
        drain(&mut rx_b1);

        f.tracker.join("conn-b2", "doc-1", "bob", None);

        // Alice already knows about Bob.
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b1).is_empty());
        match drain(&mut rx_b2).as_slice() {
            [ServerMessage::CurrentCollaborators { members, .. }] => {
                assert_eq!(members.len(), 1);
                assert_eq!(members[0].user_id, "alice");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(f.tracker.roster("doc-1").len(), 2);

        // First of Bob's connections leaves: nothing announced.
        f.tracker.leave("conn-b1", "doc-1");
        assert!(drain(&mut rx_a).is_empty());

        // Last one leaves.
        f.tracker.leave("conn-b2", "doc-1");
        assert_eq!(drain(&mut rx_a), vec![member_left("bob")]);
    }

    #[test]
    fn test_leave_twice_announces_once() {
        let f = fixture();
        let mut rx_a = connect(&f.hub, "conn-a", "alice");
        let _rx_b = connect(&f.hub, "conn-b", "bob");
        f.tracker.join("conn-a", "doc-1", "alice", None);
        f.tracker.join("conn-b", "doc-1", "bob", None);
        drain(&mut rx_a);

        assert!(f.tracker.leave("conn-b", "doc-1"));
        assert!(!f.tracker.leave("conn-b", "doc-1"));

        assert_eq!(drain(&mut rx_a), vec![member_left("bob")]);
    }

    #[test]
    fn test_disconnect_announces_in_every_room() {
        let f = fixture();
        let mut rx_a = connect(&f.hub, "conn-a", "alice");
        let _rx_b = connect(&f.hub, "conn-b", "bob");
        f.tracker.join("conn-a", "doc-1", "alice", None);
        f.tracker.join("conn-a", "doc-2", "alice", None);
        f.tracker.join("conn-b", "doc-1", "bob", None);
        f.tracker.join("conn-b", "doc-2", "bob", None);
        drain(&mut rx_a);

        let mut left = f.tracker.disconnect("conn-b");
        left.sort();
        assert_eq!(left, vec!["doc-1".to_string(), "doc-2".to_string()]);

        let events = drain(&mut rx_a);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, ServerMessage::MemberLeft { user_id, .. } if user_id == "bob")));
    }

    #[test]
    fn test_activity_forwarded_to_others_only() {
        let f = fixture();
        let mut rx_a = connect(&f.hub, "conn-a", "alice");
        let mut rx_b = connect(&f.hub, "conn-b", "bob");
        f.tracker.join("conn-a", "doc-1", "alice", None);
        f.tracker.join("conn-b", "doc-1", "bob", None);
        drain(&mut rx_a);
        drain(&mut rx_b);

        let cursor = json!({"anchor": 3, "head": 9});
        f.tracker.activity("conn-a", "doc-1", cursor.clone()).unwrap();

        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerMessage::CursorMoved {
                document_id: "doc-1".to_string(),
                user_id: "alice".to_string(),
                cursor: cursor.clone(),
            }]
        );

        let stored = f
            .registry
            .with_room("doc-1", |state| state.presence("alice").and_then(|r| r.cursor.clone()))
            .flatten();
        assert_eq!(stored, Some(cursor));
    }

    #[test]
    fn test_activity_from_non_member_rejected() {
        let f = fixture();
        let _rx_a = connect(&f.hub, "conn-a", "alice");
        let _rx_x = connect(&f.hub, "conn-x", "mallory");
        f.tracker.join("conn-a", "doc-1", "alice", None);

        let result = f.tracker.activity("conn-x", "doc-1", json!(1));
        assert_eq!(result, Err(SessionError::NotJoined("doc-1".to_string())));

        let result = f.tracker.activity("conn-a", "doc-missing", json!(1));
        assert!(result.is_err());
    }

    #[test]
    fn test_expiry_emits_member_left_once() {
        let f = fixture();
        let mut rx_a = connect(&f.hub, "conn-a", "alice");
        let mut rx_b = connect(&f.hub, "conn-b", "bob");
        f.tracker.join("conn-a", "doc-1", "alice", None);
        f.tracker.join("conn-b", "doc-1", "bob", None);
        drain(&mut rx_a);
        drain(&mut rx_b);

        // Alice stays active, Bob goes silent.
        let later = Instant::now() + Duration::from_secs(31);
        f.registry.with_room("doc-1", |state| {
            if let Some(record) = state.presence_mut("alice") {
                record.last_active = later;
            }
        });

        assert_eq!(f.tracker.sweep_expired_at(later), 1);
        assert_eq!(drain(&mut rx_a), vec![member_left("bob")]);
        assert!(!f.registry.members_of("doc-1").iter().any(|m| m.user_id == "bob"));

        // Nothing left to expire, and Bob's late disconnect is a no-op.
        assert_eq!(f.tracker.sweep_expired_at(later), 0);
        assert!(f.tracker.disconnect("conn-b").is_empty());
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn test_heartbeat_keeps_presence_alive() {
        let f = fixture();
        let _rx_a = connect(&f.hub, "conn-a", "alice");
        f.tracker.join("conn-a", "doc-1", "alice", None);
        f.tracker.join("conn-a", "doc-2", "alice", None);

        assert_eq!(f.tracker.heartbeat("conn-a"), 2);
        assert_eq!(f.tracker.heartbeat("conn-unknown"), 0);
        assert_eq!(f.tracker.sweep_expired_at(Instant::now()), 0);
    }

    #[test]
    fn test_record_expiry_boundary() {
        let record = PresenceRecord::new("doc-1", "alice");
        let timeout = Duration::from_secs(30);

        assert!(!record.is_expired_at(record.last_active() + timeout, timeout));
        assert!(record.is_expired_at(record.last_active() + timeout + Duration::from_millis(1), timeout));
    }
}
