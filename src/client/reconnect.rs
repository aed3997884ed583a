//! Client reconnection state machine.
//!
//! `transition` is pure: it maps a state and an event to the next state and
//! the effect the driver should perform. `ReconnectionManager` wraps it with
//! the set of rooms to rejoin and the rosters learned from the server.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;
use crate::sync::protocol::{ClientMessage, ServerMessage};
use crate::sync::{DocumentId, UserId};

/// Connection state as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to be
    Idle,
    /// First connection attempt in flight
    Connecting,
    Connected,
    /// Waiting out a backoff after `failures` failed reconnects
    Disconnected { failures: u32 },
    /// Reconnect attempt number `attempt` in flight
    Reconnecting { attempt: u32 },
    /// Retries exhausted
    Failed { attempts: u32 },
    /// Handshake refused; waits for a fresh token
    Unauthorized,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether a reconnect is scheduled or in flight
    pub fn is_recovering(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected { .. } | ConnectionState::Reconnecting { .. }
        )
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// User asked to connect
    Connect,
    /// Socket opened
    Opened,
    /// Established socket dropped
    Closed,
    /// Backoff timer fired
    BackoffElapsed,
    /// Connection attempt failed before opening
    AttemptFailed,
    /// Server refused the handshake credentials
    AuthRejected,
    /// User closed the client
    UserClose,
}

/// Side effect requested from the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    OpenSocket,
    ScheduleRetry(Duration),
    /// Rejoin every remembered room
    Resync,
    GiveUp,
    CancelRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: ConnectionState,
    pub effect: Effect,
}

impl Transition {
    fn to(state: ConnectionState, effect: Effect) -> Self {
        Self { state, effect }
    }

    fn stay(state: ConnectionState) -> Self {
        Self {
            state,
            effect: Effect::None,
        }
    }
}

/// Next state and effect for `event` in `state`
pub fn transition(state: ConnectionState, event: ConnectionEvent, policy: &RetryPolicy) -> Transition {
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (state, event) {
        (_, E::UserClose) => Transition::to(S::Idle, Effect::CancelRetry),

        (S::Idle, E::Connect) | (S::Failed { .. }, E::Connect) | (S::Unauthorized, E::Connect) => {
            Transition::to(S::Connecting, Effect::OpenSocket)
        }

        // Retrying the same credentials cannot succeed.
        (S::Connecting, E::AuthRejected) | (S::Reconnecting { .. }, E::AuthRejected) => {
            Transition::to(S::Unauthorized, Effect::GiveUp)
        }

        (S::Connecting, E::Opened) | (S::Reconnecting { .. }, E::Opened) => {
            Transition::to(S::Connected, Effect::Resync)
        }

        (S::Connected, E::Closed) => retry_after(0, policy),

        (S::Disconnected { failures }, E::BackoffElapsed) => Transition::to(
            S::Reconnecting {
                attempt: failures + 1,
            },
            Effect::OpenSocket,
        ),

        (S::Connecting, E::AttemptFailed) | (S::Connecting, E::Closed) => retry_after(0, policy),

        (S::Reconnecting { attempt }, E::AttemptFailed)
        | (S::Reconnecting { attempt }, E::Closed) => retry_after(attempt, policy),

        (state, _) => Transition::stay(state),
    }
}

/// Back off after `failures` failed reconnects, or give up
fn retry_after(failures: u32, policy: &RetryPolicy) -> Transition {
    match policy.delay_for(failures + 1) {
        Some(delay) => Transition::to(
            ConnectionState::Disconnected { failures },
            Effect::ScheduleRetry(delay),
        ),
        None => Transition::to(
            ConnectionState::Failed { attempts: failures },
            Effect::GiveUp,
        ),
    }
}

/// Connection state plus what is needed to restore it
#[derive(Debug)]
pub struct ReconnectionManager {
    state: ConnectionState,
    policy: RetryPolicy,
    /// Rooms to rejoin after a reconnect
    rooms: BTreeSet<DocumentId>,
    /// Last roster seen per room
    rosters: HashMap<DocumentId, BTreeSet<UserId>>,
    /// Our own user id, learned from `connected`
    user_id: Option<UserId>,
}

impl ReconnectionManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            policy,
            rooms: BTreeSet::new(),
            rosters: HashMap::new(),
            user_id: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Feed an event and return the effect to perform
    pub fn handle(&mut self, event: ConnectionEvent) -> Effect {
        let next = transition(self.state, event, &self.policy);
        if next.state != self.state {
            debug!("Connection state {:?} -> {:?} on {:?}", self.state, next.state, event);
        }
        match next.effect {
            Effect::GiveUp if next.state == ConnectionState::Unauthorized => {
                warn!("Handshake rejected, a fresh token is required")
            }
            Effect::GiveUp => warn!("Giving up reconnecting after {:?}", next.state),
            Effect::Resync => info!("Connected, rejoining {} rooms", self.rooms.len()),
            _ => {}
        }
        self.state = next.state;
        next.effect
    }

    /// Remember a room; returns the `join` to send now if connected
    pub fn join_room(&mut self, document_id: &str) -> Option<ClientMessage> {
        self.rooms.insert(document_id.to_string());
        self.state.is_connected().then(|| ClientMessage::Join {
            document_id: document_id.to_string(),
        })
    }

    /// Forget a room; returns the `leave` to send now if connected.
    ///
    /// Leaving the last room while a reconnect is pending cancels it.
    pub fn leave_room(&mut self, document_id: &str) -> (Option<ClientMessage>, Effect) {
        let was_member = self.rooms.remove(document_id);
        self.rosters.remove(document_id);

        if self.rooms.is_empty() && self.state.is_recovering() {
            info!("No rooms left, cancelling reconnect");
            self.state = ConnectionState::Idle;
            return (None, Effect::CancelRetry);
        }

        let leave = (was_member && self.state.is_connected()).then(|| ClientMessage::Leave {
            document_id: document_id.to_string(),
        });
        (leave, Effect::None)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &DocumentId> {
        self.rooms.iter()
    }

    /// Drop stale rosters and produce a `join` for every remembered room
    pub fn resync_messages(&mut self) -> Vec<ClientMessage> {
        self.rosters.clear();
        self.rooms
            .iter()
            .map(|document_id| ClientMessage::Join {
                document_id: document_id.clone(),
            })
            .collect()
    }

    /// Update rosters from a server message.
    ///
    /// Returns a `join` when the server dropped us from a room we still
    /// want, which happens when our presence expired.
    pub fn apply(&mut self, msg: &ServerMessage) -> Option<ClientMessage> {
        match msg {
            ServerMessage::Connected { user_id, .. } => {
                self.user_id = Some(user_id.clone());
                None
            }
            ServerMessage::CurrentCollaborators {
                document_id,
                members,
                ..
            } => {
                let roster = self
                    .rosters
                    .entry(document_id.clone())
                    .or_default();
                roster.clear();
                roster.extend(members.iter().map(|m| m.user_id.clone()));
                None
            }
            ServerMessage::MemberJoined {
                document_id,
                user_id,
            } => {
                self.rosters
                    .entry(document_id.clone())
                    .or_default()
                    .insert(user_id.clone());
                None
            }
            ServerMessage::MemberLeft {
                document_id,
                user_id,
            } => {
                if self.user_id.as_deref() == Some(user_id.as_str()) {
                    if self.rooms.contains(document_id) && self.state.is_connected() {
                        info!("Dropped from {}, rejoining", document_id);
                        self.rosters.remove(document_id);
                        return Some(ClientMessage::Join {
                            document_id: document_id.clone(),
                        });
                    }
                    return None;
                }
                if let Some(roster) = self.rosters.get_mut(document_id) {
                    roster.remove(user_id);
                }
                None
            }
            _ => None,
        }
    }

    /// Other users currently in a room
    pub fn roster(&self, document_id: &str) -> Vec<UserId> {
        self.rosters
            .get(document_id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }
}
