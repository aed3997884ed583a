//! Real-time session engine.
//!
//! This module implements the collaboration core:
//! - Per-document rooms with per-room locking
//! - Presence tracking with expiry
//! - Ordered fan-out of content operations
//! - Debounced last-writer-wins persistence
//! - JSON wire protocol with an optional binary framing

pub mod broadcast;
pub mod connection;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;

pub use broadcast::{OperationBroadcaster, Operation};
pub use connection::{ConnectionHub, PeerConnection};
pub use persistence::{PersistenceCoordinator, PersistenceEvent};
pub use presence::{PresenceRecord, PresenceTracker};
pub use registry::{Member, SessionRegistry};
pub use server::SessionServer;

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Identifier of a collaborative document (and of its room)
pub type DocumentId = String;

/// Stable identifier of an authenticated user
pub type UserId = String;

/// Transport-assigned identifier of one open connection
pub type ConnectionId = String;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur while handling session traffic
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// Connection is not a member of the document's room
    #[error("Not joined to document: {0}")]
    NotJoined(DocumentId),
    /// Identity store refused the join
    #[error("Access to document {0} denied")]
    Forbidden(DocumentId),
    /// Outbound channel is gone
    #[error("Connection closed: {0}")]
    ConnectionClosed(ConnectionId),
    /// External collaborator failed
    #[error("Upstream error: {0}")]
    Upstream(String),
}

/// Tunables for the session engine
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Presence records idle for longer than this are evicted
    pub presence_timeout: Duration,
    /// How often the presence sweep runs
    pub presence_sweep_interval: Duration,
    /// Quiet period before a document is written
    pub save_debounce: Duration,
    /// Backoff applied to failed writes
    pub save_retry: RetryPolicy,
    /// Largest inbound frame accepted
    pub max_message_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            presence_timeout: Duration::from_secs(30),
            presence_sweep_interval: Duration::from_secs(5),
            save_debounce: Duration::from_millis(500),
            save_retry: RetryPolicy::default(),
            max_message_size: protocol::MAX_MESSAGE_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn with_presence_timeout(mut self, timeout: Duration) -> Self {
        self.presence_timeout = timeout;
        self
    }

    pub fn with_presence_sweep_interval(mut self, interval: Duration) -> Self {
        self.presence_sweep_interval = interval;
        self
    }

    pub fn with_save_debounce(mut self, debounce: Duration) -> Self {
        self.save_debounce = debounce;
        self
    }

    pub fn with_save_retry(mut self, retry: RetryPolicy) -> Self {
        self.save_retry = retry;
        self
    }
}
