//! Transport-side table of open connections.
//!
//! The registry and presence tracker only hold connection ids; this hub
//! resolves an id to its outbound channel. Dropping the receiver half (when
//! the socket's writer task ends) makes further sends to that connection
//! fail silently without affecting anyone else.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::protocol::ServerMessage;
use super::{ConnectionId, SessionError, SessionResult, UserId};

/// A single authenticated connection
#[derive(Debug)]
pub struct PeerConnection {
    /// Transport-assigned id
    pub connection_id: ConnectionId,
    /// Authenticated user, fixed for the connection's lifetime
    pub user_id: UserId,
    /// Channel to the socket writer task
    tx: mpsc::UnboundedSender<ServerMessage>,
    /// When the handshake completed
    connected_at: Instant,
}

impl PeerConnection {
    pub fn new(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            tx,
            connected_at: Instant::now(),
        }
    }

    /// Queue a message for this connection
    pub fn send(&self, msg: ServerMessage) -> SessionResult<()> {
        self.tx
            .send(msg)
            .map_err(|_| SessionError::ConnectionClosed(self.connection_id.clone()))
    }

    /// Seconds since the handshake
    pub fn uptime_secs(&self) -> u64 {
        self.connected_at.elapsed().as_secs()
    }
}

/// All open connections, keyed by id
#[derive(Debug, Default)]
pub struct ConnectionHub {
    connections: DashMap<ConnectionId, Arc<PeerConnection>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection after a successful handshake
    pub fn register(
        &self,
        connection_id: &str,
        user_id: &str,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Arc<PeerConnection> {
        let connection = Arc::new(PeerConnection::new(connection_id, user_id, tx));
        self.connections
            .insert(connection_id.to_string(), connection.clone());

        info!("Connection registered: {} (user {})", connection_id, user_id);
        connection
    }

    /// Remove a connection; returns it if it was registered
    pub fn unregister(&self, connection_id: &str) -> Option<Arc<PeerConnection>> {
        let removed = self.connections.remove(connection_id).map(|(_, c)| c);
        if let Some(connection) = &removed {
            info!(
                "Connection unregistered: {} (user {}, {}s)",
                connection_id,
                connection.user_id,
                connection.uptime_secs()
            );
        }
        removed
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<PeerConnection>> {
        self.connections.get(connection_id).map(|c| c.clone())
    }

    /// User behind a connection
    pub fn user_of(&self, connection_id: &str) -> Option<UserId> {
        self.connections
            .get(connection_id)
            .map(|c| c.user_id.clone())
    }

    /// Send to one connection. Returns false if it is gone.
    pub fn send(&self, connection_id: &str, msg: ServerMessage) -> bool {
        match self.connections.get(connection_id) {
            Some(connection) => match connection.send(msg) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Dropping message: {}", e);
                    false
                }
            },
            None => false,
        }
    }

    /// Send the same message to several connections
    pub fn send_all<'a>(
        &self,
        connection_ids: impl IntoIterator<Item = &'a ConnectionId>,
        msg: &ServerMessage,
    ) -> usize {
        connection_ids
            .into_iter()
            .filter(|id| self.send(id, msg.clone()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
