//! SessionServer: wires the session components together.
//!
//! The transport hands every decoded client message to `handle_message`.
//! The server resolves the sending connection, applies access checks and
//! delegates to the presence tracker or broadcaster. Errors that concern the
//! client are answered with an `error` message on its own channel; nothing
//! here is fatal to the process.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broadcast::OperationBroadcaster;
use super::connection::{ConnectionHub, PeerConnection};
use super::persistence::PersistenceCoordinator;
use super::presence::PresenceTracker;
use super::protocol::{ClientMessage, DocumentSnapshot, ErrorCode, FrameCodec, ServerMessage};
use super::registry::SessionRegistry;
use super::{SessionConfig, SessionError, UserId};
use crate::auth::IdentityStore;
use crate::storage::DocumentStore;

/// The session engine
pub struct SessionServer {
    /// Engine tunables
    config: SessionConfig,
    /// Open connections
    hub: Arc<ConnectionHub>,
    /// Room membership
    registry: Arc<SessionRegistry>,
    /// Presence records and announcements
    presence: Arc<PresenceTracker>,
    /// Content fan-out
    broadcaster: OperationBroadcaster,
    /// Debounced writes
    persistence: Arc<PersistenceCoordinator>,
    /// Access checks
    identity: Arc<dyn IdentityStore>,
    /// Server start time
    started_at: Instant,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl SessionServer {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityStore>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let hub = Arc::new(ConnectionHub::new());
        let registry = Arc::new(SessionRegistry::new());
        let presence = Arc::new(PresenceTracker::new(
            registry.clone(),
            hub.clone(),
            config.presence_timeout,
        ));
        let persistence = Arc::new(PersistenceCoordinator::new(
            store,
            config.save_debounce,
            config.save_retry.clone(),
        ));
        let broadcaster =
            OperationBroadcaster::new(registry.clone(), hub.clone(), persistence.clone());

        Self {
            config,
            hub,
            registry,
            presence,
            broadcaster,
            persistence,
            identity,
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stop background tasks and write everything still pending
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.persistence.flush_all().await;
    }

    /// Register an authenticated connection and greet it
    pub fn register_connection(
        &self,
        user_id: &str,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Arc<PeerConnection> {
        let connection_id = Uuid::new_v4().to_string();
        let connection = self.hub.register(&connection_id, user_id, tx);

        let _ = connection.send(ServerMessage::Connected {
            connection_id: connection_id.clone(),
            user_id: user_id.to_string(),
            server_time: Utc::now().timestamp_millis(),
        });
        connection
    }

    /// Transport-level disconnect. Runs once per connection.
    pub fn unregister_connection(&self, connection_id: &str) {
        // Hub first: a join racing with this call sees the connection gone.
        self.hub.unregister(connection_id);
        let left = self.presence.disconnect(connection_id);
        if !left.is_empty() {
            info!(
                "Connection {} disconnected from {} rooms",
                connection_id,
                left.len()
            );
        }
    }

    /// Handle a text frame
    pub async fn handle_text(&self, connection_id: &str, text: &str) {
        match FrameCodec::decode_client_text(text, self.config.max_message_size) {
            Ok(msg) => self.handle_message(connection_id, msg).await,
            Err(e) => warn!("Dropping malformed text frame from {}: {}", connection_id, e),
        }
    }

    /// Handle a binary frame
    pub async fn handle_binary(&self, connection_id: &str, data: &[u8]) {
        match FrameCodec::decode_client_binary(data, self.config.max_message_size) {
            Ok(msg) => self.handle_message(connection_id, msg).await,
            Err(e) => warn!("Dropping malformed binary frame from {}: {}", connection_id, e),
        }
    }

    /// Handle a decoded client message
    pub async fn handle_message(&self, connection_id: &str, msg: ClientMessage) {
        let Some(user_id) = self.hub.user_of(connection_id) else {
            debug!("Message from unknown connection {}", connection_id);
            return;
        };

        match msg {
            ClientMessage::Join { document_id } => {
                self.join(connection_id, &user_id, &document_id).await;
            }

            ClientMessage::Leave { document_id } => {
                self.presence.leave(connection_id, &document_id);
            }

            ClientMessage::ContentUpdate {
                document_id,
                payload,
            } => {
                if let Err(e) = self.broadcaster.submit(connection_id, &document_id, payload) {
                    self.reply_error(connection_id, e, &document_id);
                }
            }

            ClientMessage::Cursor {
                document_id,
                cursor,
            } => {
                if let Err(e) = self.presence.activity(connection_id, &document_id, cursor) {
                    self.reply_error(connection_id, e, &document_id);
                }
            }

            ClientMessage::Ping { timestamp } => {
                self.presence.heartbeat(connection_id);
                self.hub.send(
                    connection_id,
                    ServerMessage::Pong {
                        timestamp,
                        server_time: Utc::now().timestamp_millis(),
                    },
                );
            }
        }
    }

    async fn join(&self, connection_id: &str, user_id: &UserId, document_id: &str) {
        match self.identity.can_join(user_id, document_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("User {} denied access to document {}", user_id, document_id);
                self.reply_error(
                    connection_id,
                    SessionError::Forbidden(document_id.to_string()),
                    document_id,
                );
                return;
            }
            Err(e) => {
                error!("Access check for {} on {} failed: {}", user_id, document_id, e);
                self.reply_error(
                    connection_id,
                    SessionError::Upstream(e.to_string()),
                    document_id,
                );
                return;
            }
        }

        let snapshot = self.snapshot(document_id).await;
        self.presence
            .join(connection_id, document_id, user_id, snapshot);

        // The connection may have closed while we were waiting on lookups.
        if self.hub.get(connection_id).is_none() {
            self.presence.leave(connection_id, document_id);
        }
    }

    /// Freshest content for a joining connection
    async fn snapshot(&self, document_id: &str) -> Option<DocumentSnapshot> {
        if let Some(candidate) = self.persistence.latest(document_id) {
            return Some(DocumentSnapshot {
                payload: candidate.payload,
                updated_at: candidate.arrived_at,
            });
        }

        match self.persistence.store().read_content(document_id).await {
            Ok(stored) => stored.map(|doc| DocumentSnapshot {
                payload: doc.payload,
                updated_at: doc.updated_at,
            }),
            Err(e) => {
                error!("Failed to load document {}: {}", document_id, e);
                None
            }
        }
    }

    fn reply_error(&self, connection_id: &str, err: SessionError, document_id: &str) {
        let code = match &err {
            SessionError::Forbidden(_) => ErrorCode::Forbidden,
            SessionError::NotJoined(_) => ErrorCode::NotJoined,
            _ => ErrorCode::ServerError,
        };
        self.hub.send(
            connection_id,
            ServerMessage::error(code, err.to_string(), Some(document_id.to_string())),
        );
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_connections: self.hub.len(),
            active_rooms: self.registry.room_count(),
            total_memberships: self.registry.membership_count(),
            pending_saves: self.persistence.pending_count(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn persistence(&self) -> &Arc<PersistenceCoordinator> {
        &self.persistence
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start background tasks (presence sweep)
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let server = self.clone();
        let sweep_interval = server.config.presence_sweep_interval;
        let mut shutdown = server.shutdown_receiver();

        let sweep_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let expired = server.presence.sweep_expired();
                        if expired > 0 {
                            info!("Presence sweep expired {} users", expired);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Presence sweep shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            sweep_task: sweep_handle,
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub active_connections: usize,
    pub active_rooms: usize,
    pub total_memberships: usize,
    pub pending_saves: usize,
    pub uptime_seconds: u64,
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub sweep_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = self.sweep_task.await;
    }
}
