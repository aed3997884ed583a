//! Fan-out of content operations to a room.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::connection::ConnectionHub;
use super::persistence::PersistenceCoordinator;
use super::presence::touch_in;
use super::protocol::ServerMessage;
use super::registry::SessionRegistry;
use super::{DocumentId, SessionError, SessionResult, UserId};

/// One accepted content mutation. Relayed, never retained.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub payload: Value,
    pub arrived_at: DateTime<Utc>,
}

/// Relays operations to the other members of a room.
///
/// Sends and the persistence hand-off happen under the room lock, so every
/// receiver and the store see one order per room.
pub struct OperationBroadcaster {
    registry: Arc<SessionRegistry>,
    hub: Arc<ConnectionHub>,
    persistence: Arc<PersistenceCoordinator>,
}

impl OperationBroadcaster {
    pub fn new(
        registry: Arc<SessionRegistry>,
        hub: Arc<ConnectionHub>,
        persistence: Arc<PersistenceCoordinator>,
    ) -> Self {
        Self {
            registry,
            hub,
            persistence,
        }
    }

    /// Relay `payload` from `connection_id` to the rest of the room
    pub fn submit(
        &self,
        connection_id: &str,
        document_id: &str,
        payload: Value,
    ) -> SessionResult<Operation> {
        let result = self.registry.with_room(document_id, |state| {
            let user_id = state
                .user_of(connection_id)
                .cloned()
                .ok_or_else(|| SessionError::NotJoined(document_id.to_string()))?;

            touch_in(state, &user_id);

            let operation = Operation {
                document_id: document_id.to_string(),
                user_id,
                payload,
                arrived_at: Utc::now(),
            };

            let update = ServerMessage::ContentUpdated {
                document_id: operation.document_id.clone(),
                payload: operation.payload.clone(),
                user_id: operation.user_id.clone(),
            };
            let delivered = self.hub.send_all(state.connections_except(connection_id), &update);

            self.persistence.record(
                document_id,
                operation.payload.clone(),
                operation.arrived_at,
            );

            debug!(
                "Operation from {} on {} relayed to {} connections",
                operation.user_id, document_id, delivered
            );
            Ok(operation)
        });

        result.unwrap_or_else(|| Err(SessionError::NotJoined(document_id.to_string())))
            .map_err(|e| {
                warn!("Rejected operation from {} on {}: {}", connection_id, document_id, e);
                e
            })
    }
}
