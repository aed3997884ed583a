//! HTTP and WebSocket surface.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, ConnectionAuthenticator, Handshake};
use crate::sync::protocol::{FrameCodec, ServerMessage, PROTOCOL_VERSION};
use crate::sync::{SessionServer, UserId};

/// Shared application state
pub struct AppState {
    /// Session engine
    pub server: Arc<SessionServer>,
    /// Handshake validation
    pub authenticator: Arc<ConnectionAuthenticator>,
    /// Server start time
    started_at: Instant,
}

impl AppState {
    pub fn new(server: Arc<SessionServer>, authenticator: Arc<ConnectionAuthenticator>) -> Self {
        Self {
            server,
            authenticator,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub protocol_version: u8,
    pub uptime_seconds: u64,
    pub active_connections: usize,
    pub active_rooms: usize,
    pub pending_saves: usize,
}

/// Query string of the upgrade request
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.server.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_connections: stats.active_connections,
        active_rooms: stats.active_rooms,
        pending_saves: stats.pending_saves,
    })
}

fn handshake_from(headers: &HeaderMap, params: WsParams) -> Handshake {
    Handshake {
        authorization: headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        query_token: params.token,
    }
}

/// WebSocket upgrade handler. Authenticates before upgrading.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let handshake = handshake_from(&headers, params);

    match state.authenticator.authenticate(&handshake).await {
        Ok(user_id) => {
            info!("WebSocket upgrade for user {}", user_id);
            ws.max_message_size(state.server.config().max_message_size)
                .on_upgrade(move |socket| handle_websocket(socket, user_id, state))
        }
        Err(AuthError::IdentityUnavailable(e)) => {
            warn!("Rejecting handshake, identity service unavailable: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "identity service unavailable").into_response()
        }
        Err(e) => {
            warn!("Rejecting handshake: {}", e);
            (StatusCode::UNAUTHORIZED, e.to_string()).into_response()
        }
    }
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, user_id: UserId, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create channel for sending messages to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let connection_id = state.server.register_connection(&user_id, tx).connection_id.clone();

    info!(
        "New WebSocket connection: connection={}, user={}",
        connection_id, user_id
    );

    // Forward messages from channel to WebSocket
    let send_id = connection_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match FrameCodec::encode_server_text(&msg) {
                Ok(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode message: {}", e);
                }
            }
        }
        debug!("Send task ended for connection {}", send_id);
    });

    // Handle incoming WebSocket messages
    let recv_id = connection_id.clone();
    let recv_server = state.server.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => recv_server.handle_text(&recv_id, &text).await,
                Message::Binary(data) => recv_server.handle_binary(&recv_id, &data).await,
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", recv_id);
                    break;
                }
                // Pong is handled automatically
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        debug!("Receive task ended for connection {}", recv_id);
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Cleanup
    state.server.unregister_connection(&connection_id);
    info!("Connection {} (user {}) disconnected", connection_id, user_id);
}
