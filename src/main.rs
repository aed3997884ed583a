//! Collab Session Server
//!
//! Serves the session engine over axum WebSockets:
//! - JWT-authenticated upgrade on `/ws`
//! - Per-document rooms with presence and ordered content relay
//! - Debounced last-writer-wins persistence into Sled

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use collab_session::auth::{
    ConnectionAuthenticator, HttpIdentityStore, IdentityStore, InMemoryIdentityStore,
};
use collab_session::config::ServerConfig;
use collab_session::routes::{router, AppState};
use collab_session::storage::SledDocumentStore;
use collab_session::sync::protocol::PROTOCOL_VERSION;
use collab_session::sync::{PersistenceEvent, SessionServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_session=info,tower_http=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();
    let config = ServerConfig::from_env().context("Invalid configuration")?;

    if config.uses_dev_secret() {
        warn!("JWT_SECRET not set - using the development secret");
    }

    // Initialize storage
    info!("Initializing storage at: {}", config.storage_path);
    let store = Arc::new(
        SledDocumentStore::open(config.storage_config()).context("Failed to open storage")?,
    );
    info!("Storage initialized ({} documents)", store.stats().document_count);

    let identity: Arc<dyn IdentityStore> = match &config.identity_service_url {
        Some(url) => {
            info!("Using identity service at {}", url);
            Arc::new(HttpIdentityStore::new(url.as_str()).context("Failed to build identity client")?)
        }
        None => {
            info!("Using in-memory identity store with {} users", config.users.len());
            Arc::new(InMemoryIdentityStore::with_users(config.users.iter().cloned()))
        }
    };

    let server = Arc::new(SessionServer::new(
        config.session_config(),
        store.clone(),
        identity.clone(),
    ));
    let authenticator = Arc::new(ConnectionAuthenticator::new(
        config.jwt_secret.as_bytes(),
        identity,
    ));

    // Surface save failures
    let mut events = server.persistence().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let PersistenceEvent::Failed {
                document_id,
                attempts,
                error,
            } = event
            {
                warn!(
                    "Document {} is unsaved after {} attempts: {}",
                    document_id, attempts, error
                );
            }
        }
    });

    // Start background tasks
    let background = server.clone().start_background_tasks();

    let app = router(Arc::new(AppState::new(server.clone(), authenticator)));

    let addr = config.server_address();
    info!("Collab session server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws?token=<jwt>", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down, flushing pending saves");
    server.shutdown().await;
    background.wait().await;
    store.flush().context("Failed to flush storage")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
