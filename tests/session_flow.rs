//! End-to-end session flow over real sockets.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use collab_session::auth::{ConnectionAuthenticator, InMemoryIdentityStore};
use collab_session::client::{ClientConfig, ClientEvent, CollabClient, ConnectionState};
use collab_session::retry::RetryPolicy;
use collab_session::routes::{router, AppState};
use collab_session::storage::{SledDocumentStore, StorageConfig};
use collab_session::sync::protocol::{ClientMessage, FrameCodec, ServerMessage};
use collab_session::sync::{SessionConfig, SessionServer};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    server: Arc<SessionServer>,
    authenticator: Arc<ConnectionAuthenticator>,
    store: Arc<SledDocumentStore>,
    _dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SledDocumentStore::open(StorageConfig::new(
                dir.path().join("flow.sled").to_string_lossy().to_string(),
            ))
            .unwrap(),
        );
        let identity = Arc::new(InMemoryIdentityStore::with_users(["alice", "bob"]));
        let config = SessionConfig::default().with_save_debounce(Duration::from_millis(50));
        let server = Arc::new(SessionServer::new(config, store.clone(), identity.clone()));
        let authenticator = Arc::new(ConnectionAuthenticator::new(b"flow-secret", identity));

        let app = router(Arc::new(AppState::new(server.clone(), authenticator.clone())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            server,
            authenticator,
            store,
            _dir: dir,
        }
    }

    fn url_for(&self, user: &str) -> String {
        let token = self
            .authenticator
            .issue_token(user, Duration::from_secs(60))
            .unwrap();
        format!("ws://{}/ws?token={}", self.addr, token)
    }

    /// Connect and consume the `connected` greeting
    async fn connect(&self, user: &str) -> Socket {
        let (mut socket, _) = tokio_tungstenite::connect_async(self.url_for(user))
            .await
            .unwrap();
        match recv(&mut socket).await {
            ServerMessage::Connected { user_id, .. } => assert_eq!(user_id, user),
            other => panic!("expected connected, got {:?}", other),
        }
        socket
    }
}

async fn send(socket: &mut Socket, msg: ClientMessage) {
    let text = FrameCodec::encode_client_text(&msg).unwrap();
    socket.send(Message::Text(text)).await.unwrap();
}

async fn recv(socket: &mut Socket) -> ServerMessage {
    timeout(WAIT, async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return FrameCodec::decode_server_text(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for a server message")
}

fn join(document_id: &str) -> ClientMessage {
    ClientMessage::Join {
        document_id: document_id.to_string(),
    }
}

#[tokio::test]
async fn test_two_users_edit_one_document() {
    let server = TestServer::start().await;

    let mut alice = server.connect("alice").await;
    send(&mut alice, join("doc-1")).await;
    match recv(&mut alice).await {
        ServerMessage::CurrentCollaborators {
            document_id,
            members,
            snapshot,
        } => {
            assert_eq!(document_id, "doc-1");
            assert!(members.is_empty());
            assert!(snapshot.is_none());
        }
        other => panic!("unexpected {:?}", other),
    }

    let mut bob = server.connect("bob").await;
    send(&mut bob, join("doc-1")).await;
    match recv(&mut bob).await {
        ServerMessage::CurrentCollaborators { members, .. } => {
            let users: Vec<_> = members.iter().map(|m| m.user_id.as_str()).collect();
            assert_eq!(users, vec!["alice"]);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::MemberJoined {
            document_id: "doc-1".to_string(),
            user_id: "bob".to_string(),
        }
    );

    let payload = json!({ "text": "hello" });
    send(
        &mut alice,
        ClientMessage::ContentUpdate {
            document_id: "doc-1".to_string(),
            payload: payload.clone(),
        },
    )
    .await;
    assert_eq!(
        recv(&mut bob).await,
        ServerMessage::ContentUpdated {
            document_id: "doc-1".to_string(),
            payload: payload.clone(),
            user_id: "alice".to_string(),
        }
    );

    // The sender gets no echo: its next message is the pong.
    send(&mut alice, ClientMessage::Ping { timestamp: 7 }).await;
    match recv(&mut alice).await {
        ServerMessage::Pong { timestamp, .. } => assert_eq!(timestamp, 7),
        other => panic!("unexpected {:?}", other),
    }

    // Dropping the socket without a leave still announces the departure.
    drop(bob);
    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::MemberLeft {
            document_id: "doc-1".to_string(),
            user_id: "bob".to_string(),
        }
    );

    server.server.shutdown().await;
    let stored = server.store.load_document("doc-1").unwrap().unwrap();
    assert_eq!(stored.payload, payload);
}

#[tokio::test]
async fn test_late_joiner_receives_latest_content() {
    let server = TestServer::start().await;

    let mut alice = server.connect("alice").await;
    send(&mut alice, join("doc-2")).await;
    recv(&mut alice).await;
    send(
        &mut alice,
        ClientMessage::ContentUpdate {
            document_id: "doc-2".to_string(),
            payload: json!("draft"),
        },
    )
    .await;
    // Round trip so the update is processed before bob joins.
    send(&mut alice, ClientMessage::Ping { timestamp: 1 }).await;
    recv(&mut alice).await;

    let mut bob = server.connect("bob").await;
    send(&mut bob, join("doc-2")).await;
    match recv(&mut bob).await {
        ServerMessage::CurrentCollaborators { snapshot, .. } => {
            assert_eq!(snapshot.unwrap().payload, json!("draft"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_handshake_without_valid_token_is_rejected() {
    let server = TestServer::start().await;

    let missing = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr)).await;
    match missing {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }

    let garbage =
        tokio_tungstenite::connect_async(format!("ws://{}/ws?token=not-a-jwt", server.addr)).await;
    match garbage {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }

    let stranger = tokio_tungstenite::connect_async(server.url_for("mallory")).await;
    match stranger {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }

    assert_eq!(server.server.stats().active_connections, 0);
}

#[tokio::test]
async fn test_client_receives_peer_updates() {
    let server = TestServer::start().await;

    let token = server
        .authenticator
        .issue_token("bob", Duration::from_secs(60))
        .unwrap();
    let config = ClientConfig::new(format!("ws://{}/ws", server.addr), token);
    let (handle, mut events, task) = CollabClient::spawn(config);
    handle.join("doc-3").unwrap();

    // Wait until the client's join has landed.
    timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if let ClientEvent::Message(ServerMessage::CurrentCollaborators { .. }) = event {
                return;
            }
        }
        panic!("event stream ended");
    })
    .await
    .unwrap();

    let mut alice = server.connect("alice").await;
    send(&mut alice, join("doc-3")).await;
    recv(&mut alice).await;
    send(
        &mut alice,
        ClientMessage::ContentUpdate {
            document_id: "doc-3".to_string(),
            payload: json!({ "n": 1 }),
        },
    )
    .await;

    let received = timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if let ClientEvent::Message(ServerMessage::ContentUpdated { payload, user_id, .. }) = event {
                return (payload, user_id);
            }
        }
        panic!("event stream ended");
    })
    .await
    .unwrap();
    assert_eq!(received, (json!({ "n": 1 }), "alice".to_string()));

    handle.close().unwrap();
    timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_client_stops_on_rejected_token_until_reauthenticated() {
    let server = TestServer::start().await;

    let config = ClientConfig::new(format!("ws://{}/ws", server.addr), "bogus-token").with_retry(
        RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(10), 3),
    );
    let (handle, mut events, task) = CollabClient::spawn(config);

    let mut states = Vec::new();
    timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if let ClientEvent::StateChanged(state) = event {
                states.push(state);
                if state == ConnectionState::Unauthorized {
                    return;
                }
            }
        }
        panic!("event stream ended");
    })
    .await
    .unwrap();
    assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::Unauthorized]);

    // Well past the whole backoff schedule, nothing else happened.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());

    // Joining alone does not retry the rejected token.
    handle.join("doc-4").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());

    let token = server
        .authenticator
        .issue_token("bob", Duration::from_secs(60))
        .unwrap();
    handle.reauthenticate(token).unwrap();

    let roster = timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if let ClientEvent::Message(ServerMessage::CurrentCollaborators { document_id, .. }) = event {
                return document_id;
            }
        }
        panic!("event stream ended");
    })
    .await
    .unwrap();
    assert_eq!(roster, "doc-4");

    handle.close().unwrap();
    timeout(WAIT, task).await.unwrap().unwrap();
}
