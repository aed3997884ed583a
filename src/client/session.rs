//! Reconnecting WebSocket client.
//!
//! One driver task owns the socket and the `ReconnectionManager`. The
//! application talks to it through a cloneable `ClientHandle` and receives
//! `ClientEvent`s on a channel. While the connection is down, room joins and
//! leaves are remembered but content and cursor messages are dropped.

use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::reconnect::{ConnectionEvent, ConnectionState, Effect, ReconnectionManager};
use crate::retry::RetryPolicy;
use crate::sync::protocol::{ClientMessage, FrameCodec, ProtocolError, ServerMessage};
use crate::sync::DocumentId;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How often presence is refreshed with a `ping`
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Encoding failed: {0}")]
    Encode(#[from] ProtocolError),

    #[error("Token cannot be used as a header value")]
    InvalidToken,

    #[error("Handshake rejected by the server")]
    Unauthorized,

    #[error("Client is closed")]
    Closed,
}

/// Where and how to connect
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL, e.g. `ws://localhost:5000/ws`
    pub url: String,
    /// Bearer token for the handshake
    pub token: String,
    pub heartbeat_interval: Duration,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            retry: RetryPolicy::reconnect(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// What the application sees
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    Message(ServerMessage),
}

enum Command {
    Join(DocumentId),
    Leave(DocumentId),
    Send(ClientMessage),
    Reauthenticate(String),
    Close,
}

/// Cloneable control surface of a running client
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    pub fn join(&self, document_id: impl Into<String>) -> Result<(), ClientError> {
        self.command(Command::Join(document_id.into()))
    }

    pub fn leave(&self, document_id: impl Into<String>) -> Result<(), ClientError> {
        self.command(Command::Leave(document_id.into()))
    }

    pub fn send_content(&self, document_id: impl Into<String>, payload: Value) -> Result<(), ClientError> {
        self.command(Command::Send(ClientMessage::ContentUpdate {
            document_id: document_id.into(),
            payload,
        }))
    }

    pub fn send_cursor(&self, document_id: impl Into<String>, cursor: Value) -> Result<(), ClientError> {
        self.command(Command::Send(ClientMessage::Cursor {
            document_id: document_id.into(),
            cursor,
        }))
    }

    /// Replace the handshake token.
    ///
    /// A client stopped in `Unauthorized` reconnects with it; otherwise it is
    /// used from the next handshake on.
    pub fn reauthenticate(&self, token: impl Into<String>) -> Result<(), ClientError> {
        self.command(Command::Reauthenticate(token.into()))
    }

    /// Close the connection and stop reconnecting
    pub fn close(&self) -> Result<(), ClientError> {
        self.command(Command::Close)
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.tx.send(command).map_err(|_| ClientError::Closed)
    }
}

/// Entry point for the reconnecting client
pub struct CollabClient;

impl CollabClient {
    /// Start the driver task. It connects immediately.
    pub fn spawn(
        config: ClientConfig,
    ) -> (ClientHandle, mpsc::UnboundedReceiver<ClientEvent>, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            manager: ReconnectionManager::new(config.retry.clone()),
            config,
            commands: command_rx,
            events: event_tx,
            closing: false,
        };
        let task = tokio::spawn(driver.run());

        (ClientHandle { tx: command_tx }, event_rx, task)
    }
}

enum SessionEnd {
    Dropped,
    UserClosed,
}

struct Driver {
    config: ClientConfig,
    manager: ReconnectionManager,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    closing: bool,
}

impl Driver {
    async fn run(mut self) {
        let mut effect = self.step(ConnectionEvent::Connect);

        while !self.closing {
            effect = match effect {
                Effect::OpenSocket => self.open().await,
                Effect::ScheduleRetry(delay) => self.back_off(delay).await,
                Effect::GiveUp | Effect::CancelRetry | Effect::None | Effect::Resync => {
                    self.wait_idle().await
                }
            };
        }

        debug!("Client driver stopped");
    }

    fn step(&mut self, event: ConnectionEvent) -> Effect {
        let before = self.manager.state();
        let effect = self.manager.handle(event);
        let after = self.manager.state();
        if before != after {
            let _ = self.events.send(ClientEvent::StateChanged(after));
        }
        effect
    }

    async fn open(&mut self) -> Effect {
        match self.connect().await {
            Ok(socket) => {
                info!("Connected to {}", self.config.url);
                // Resync is the only effect of a successful open.
                self.step(ConnectionEvent::Opened);
                match self.session(socket).await {
                    SessionEnd::Dropped => {
                        warn!("Connection to {} lost", self.config.url);
                        self.step(ConnectionEvent::Closed)
                    }
                    SessionEnd::UserClosed => {
                        self.closing = true;
                        self.step(ConnectionEvent::UserClose)
                    }
                }
            }
            Err(e @ (ClientError::Unauthorized | ClientError::InvalidToken)) => {
                warn!("Handshake with {} rejected: {}", self.config.url, e);
                self.step(ConnectionEvent::AuthRejected)
            }
            Err(e) => {
                warn!("Connection attempt to {} failed: {}", self.config.url, e);
                self.step(ConnectionEvent::AttemptFailed)
            }
        }
    }

    async fn connect(&self) -> Result<Socket, ClientError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.token))
            .map_err(|_| ClientError::InvalidToken)?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| match e {
                WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    ClientError::Unauthorized
                }
                other => ClientError::WebSocket(other),
            })?;
        Ok(socket)
    }

    /// Wait out a backoff while still accepting room changes
    async fn back_off(&mut self, delay: Duration) -> Effect {
        debug!("Reconnecting in {:?}", delay);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return self.step(ConnectionEvent::BackoffElapsed),
                command = self.commands.recv() => {
                    if let Some(effect) = self.offline_command(command) {
                        return effect;
                    }
                }
            }
        }
    }

    /// Idle, failed or unauthorized: nothing happens until the application acts.
    ///
    /// After a rejected handshake only a new token reconnects.
    async fn wait_idle(&mut self) -> Effect {
        loop {
            let command = self.commands.recv().await;
            let wants_connection = match &command {
                Some(Command::Reauthenticate(_)) => true,
                Some(Command::Join(_)) => self.manager.state() != ConnectionState::Unauthorized,
                _ => false,
            };
            if let Some(effect) = self.offline_command(command) {
                return effect;
            }
            if wants_connection {
                return self.step(ConnectionEvent::Connect);
            }
        }
    }

    /// Handle a command while there is no socket.
    ///
    /// Returns an effect when the command ends the current wait.
    fn offline_command(&mut self, command: Option<Command>) -> Option<Effect> {
        match command {
            Some(Command::Join(document_id)) => {
                self.manager.join_room(&document_id);
                None
            }
            Some(Command::Leave(document_id)) => {
                let before = self.manager.state();
                let (_, effect) = self.manager.leave_room(&document_id);
                if self.manager.state() != before {
                    let _ = self
                        .events
                        .send(ClientEvent::StateChanged(self.manager.state()));
                }
                (effect == Effect::CancelRetry).then_some(effect)
            }
            Some(Command::Send(msg)) => {
                warn!("Not connected, dropping {:?} message", msg.kind());
                None
            }
            Some(Command::Reauthenticate(token)) => {
                self.config.token = token;
                None
            }
            Some(Command::Close) | None => {
                self.closing = true;
                Some(self.step(ConnectionEvent::UserClose))
            }
        }
    }

    async fn session(&mut self, socket: Socket) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();

        for join in self.manager.resync_messages() {
            if send(&mut sink, &join).await.is_err() {
                return SessionEnd::Dropped;
            }
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                frame = stream.next() => {
                    if !self.on_frame(frame, &mut sink).await {
                        return SessionEnd::Dropped;
                    }
                }
                command = self.commands.recv() => {
                    let outgoing = match command {
                        Some(Command::Join(document_id)) => self.manager.join_room(&document_id),
                        Some(Command::Leave(document_id)) => self.manager.leave_room(&document_id).0,
                        Some(Command::Send(msg)) => Some(msg),
                        Some(Command::Reauthenticate(token)) => {
                            self.config.token = token;
                            None
                        }
                        Some(Command::Close) | None => {
                            let _ = sink.send(Message::Close(None)).await;
                            return SessionEnd::UserClosed;
                        }
                    };
                    if let Some(msg) = outgoing {
                        if send(&mut sink, &msg).await.is_err() {
                            return SessionEnd::Dropped;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let ping = ClientMessage::Ping {
                        timestamp: Utc::now().timestamp_millis() as u64,
                    };
                    if send(&mut sink, &ping).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
            }
        }
    }

    /// Returns false once the socket is gone
    async fn on_frame(
        &mut self,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
        sink: &mut SplitSink<Socket, Message>,
    ) -> bool {
        match frame {
            Some(Ok(Message::Text(text))) => {
                match FrameCodec::decode_server_text(&text) {
                    Ok(msg) => {
                        if let Some(rejoin) = self.manager.apply(&msg) {
                            if send(sink, &rejoin).await.is_err() {
                                return false;
                            }
                        }
                        let _ = self.events.send(ClientEvent::Message(msg));
                    }
                    Err(e) => warn!("Ignoring malformed server message: {}", e),
                }
                true
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => false,
            Some(Ok(_)) => true,
        }
    }
}

async fn send(sink: &mut SplitSink<Socket, Message>, msg: &ClientMessage) -> Result<(), ClientError> {
    let text = FrameCodec::encode_client_text(msg)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}
