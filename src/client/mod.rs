//! Client side of the session protocol.
//!
//! `reconnect` holds the pure connection state machine; `session` drives it
//! over a real WebSocket.

pub mod reconnect;
pub mod session;

pub use reconnect::{transition, ConnectionEvent, ConnectionState, Effect, ReconnectionManager, Transition};
pub use session::{ClientConfig, ClientError, ClientEvent, ClientHandle, CollabClient};
