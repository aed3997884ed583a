//! Collab Session - real-time collaborative session engine
//!
//! Authenticated WebSocket connections join per-document rooms, see each
//! other's presence, relay content operations in arrival order, and have the
//! latest content written to durable storage after a quiet period.
//!
//! - `auth`: handshake tokens and identity lookups
//! - `sync`: rooms, presence, broadcast and persistence
//! - `storage`: sled-backed document store
//! - `routes`: axum HTTP/WebSocket surface
//! - `client`: reconnecting client and its state machine

pub mod auth;
pub mod client;
pub mod config;
pub mod retry;
pub mod routes;
pub mod storage;
pub mod sync;
