//! Wire protocol for the real-time channel.
//!
//! Every message is a tagged variant serialized as JSON with a `type`
//! discriminator and camelCase fields. Text frames carry the JSON directly.
//! Binary frames wrap the same JSON body in a 5-byte header:
//! `[version u8][kind u8][length u24]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Cursor;

use super::{ConnectionId, DocumentId, UserId};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Message kind identifiers used in the binary frame header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    // Connection
    Connected = 0x01,
    Error = 0x04,

    // Room membership
    Join = 0x20,
    Leave = 0x21,
    CurrentCollaborators = 0x22,
    MemberJoined = 0x23,
    MemberLeft = 0x24,

    // Content
    ContentUpdate = 0x30,
    ContentUpdated = 0x31,

    // Presence
    Cursor = 0x40,
    CursorMoved = 0x41,

    // Keepalive
    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageKind::Connected),
            0x04 => Ok(MessageKind::Error),
            0x20 => Ok(MessageKind::Join),
            0x21 => Ok(MessageKind::Leave),
            0x22 => Ok(MessageKind::CurrentCollaborators),
            0x23 => Ok(MessageKind::MemberJoined),
            0x24 => Ok(MessageKind::MemberLeft),
            0x30 => Ok(MessageKind::ContentUpdate),
            0x31 => Ok(MessageKind::ContentUpdated),
            0x40 => Ok(MessageKind::Cursor),
            0x41 => Ok(MessageKind::CursorMoved),
            0xF0 => Ok(MessageKind::Ping),
            0xF1 => Ok(MessageKind::Pong),
            _ => Err(ProtocolError::UnknownMessageKind(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message kind: 0x{0:02X}")]
    UnknownMessageKind(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join a document's room
    Join { document_id: DocumentId },

    /// Leave a document's room
    Leave { document_id: DocumentId },

    /// Replace the document content
    ContentUpdate {
        document_id: DocumentId,
        payload: Value,
    },

    /// Cursor or selection activity, opaque to the server
    Cursor {
        document_id: DocumentId,
        cursor: Value,
    },

    /// Keepalive, also refreshes presence in every joined room
    Ping { timestamp: u64 },
}

impl ClientMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ClientMessage::Join { .. } => MessageKind::Join,
            ClientMessage::Leave { .. } => MessageKind::Leave,
            ClientMessage::ContentUpdate { .. } => MessageKind::ContentUpdate,
            ClientMessage::Cursor { .. } => MessageKind::Cursor,
            ClientMessage::Ping { .. } => MessageKind::Ping,
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Sent once after a successful handshake
    Connected {
        connection_id: ConnectionId,
        user_id: UserId,
        server_time: i64,
    },

    /// Full roster for a freshly joined room
    CurrentCollaborators {
        document_id: DocumentId,
        members: Vec<Collaborator>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<DocumentSnapshot>,
    },

    /// A user entered the room
    MemberJoined {
        document_id: DocumentId,
        user_id: UserId,
    },

    /// A user's last connection left the room
    MemberLeft {
        document_id: DocumentId,
        user_id: UserId,
    },

    /// Content relayed from another member
    ContentUpdated {
        document_id: DocumentId,
        payload: Value,
        user_id: UserId,
    },

    /// Cursor activity relayed from another member
    CursorMoved {
        document_id: DocumentId,
        user_id: UserId,
        cursor: Value,
    },

    /// Error response
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document_id: Option<DocumentId>,
    },

    /// Pong response
    Pong { timestamp: u64, server_time: i64 },
}

impl ServerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ServerMessage::Connected { .. } => MessageKind::Connected,
            ServerMessage::CurrentCollaborators { .. } => MessageKind::CurrentCollaborators,
            ServerMessage::MemberJoined { .. } => MessageKind::MemberJoined,
            ServerMessage::MemberLeft { .. } => MessageKind::MemberLeft,
            ServerMessage::ContentUpdated { .. } => MessageKind::ContentUpdated,
            ServerMessage::CursorMoved { .. } => MessageKind::CursorMoved,
            ServerMessage::Error { .. } => MessageKind::Error,
            ServerMessage::Pong { .. } => MessageKind::Pong,
        }
    }

    /// Build an error message
    pub fn error(
        code: ErrorCode,
        message: impl Into<String>,
        document_id: Option<DocumentId>,
    ) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            document_id,
        }
    }
}

/// Roster entry in `currentCollaborators`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub user_id: UserId,
    /// Milliseconds since epoch
    pub joined_at: i64,
}

/// Latest known content handed to a joining connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

/// Error codes for server responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Forbidden,
    NotJoined,
    ServerError,
}

/// Codec for text and binary frames
pub struct FrameCodec;

impl FrameCodec {
    /// Decode a client text frame
    pub fn decode_client_text(text: &str, max_size: usize) -> Result<ClientMessage, ProtocolError> {
        if text.len() > max_size {
            return Err(ProtocolError::MessageTooLarge(text.len(), max_size));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Decode a client binary frame
    pub fn decode_client_binary(data: &[u8], max_size: usize) -> Result<ClientMessage, ProtocolError> {
        let (kind, body) = Self::split_frame(data, max_size)?;
        let msg: ClientMessage = serde_json::from_slice(body)?;

        if msg.kind() != kind {
            return Err(ProtocolError::InvalidFormat(format!(
                "Header kind {:?} does not match body kind {:?}",
                kind,
                msg.kind()
            )));
        }

        Ok(msg)
    }

    /// Encode a server message as a text frame
    pub fn encode_server_text(msg: &ServerMessage) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(msg)?)
    }

    /// Encode a client message as a text frame
    pub fn encode_client_text(msg: &ClientMessage) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(msg)?)
    }

    /// Decode a server text frame
    pub fn decode_server_text(text: &str) -> Result<ServerMessage, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode a client message as a binary frame
    pub fn encode_client_binary(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        Self::frame(msg.kind(), &serde_json::to_vec(msg)?)
    }

    fn frame(kind: MessageKind, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                payload.len() + HEADER_LEN,
                MAX_MESSAGE_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(kind as u8);
        buf.put_u24(payload.len() as u32);
        buf.put_slice(payload);

        Ok(buf.freeze())
    }

    fn split_frame(data: &[u8], max_size: usize) -> Result<(MessageKind, &[u8]), ProtocolError> {
        if data.len() > max_size {
            return Err(ProtocolError::MessageTooLarge(data.len(), max_size));
        }
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidFormat("Message too short".to_string()));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        let kind = MessageKind::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() < HEADER_LEN + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                HEADER_LEN + payload_len,
                data.len()
            )));
        }

        Ok((kind, &data[HEADER_LEN..HEADER_LEN + payload_len]))
    }
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}
