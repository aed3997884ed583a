//! Durable storage for document content.
//!
//! The session engine only ever writes whole snapshots (last writer wins)
//! and reads the latest one back for joining connections. `DocumentStore`
//! is the seam; `SledDocumentStore` is the embedded implementation.

mod sled_store;

pub use sled_store::{SledDocumentStore, StorageError, StorageResult, StorageStats};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Durable home of document content
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Replace the stored content of a document
    async fn write_content(
        &self,
        document_id: &str,
        payload: &Value,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Latest stored content, if any
    async fn read_content(&self, document_id: &str) -> StorageResult<Option<PersistedDocument>>;
}

/// Snapshot of a document as last written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDocument {
    pub document_id: String,
    /// Opaque content payload
    pub payload: Value,
    /// Arrival time of the operation that produced this content
    pub updated_at: DateTime<Utc>,
}

/// Metadata stored alongside document snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Document identifier
    pub document_id: String,
    /// Unix timestamp of the first write
    pub created_at: i64,
    /// Unix timestamp of the last write
    pub updated_at: i64,
    /// Number of writes so far
    pub write_count: u64,
    /// Size of the serialized content in bytes
    pub size_bytes: u64,
}

impl DocumentMetadata {
    pub fn new(document_id: impl Into<String>) -> Self {
        let now = Utc::now().timestamp();
        Self {
            document_id: document_id.into(),
            created_at: now,
            updated_at: now,
            write_count: 0,
            size_bytes: 0,
        }
    }

    /// Account for one more write of `size_bytes`
    pub fn record_write(&mut self, size_bytes: usize) {
        self.updated_at = Utc::now().timestamp();
        self.write_count += 1;
        self.size_bytes = size_bytes as u64;
    }
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 256MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = flush only on demand)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/collab.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval_ms(mut self, interval: u64) -> Self {
        self.flush_interval_ms = interval;
        self
    }
}
