//! Sled-based document store.
//!
//! Two trees:
//! - `documents`: document id → JSON-encoded `PersistedDocument`
//! - `metadata`: document id → bincode-encoded `DocumentMetadata`
//!
//! Content is JSON because the payload is an arbitrary `serde_json::Value`,
//! which bincode cannot decode.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::{DocumentMetadata, DocumentStore, PersistedDocument, StorageConfig};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Content encoding error: {0}")]
    Content(#[from] serde_json::Error),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

const TREE_DOCUMENTS: &str = "documents";
const TREE_METADATA: &str = "metadata";

/// Sled-backed implementation of `DocumentStore`
#[derive(Clone)]
pub struct SledDocumentStore {
    db: Arc<Db>,
    documents: Tree,
    metadata: Tree,
}

impl SledDocumentStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let documents = db.open_tree(TREE_DOCUMENTS)?;
        let metadata = db.open_tree(TREE_METADATA)?;

        Ok(Self {
            db: Arc::new(db),
            documents,
            metadata,
        })
    }

    /// Store a document snapshot and bump its metadata
    pub fn save_document(&self, document: &PersistedDocument) -> StorageResult<()> {
        let bytes = serde_json::to_vec(document)?;
        let size = bytes.len();
        self.documents
            .insert(document.document_id.as_bytes(), bytes)?;

        let mut meta = self
            .get_metadata(&document.document_id)?
            .unwrap_or_else(|| DocumentMetadata::new(&document.document_id));
        meta.record_write(size);
        self.save_metadata(&meta)?;

        debug!(
            "Stored document {} ({} bytes, write #{})",
            document.document_id, size, meta.write_count
        );
        Ok(())
    }

    /// Load a document snapshot
    pub fn load_document(&self, document_id: &str) -> StorageResult<Option<PersistedDocument>> {
        match self.documents.get(document_id.as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub fn document_exists(&self, document_id: &str) -> StorageResult<bool> {
        Ok(self.documents.contains_key(document_id.as_bytes())?)
    }

    /// Save document metadata
    pub fn save_metadata(&self, meta: &DocumentMetadata) -> StorageResult<()> {
        let bytes = bincode::serialize(meta)?;
        self.metadata.insert(meta.document_id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Load document metadata
    pub fn get_metadata(&self, document_id: &str) -> StorageResult<Option<DocumentMetadata>> {
        match self.metadata.get(document_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            document_count: self.documents.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

#[async_trait]
impl DocumentStore for SledDocumentStore {
    async fn write_content(
        &self,
        document_id: &str,
        payload: &Value,
        updated_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.save_document(&PersistedDocument {
            document_id: document_id.to_string(),
            payload: payload.clone(),
            updated_at,
        })
    }

    async fn read_content(&self, document_id: &str) -> StorageResult<Option<PersistedDocument>> {
        self.load_document(document_id)
    }
}

/// Statistics about the storage
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub document_count: usize,
    pub total_size_bytes: u64,
}

impl Drop for SledDocumentStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}
