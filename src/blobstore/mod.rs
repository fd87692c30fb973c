mod local;

pub use local::{pathify, LocalBlobstore};

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobstoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Blob not found: {0}")]
    NotFound(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Addresses one blob. Blob ids are opaque and never reused for different content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    pub space_id: String,
    pub blob_id: String,
}

impl BlobRef {
    pub fn new(space_id: impl Into<String>, blob_id: impl Into<String>) -> Self {
        Self {
            space_id: space_id.into(),
            blob_id: blob_id.into(),
        }
    }
}

/// Abstraction over blob storage media.
/// Blobs are meaningless without the node metadata that references them.
#[async_trait]
pub trait Blobstore: Send + Sync {
    /// Store the content of the local file at `source` under the blob ref.
    async fn upload(&self, blob: &BlobRef, source: &Path) -> Result<(), BlobstoreError>;
    async fn download(&self, blob: &BlobRef) -> Result<Bytes, BlobstoreError>;
    async fn delete(&self, blob: &BlobRef) -> Result<(), BlobstoreError>;
    async fn exists(&self, blob: &BlobRef) -> Result<bool, BlobstoreError>;
}
