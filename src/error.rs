use thiserror::Error;

use crate::blobstore::BlobstoreError;
use crate::events::EventError;
use crate::storage::quota::QuotaExceeded;
use crate::storage::DatabaseError;

/// Errors surfaced by upload operations. The transport maps the kinds onto protocol codes.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("Aborted: {0}")]
    Aborted(String),
    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),
    #[error("Insufficient storage: {0}")]
    InsufficientStorage(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Blobstore error: {0}")]
    Blobstore(#[from] BlobstoreError),
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Session encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("Session decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

impl From<QuotaExceeded> for UploadError {
    fn from(e: QuotaExceeded) -> Self {
        UploadError::InsufficientStorage(e.to_string())
    }
}

impl UploadError {
    pub fn is_not_found(&self) -> bool {
        match self {
            UploadError::NotFound(_) => true,
            UploadError::Blobstore(BlobstoreError::NotFound(_)) => true,
            UploadError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T, E = UploadError> = std::result::Result<T, E>;
