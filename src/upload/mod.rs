//! Resumable upload sessions: durable session records, the session store, node
//! creation/versioning for finished uploads, and cleanup.

pub mod checksum;
mod cleanup;
pub mod metadata;
pub mod node_creator;
mod session;
mod store;

pub use metadata::{SessionMetadata, SessionPhase};
pub use session::{SessionState, Upload, UploadInfo, UploadSession};
pub use store::{InitiateRequest, SessionStore, StoreOptions, TokenOptions, UploadSessionFilter};
