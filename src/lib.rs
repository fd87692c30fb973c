//! upload-engine - resumable uploads into a versioned node tree
//!
//! This crate turns a stream of bytes plus client metadata into a durable, checksummed node:
//! - Resumable upload sessions persisted as msgpack `.info` records next to their bytes
//! - Node metadata, child index and revisions in a redb database
//! - Content-addressed blobs behind a swappable blob store
//! - An event-driven postprocessing loop that finalizes, reverts and cleans up uploads

pub mod blobstore;
pub mod config;
pub mod error;
pub mod events;
pub mod lock;
pub mod postprocessing;
pub mod storage;
#[cfg(test)]
pub mod testutil;
pub mod tree;
pub mod upload;

pub use error::UploadError;
