//! Durable record of one resumable upload, stored as named msgpack in `<id>.info`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UploadError};
use crate::events::Executant;
use crate::storage::models::Checksums;

/// Bumped whenever a change to the record cannot be read by older binaries.
pub const FORMAT_VERSION: u32 = 1;

const INFO_EXTENSION: &str = "info";

/// Persisted progress of a session. The finer grained [`super::SessionState`] derives from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Initiated,
    /// Bytes are complete and the node has been created or versioned
    Processing,
    Aborted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMetadata {
    pub format_version: u32,
    pub id: String,
    pub filename: String,
    /// Directory path of the target below the space root, informational
    pub dir: String,
    /// Space id, which is also the node id of the space root
    pub space_root: String,
    pub space_owner: Option<String>,
    pub provider_id: String,
    pub node_id: String,
    pub node_parent_id: String,
    pub node_exists: bool,
    pub executant: Executant,
    pub initiator_id: String,
    /// Modification time requested by the client, `None` means time of upload
    pub mtime: Option<DateTime<Utc>>,
    pub blob_id: String,
    pub blob_size: u64,
    pub size: u64,
    pub size_is_deferred: bool,
    /// Last known offset. The binary file length wins on reload.
    pub offset: u64,
    /// Client declared checksum, `"<algorithm> <hex>"`
    pub checksum: Option<String>,
    /// Checksums computed when the upload finished
    pub checksums: Checksums,
    pub size_diff: i64,
    /// Revision created for an overwrite, used to revert
    pub revision_key: Option<String>,
    pub lock_id: Option<String>,
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_unmodified_since: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub scan_result: Option<String>,
    pub scan_date: Option<DateTime<Utc>>,
    pub phase: SessionPhase,
    pub is_partial: bool,
    pub is_final: bool,
    pub partial_uploads: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl SessionMetadata {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            id: id.into(),
            created_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let metadata: SessionMetadata = rmp_serde::from_slice(data)?;
        if metadata.format_version > FORMAT_VERSION {
            return Err(UploadError::Internal(format!(
                "session {} uses unsupported format version {}",
                metadata.id, metadata.format_version
            )));
        }
        Ok(metadata)
    }
}

pub fn info_path(uploads_dir: &Path, id: &str) -> PathBuf {
    uploads_dir.join(format!("{id}.{INFO_EXTENSION}"))
}

pub fn bin_path(uploads_dir: &Path, id: &str) -> PathBuf {
    uploads_dir.join(id)
}

/// Extracts the session id from a `.info` path.
pub fn session_id_from_info(path: &Path) -> Option<&str> {
    if path.extension()? != INFO_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()
}

/// Writes next to the target and renames over it.
pub async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}
