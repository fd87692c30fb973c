use chrono::{DateTime, SecondsFormat, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// Separates a node id from the mtime in a revision key.
pub const REVISION_ID_DELIMITER: &str = ".REV.";

/// Prefix of the status attribute while an upload session owns the node content.
pub const PROCESSING_STATUS: &str = "processing:";

/// Type of a tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Folder,
}

/// The checksum set recorded for file content. Empty vectors mean "not computed".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksums {
    #[serde(default)]
    pub sha1: Vec<u8>,
    #[serde(default)]
    pub md5: Vec<u8>,
    #[serde(default)]
    pub adler32: Vec<u8>,
}

impl Checksums {
    pub fn is_empty(&self) -> bool {
        self.sha1.is_empty() && self.md5.is_empty() && self.adler32.is_empty()
    }
}

/// Result of an antivirus scan attached to a node or session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanData {
    pub result: String,
    pub date: DateTime<Utc>,
}

/// A file or folder stored in redb
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub space_id: String,
    pub id: String,
    /// Empty for the space root
    pub parent_id: String,
    pub name: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub blob_id: String,
    #[serde(default)]
    pub blob_size: u64,
    pub mtime: DateTime<Utc>,
    /// Tree modification time, bumped by propagation
    #[serde(default)]
    pub tmtime: Option<DateTime<Utc>>,
    /// Aggregate size of all descendants (folders only)
    #[serde(default)]
    pub tree_size: u64,
    #[serde(default)]
    pub checksums: Checksums,
    /// `processing:<upload id>` while postprocessing is pending
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub scan: Option<ScanData>,
    /// Quota in bytes, only meaningful on space roots. `None` or 0 means unlimited.
    #[serde(default)]
    pub quota: Option<u64>,
    #[serde(default)]
    pub owner: Option<String>,
}

impl NodeRecord {
    pub fn new_folder(space_id: &str, id: &str, parent_id: &str, name: &str) -> Self {
        Self {
            space_id: space_id.to_string(),
            id: id.to_string(),
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            node_type: NodeType::Folder,
            blob_id: String::new(),
            blob_size: 0,
            mtime: Utc::now(),
            tmtime: None,
            tree_size: 0,
            checksums: Checksums::default(),
            status: None,
            scan: None,
            quota: None,
            owner: None,
        }
    }

    pub fn new_file(space_id: &str, id: &str, parent_id: &str, name: &str) -> Self {
        Self {
            node_type: NodeType::File,
            ..Self::new_folder(space_id, id, parent_id, name)
        }
    }

    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Folder
    }

    pub fn is_space_root(&self) -> bool {
        self.id == self.space_id
    }

    /// Size as seen by the tree: blob size for files, aggregate size for folders.
    pub fn size(&self) -> u64 {
        match self.node_type {
            NodeType::File => self.blob_size,
            NodeType::Folder => self.tree_size,
        }
    }

    /// The etag is derived from the node id and the tree mtime (falling back to mtime).
    pub fn etag(&self) -> String {
        calculate_etag(&self.id, self.tmtime.unwrap_or(self.mtime))
    }

    pub fn is_processing(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| s.starts_with(PROCESSING_STATUS))
    }

    /// Id of the upload session that last marked this node, if any.
    pub fn processing_id(&self) -> Option<&str> {
        self.status
            .as_deref()
            .and_then(|s| s.strip_prefix(PROCESSING_STATUS))
    }

    pub fn mark_processing(&mut self, upload_id: &str) {
        self.status = Some(format!("{PROCESSING_STATUS}{upload_id}"));
    }

    /// Clears the processing marker if it still names `upload_id`. Returns whether it was cleared.
    pub fn unmark_processing(&mut self, upload_id: &str) -> bool {
        if self.processing_id() == Some(upload_id) {
            self.status = None;
            return true;
        }
        false
    }

    pub fn revision_key(&self, mtime: DateTime<Utc>) -> String {
        revision_key(&self.id, mtime)
    }

    /// Snapshot of the attributes that a revision preserves.
    pub fn to_revision(&self) -> RevisionRecord {
        RevisionRecord {
            node_type: self.node_type,
            blob_id: self.blob_id.clone(),
            blob_size: self.blob_size,
            mtime: self.mtime,
            checksums: self.checksums.clone(),
        }
    }

    /// Copies a revision's preserved attributes back onto the node.
    pub fn apply_revision(&mut self, revision: &RevisionRecord) {
        self.node_type = revision.node_type;
        self.blob_id = revision.blob_id.clone();
        self.blob_size = revision.blob_size;
        self.mtime = revision.mtime;
        self.checksums = revision.checksums.clone();
    }
}

/// Immutable snapshot of a node's content attributes. Processing markers are never copied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub node_type: NodeType,
    pub blob_id: String,
    pub blob_size: u64,
    pub mtime: DateTime<Utc>,
    #[serde(default)]
    pub checksums: Checksums,
}

pub fn format_mtime(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn revision_key(node_id: &str, mtime: DateTime<Utc>) -> String {
    format!("{node_id}{REVISION_ID_DELIMITER}{}", format_mtime(mtime))
}

/// Splits a revision key into node id and revision timestamp.
pub fn split_revision_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(REVISION_ID_DELIMITER)
}

pub fn calculate_etag(node_id: &str, mtime: DateTime<Utc>) -> String {
    let mut hasher = Md5::new();
    hasher.update(node_id.as_bytes());
    hasher.update(format_mtime(mtime).as_bytes());
    format!("\"{}\"", hex::encode(hasher.finalize()))
}
