use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::checksum;
use super::metadata::{bin_path, info_path, session_id_from_info, SessionMetadata};
use super::session::UploadSession;
use crate::config::Config;
use crate::error::{Result, UploadError};
use crate::events::{Executant, Publisher};
use crate::lock::LockTable;
use crate::storage::quota::check_quota;
use crate::tree::Tree;

/// Settings for signing transfer URLs
#[derive(Debug, Clone, Default)]
pub struct TokenOptions {
    pub data_gateway_endpoint: String,
    pub download_endpoint: String,
    pub transfer_shared_secret: String,
    pub transfer_expires: Duration,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Leave finalization to the postprocessing loop
    pub async_uploads: bool,
    pub disable_versioning: bool,
    /// 0 disables the limit
    pub max_upload_size: u64,
    pub upload_expiration: Duration,
    pub provider_id: String,
    pub tokens: TokenOptions,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            async_uploads: false,
            disable_versioning: false,
            max_upload_size: 0,
            upload_expiration: Duration::from_secs(24 * 60 * 60),
            provider_id: String::new(),
            tokens: TokenOptions::default(),
        }
    }
}

impl From<&Config> for StoreOptions {
    fn from(config: &Config) -> Self {
        Self {
            async_uploads: config.uploads.async_uploads,
            disable_versioning: config.uploads.disable_versioning,
            max_upload_size: config.uploads.max_upload_size,
            upload_expiration: Duration::from_secs(config.uploads.upload_expiration_seconds),
            provider_id: config.node.id.clone(),
            tokens: TokenOptions {
                data_gateway_endpoint: config.transfer.data_gateway_endpoint.clone(),
                download_endpoint: config.transfer.download_endpoint.clone(),
                transfer_shared_secret: config.transfer.shared_secret.clone(),
                transfer_expires: Duration::from_secs(config.transfer.expires_seconds),
            },
        }
    }
}

/// Parameters of a new upload
#[derive(Debug, Clone, Default)]
pub struct InitiateRequest {
    pub space_id: String,
    /// Target path below the space root, e.g. `/docs/report.txt`
    pub path: String,
    /// `None` defers the length until [`super::Upload::declare_length`]
    pub size: Option<u64>,
    pub executant: Executant,
    /// `"<algorithm> <hex>"`
    pub checksum: Option<String>,
    pub mtime: Option<DateTime<Utc>>,
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_unmodified_since: Option<String>,
    pub lock_id: Option<String>,
    pub is_partial: bool,
}

/// Criteria for [`SessionStore::list_filtered`]. `None` matches everything.
#[derive(Debug, Clone, Default)]
pub struct UploadSessionFilter {
    pub id: Option<String>,
    pub processing: Option<bool>,
    pub expired: Option<bool>,
    pub has_virus: Option<bool>,
}

impl UploadSessionFilter {
    fn matches(&self, session: &UploadSession, now: DateTime<Utc>) -> bool {
        if self.id.as_deref().is_some_and(|id| id != session.id()) {
            return false;
        }
        if self.processing.is_some_and(|p| p != session.is_processing()) {
            return false;
        }
        if self.expired.is_some_and(|e| e != session.expired(now)) {
            return false;
        }
        if let Some(want) = self.has_virus {
            let infected = session
                .scan_data()
                .is_some_and(|(result, _)| !result.is_empty());
            if want != infected {
                return false;
            }
        }
        true
    }
}

struct StoreInner {
    tree: Tree,
    uploads_dir: PathBuf,
    options: StoreOptions,
    publisher: Option<Arc<dyn Publisher>>,
}

/// Creates, loads and enumerates upload sessions. Sessions live as
/// `<root>/uploads/<id>.info` plus the binary file `<root>/uploads/<id>`.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("uploads_dir", &self.inner.uploads_dir)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn open<P: AsRef<Path>>(
        tree: Tree,
        root: P,
        options: StoreOptions,
        publisher: Option<Arc<dyn Publisher>>,
    ) -> Result<Self> {
        let uploads_dir = root.as_ref().join("uploads");
        std::fs::create_dir_all(&uploads_dir)?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                tree,
                uploads_dir,
                options,
                publisher,
            }),
        })
    }

    pub fn tree(&self) -> &Tree {
        &self.inner.tree
    }

    pub fn locks(&self) -> &LockTable {
        self.inner.tree.locks()
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.inner.uploads_dir
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    pub fn publisher(&self) -> Option<&Arc<dyn Publisher>> {
        self.inner.publisher.as_ref()
    }

    /// A fresh session with a new id. Nothing is written until it is persisted.
    pub fn new_session(&self) -> UploadSession {
        let mut metadata = SessionMetadata::new(uuid::Uuid::new_v4().to_string());
        metadata.blob_id = metadata.id.clone();
        metadata.provider_id = self.inner.options.provider_id.clone();
        UploadSession::from_metadata(self.clone(), metadata)
    }

    /// Loads a session. The offset comes from the binary file length.
    pub async fn get(&self, id: &str) -> Result<UploadSession> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(UploadError::NotFound(format!("upload {id}")));
        }

        let data = {
            let _guard = self.locks().read_session(id).await;
            match tokio::fs::read(info_path(&self.inner.uploads_dir, id)).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(UploadError::NotFound(format!("upload {id}")))
                }
                Err(e) => return Err(e.into()),
            }
        };

        let mut metadata = SessionMetadata::decode(&data)?;
        match tokio::fs::metadata(bin_path(&self.inner.uploads_dir, id)).await {
            Ok(stat) => metadata.offset = stat.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(UploadSession::from_metadata(self.clone(), metadata))
    }

    /// All sessions on disk. Sessions that fail to load are logged and skipped.
    pub async fn list(&self) -> Result<Vec<UploadSession>> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.inner.uploads_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(id) = session_id_from_info(&path) else {
                continue;
            };
            match self.get(id).await {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!(upload_id = id, error = %e, "Skipping unreadable upload session")
                }
            }
        }
        Ok(sessions)
    }

    pub async fn list_filtered(&self, filter: &UploadSessionFilter) -> Result<Vec<UploadSession>> {
        if let Some(id) = &filter.id {
            return match self.get(id).await {
                Ok(session) if filter.matches(&session, Utc::now()) => Ok(vec![session]),
                Ok(_) => Ok(Vec::new()),
                Err(e) if e.is_not_found() => Ok(Vec::new()),
                Err(e) => Err(e),
            };
        }
        let now = Utc::now();
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|s| filter.matches(s, now))
            .collect())
    }

    /// Validates an upload request, resolves its target and persists the new session.
    pub async fn initiate(&self, request: InitiateRequest) -> Result<UploadSession> {
        if let Some(declared) = &request.checksum {
            checksum::parse_declared(declared)?;
        }
        let max = self.inner.options.max_upload_size;
        if let Some(size) = request.size {
            if max > 0 && size > max {
                return Err(UploadError::BadRequest(format!(
                    "upload size {size} exceeds maximum of {max}"
                )));
            }
        }

        let (dir, filename) = split_path(&request.path)?;
        let tree = self.tree();
        let space_root = tree
            .read_node(&request.space_id, &request.space_id)?
            .ok_or_else(|| UploadError::NotFound(format!("space {}", request.space_id)))?;
        let parent = match tree.node_by_path(&request.space_id, dir)? {
            Some(p) if p.is_dir() => p,
            Some(_) => {
                return Err(UploadError::PreconditionFailed(format!(
                    "{dir} is not a folder"
                )))
            }
            None => {
                return Err(UploadError::PreconditionFailed(format!(
                    "parent {dir} does not exist"
                )))
            }
        };

        let mut session = self.new_session();
        let size = request.size.unwrap_or(0);
        let existing = match tree.db().child_id(&request.space_id, &parent.id, filename)? {
            Some(id) => tree.read_node(&request.space_id, &id)?,
            None => None,
        };
        {
            let m = session.metadata_mut();
            match &existing {
                Some(node) if node.is_dir() => {
                    return Err(UploadError::PreconditionFailed(format!(
                        "cannot overwrite folder {}",
                        request.path
                    )))
                }
                Some(node) => {
                    check_quota(&space_root, true, node.blob_size, size)?;
                    m.node_id = node.id.clone();
                    m.node_exists = true;
                }
                None => {
                    check_quota(&space_root, false, 0, size)?;
                    m.node_id = uuid::Uuid::new_v4().to_string();
                    m.node_exists = false;
                }
            }

            m.filename = filename.to_string();
            m.dir = dir.to_string();
            m.space_root = request.space_id.clone();
            m.space_owner = space_root.owner.clone();
            m.node_parent_id = parent.id.clone();
            m.size = size;
            m.blob_size = size;
            m.size_is_deferred = request.size.is_none();
            m.initiator_id = request.executant.id.clone();
            m.executant = request.executant;
            m.checksum = request.checksum;
            m.mtime = request.mtime;
            m.if_match = request.if_match;
            m.if_none_match = request.if_none_match;
            m.if_unmodified_since = request.if_unmodified_since;
            m.lock_id = request.lock_id;
            m.is_partial = request.is_partial;
            m.expires = chrono::Duration::from_std(self.inner.options.upload_expiration)
                .ok()
                .map(|ttl| Utc::now() + ttl);
        }

        session.persist().await?;
        session.touch_bin().await?;
        tracing::info!(
            upload_id = session.id(),
            space_id = session.space_id(),
            node_id = session.node_id(),
            node_exists = session.node_exists(),
            size = size,
            "Initiated upload"
        );
        Ok(session)
    }

    /// Cleans expired sessions that are not waiting on postprocessing. Returns the count.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut purged = 0;
        for mut session in self.list().await? {
            if session.is_processing() || !session.expired(now) {
                continue;
            }
            tracing::info!(upload_id = session.id(), "Purging expired upload");
            self.cleanup(&mut session, true, false, true).await;
            purged += 1;
        }
        Ok(purged)
    }

    /// Repairs nodes whose processing marker names a session that no longer exists.
    /// Such a node is reverted to its newest revision, or deleted when it has none.
    /// Returns the number of affected nodes.
    pub async fn sweep_stale_nodes(&self, space_id: &str, dry_run: bool) -> Result<usize> {
        let tree = self.tree();
        let mut affected = 0;

        for node in tree.db().processing_nodes(space_id)? {
            let Some(upload_id) = node.processing_id().map(str::to_string) else {
                continue;
            };
            if tokio::fs::try_exists(info_path(&self.inner.uploads_dir, &upload_id)).await? {
                continue;
            }
            affected += 1;

            let revisions = tree.db().list_revisions(space_id, &node.id)?;
            if dry_run {
                tracing::info!(
                    space_id = space_id,
                    node_id = node.id.as_str(),
                    upload_id = upload_id.as_str(),
                    revisions = revisions.len(),
                    "Found stale processing node"
                );
                continue;
            }

            match revisions.last() {
                Some((key, revision)) => {
                    {
                        let _guard = self.locks().lock_node(space_id, &node.id).await;
                        tree.db().update_node(space_id, &node.id, |n| {
                            n.apply_revision(revision);
                            n.unmark_processing(&upload_id);
                        })?;
                        tree.db().delete_revision(space_id, key)?;
                    }
                    let diff = size_diff(revision.blob_size, node.blob_size);
                    tree.propagate(&node, diff).await?;
                    tracing::info!(
                        space_id = space_id,
                        node_id = node.id.as_str(),
                        revision = key.as_str(),
                        "Reverted stale node"
                    );
                }
                None => {
                    tree.delete_node(space_id, &node.id).await?;
                    tracing::info!(
                        space_id = space_id,
                        node_id = node.id.as_str(),
                        "Deleted stale node"
                    );
                }
            }
        }
        Ok(affected)
    }
}

fn size_diff(new: u64, old: u64) -> i64 {
    let new = i64::try_from(new).unwrap_or(i64::MAX);
    let old = i64::try_from(old).unwrap_or(i64::MAX);
    new.saturating_sub(old)
}

/// Splits `/a/b/name` into (`/a/b`, `name`).
fn split_path(path: &str) -> Result<(&str, &str)> {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", path),
    };
    if name.is_empty() || name == "." || name == ".." {
        return Err(UploadError::BadRequest(format!("invalid upload path {path:?}")));
    }
    Ok((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/docs/report.txt").unwrap(), ("/docs", "report.txt"));
        assert_eq!(split_path("report.txt").unwrap(), ("", "report.txt"));
        assert_eq!(split_path("/report.txt").unwrap(), ("", "report.txt"));
        assert!(split_path("/docs/").is_err());
        assert!(split_path("").is_err());
    }

    #[test]
    fn test_size_diff() {
        assert_eq!(size_diff(50, 100), -50);
        assert_eq!(size_diff(100, 0), 100);
    }
}
