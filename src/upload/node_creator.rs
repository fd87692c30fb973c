use chrono::{DateTime, Utc};

use super::metadata::SessionPhase;
use super::session::UploadSession;
use super::store::SessionStore;
use crate::blobstore::BlobRef;
use crate::error::{Result, UploadError};
use crate::storage::models::{calculate_etag, NodeRecord, NodeType};
use crate::storage::quota::check_quota;

/// Evaluates If-Match, If-None-Match and If-Unmodified-Since against the current node.
pub fn check_conditions(
    node_id: &str,
    mtime: DateTime<Utc>,
    if_match: Option<&str>,
    if_none_match: Option<&str>,
    if_unmodified_since: Option<&str>,
) -> Result<()> {
    let etag = calculate_etag(node_id, mtime);

    if let Some(expected) = if_match.filter(|s| !s.is_empty()) {
        if expected != etag {
            return Err(UploadError::Aborted("etag mismatch".to_string()));
        }
    }

    if let Some(tags) = if_none_match.filter(|s| !s.is_empty()) {
        if tags.trim() == "*" {
            return Err(UploadError::Aborted(
                "etag mismatch, resource exists".to_string(),
            ));
        }
        if tags.split(',').any(|t| t.trim() == etag) {
            return Err(UploadError::Aborted("etag mismatch".to_string()));
        }
    }

    if let Some(raw) = if_unmodified_since.filter(|s| !s.is_empty()) {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(since) if mtime > since.with_timezone(&Utc) => {
                return Err(UploadError::Aborted(
                    "if-unmodified-since mismatch".to_string(),
                ));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(value = raw, error = %e, "Ignoring unparseable If-Unmodified-Since")
            }
        }
    }
    Ok(())
}

fn as_diff(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

impl SessionStore {
    /// Creates the target node of a finished upload, or a new revision of an existing one.
    ///
    /// Either way the node ends up carrying the upload's blob id, size, checksums and mtime,
    /// and a processing marker naming the session. The session is persisted with the
    /// resulting size diff and revision key.
    pub async fn create_node_for_upload(&self, session: &mut UploadSession) -> Result<NodeRecord> {
        let space_id = session.space_id().to_string();
        if self.tree().read_node(&space_id, &space_id)?.is_none() {
            return Err(UploadError::NotFound(format!("space {space_id}")));
        }

        // Held from the quota check until the ancestors carry the new size, so concurrent
        // uploads cannot both claim the same free space
        let quota_guard = self.locks().lock_quota(&space_id).await;
        let node = if session.node_exists() {
            self.update_existing_node(session).await?
        } else {
            self.init_new_node(session).await?
        };
        if let Err(e) = self.tree().propagate(&node, session.size_diff()).await {
            tracing::error!(upload_id = session.id(), error = %e, "Could not account upload size");
            drop(quota_guard);
            self.cleanup(session, true, true, true).await;
            return Err(e);
        }
        drop(quota_guard);

        session.metadata_mut().phase = SessionPhase::Processing;
        if let Err(e) = session.persist().await {
            self.abandon_node(session).await;
            return Err(e);
        }

        tracing::debug!(
            upload_id = session.id(),
            space_id = space_id.as_str(),
            node_id = node.id.as_str(),
            size_diff = session.size_diff(),
            "Node ready for postprocessing"
        );
        Ok(node)
    }

    async fn init_new_node(&self, session: &mut UploadSession) -> Result<NodeRecord> {
        let db = self.tree().db();
        let space_id = session.space_id().to_string();
        let parent_id = session.metadata().node_parent_id.clone();
        let name = session.filename().to_string();
        if session.node_id().is_empty() {
            session.metadata_mut().node_id = uuid::Uuid::new_v4().to_string();
        }
        let node_id = session.node_id().to_string();

        match db.get_node(&space_id, &parent_id)? {
            Some(parent) if parent.is_dir() => {}
            _ => {
                return Err(UploadError::PreconditionFailed(format!(
                    "parent {parent_id} does not exist"
                )))
            }
        }
        if db.child_id(&space_id, &parent_id, &name)?.is_some() {
            return Err(UploadError::AlreadyExists(name));
        }

        let _parent_guard = self.locks().lock_node(&space_id, &parent_id).await;
        let _node_guard = self.locks().lock_node(&space_id, &node_id).await;

        let space_root = db
            .get_node(&space_id, &space_id)?
            .ok_or_else(|| UploadError::NotFound(format!("space {space_id}")))?;
        check_quota(&space_root, false, 0, session.size())?;

        if !db.link_child(&space_id, &parent_id, &name, &node_id)? {
            return Err(UploadError::AlreadyExists(name));
        }

        let mut node = NodeRecord::new_file(&space_id, &node_id, &parent_id, &name);
        apply_upload(&mut node, session);
        if let Err(e) = db.put_node(&node) {
            if let Err(unlink) = db.unlink_child(&space_id, &parent_id, &name) {
                tracing::error!(
                    space_id = space_id.as_str(),
                    parent_id = parent_id.as_str(),
                    name = name.as_str(),
                    error = %unlink,
                    "Could not remove child link of unwritten node"
                );
            }
            return Err(e.into());
        }

        let m = session.metadata_mut();
        m.size_diff = as_diff(m.size);
        m.revision_key = None;
        Ok(node)
    }

    async fn update_existing_node(&self, session: &mut UploadSession) -> Result<NodeRecord> {
        let db = self.tree().db();
        let space_id = session.space_id().to_string();
        let node_id = session.node_id().to_string();
        if node_id.is_empty() {
            return Err(UploadError::Internal(format!(
                "upload {} targets an existing node without id",
                session.id()
            )));
        }

        // Lock before reading so nobody observes a half-written overwrite
        let _guard = self.locks().lock_node(&space_id, &node_id).await;

        let old = db
            .get_node(&space_id, &node_id)?
            .ok_or_else(|| UploadError::NotFound(format!("node {node_id}")))?;
        if old.is_dir() {
            return Err(UploadError::PreconditionFailed(format!(
                "cannot overwrite folder {}",
                old.name
            )));
        }
        let space_root = db
            .get_node(&space_id, &space_id)?
            .ok_or_else(|| UploadError::NotFound(format!("space {space_id}")))?;
        check_quota(&space_root, true, old.blob_size, session.size())?;

        let m = session.metadata();
        check_conditions(
            &old.id,
            old.mtime,
            m.if_match.as_deref(),
            m.if_none_match.as_deref(),
            m.if_unmodified_since.as_deref(),
        )?;

        let revision_key = if self.options().disable_versioning {
            None
        } else {
            let key = old.revision_key(old.mtime);
            let revision = old.to_revision();
            if !db.create_revision(&space_id, &key, &revision)? {
                // A revision with this mtime exists already. It must describe the same content.
                let existing = db.get_revision(&space_id, &key)?.ok_or_else(|| {
                    UploadError::Internal(format!("revision {key} vanished"))
                })?;
                if existing.checksums.is_empty()
                    || old.checksums.is_empty()
                    || existing.checksums != old.checksums
                {
                    return Err(UploadError::Internal(format!(
                        "revision {key} exists with different content"
                    )));
                }
                if !existing.blob_id.is_empty() && existing.blob_id != old.blob_id {
                    self.tree()
                        .delete_blob_ref(&BlobRef::new(&space_id, &existing.blob_id))
                        .await?;
                }
                db.put_revision(&space_id, &key, &revision)?;
            }
            Some(key)
        };

        let updated = db
            .update_node(&space_id, &node_id, |n| apply_upload(n, session))?
            .ok_or_else(|| UploadError::NotFound(format!("node {node_id}")))?;

        let m = session.metadata_mut();
        m.size_diff = as_diff(m.size).saturating_sub(as_diff(old.blob_size));
        m.revision_key = revision_key;
        Ok(updated)
    }

    /// Gives back the size a session's node creation added to the ancestors, as long as
    /// the node still carries this session's processing marker.
    pub async fn release_size_diff(&self, session: &UploadSession) -> Result<()> {
        let space_id = session.space_id();
        let node_id = session.node_id();
        if node_id.is_empty() {
            return Ok(());
        }
        let _quota_guard = self.locks().lock_quota(space_id).await;
        let Some(node) = self.tree().read_node(space_id, node_id)? else {
            return Ok(());
        };
        if node.processing_id() != Some(session.id()) {
            return Ok(());
        }
        self.tree().propagate(&node, -session.size_diff()).await
    }

    /// Undoes a node creation whose upload cannot be handed on. The upload itself is kept
    /// in the aborted phase.
    pub(crate) async fn abandon_node(&self, session: &mut UploadSession) {
        if let Err(e) = self.release_size_diff(session).await {
            tracing::error!(upload_id = session.id(), error = %e, "Could not revert tree size change");
        }
        self.cleanup(session, true, true, true).await;
    }

    /// Points the node's live attributes at the upload's content. Returns the size change.
    pub async fn set_node_to_upload(&self, session: &UploadSession) -> Result<i64> {
        let space_id = session.space_id();
        let node_id = session.node_id();
        let _guard = self.locks().lock_node(space_id, node_id).await;

        let mut old_size = 0;
        self.tree()
            .db()
            .update_node(space_id, node_id, |n| {
                old_size = n.blob_size;
                n.node_type = NodeType::File;
                n.blob_id = session.metadata().blob_id.clone();
                n.blob_size = session.size();
                n.checksums = session.metadata().checksums.clone();
                if let Some(mtime) = session.mtime() {
                    n.mtime = mtime;
                }
            })?
            .ok_or_else(|| UploadError::NotFound(format!("node {node_id}")))?;

        Ok(as_diff(session.size()).saturating_sub(as_diff(old_size)))
    }
}

/// Writes the technical attributes of an upload onto a node and marks it as processing.
fn apply_upload(node: &mut NodeRecord, session: &UploadSession) {
    let m = session.metadata();
    node.node_type = NodeType::File;
    node.parent_id = m.node_parent_id.clone();
    node.name = m.filename.clone();
    node.blob_id = m.blob_id.clone();
    node.blob_size = m.size;
    node.checksums = m.checksums.clone();
    node.mtime = m.mtime.unwrap_or_else(Utc::now);
    node.scan = None;
    node.mark_processing(&m.id);
}
