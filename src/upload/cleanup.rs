use super::session::UploadSession;
use super::store::SessionStore;
use crate::blobstore::BlobRef;
use crate::error::Result;

async fn remove_if_exists(path: &std::path::Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl SessionStore {
    /// Removes what a session left behind. Failures are logged, never returned, and calling
    /// it again for the same session is harmless.
    ///
    /// * `revert` restores the node from the session's revision, or deletes a node this
    ///   session created if its processing marker still names the session.
    /// * `keep_upload` keeps the binary and `.info` files for a later retry.
    /// * `unmark` clears the node's processing marker if it names this session.
    pub async fn cleanup(
        &self,
        session: &mut UploadSession,
        revert: bool,
        keep_upload: bool,
        unmark: bool,
    ) {
        if revert {
            if let Err(e) = self.revert_node(session).await {
                tracing::error!(upload_id = session.id(), error = %e, "Reverting node metadata failed");
            }
        }

        if keep_upload {
            if revert {
                session.set_state_aborted();
                if let Err(e) = session.persist().await {
                    tracing::error!(upload_id = session.id(), error = %e, "Persisting aborted upload failed");
                }
            }
        } else {
            if let Err(e) = remove_if_exists(&session.bin_path()).await {
                tracing::error!(upload_id = session.id(), error = %e, "Removing upload failed");
            }
            let _guard = self.locks().lock_session(session.id()).await;
            if let Err(e) = remove_if_exists(&session.info_path()).await {
                tracing::error!(upload_id = session.id(), error = %e, "Removing upload info failed");
            }
        }

        if unmark {
            if let Err(e) = self.unmark_processing(session).await {
                tracing::info!(upload_id = session.id(), error = %e, "Unmarking processing failed");
            }
        }
    }

    async fn revert_node(&self, session: &UploadSession) -> Result<()> {
        let space_id = session.space_id();
        let node_id = session.node_id();
        if node_id.is_empty() {
            return Ok(());
        }
        let db = self.tree().db();

        let removed = {
            let _guard = self.locks().lock_node(space_id, node_id).await;
            let Some(node) = db.get_node(space_id, node_id)? else {
                tracing::debug!(upload_id = session.id(), node_id = node_id, "Node already gone");
                return Ok(());
            };

            match (session.node_exists(), &session.metadata().revision_key) {
                (true, Some(key)) => {
                    if let Some(revision) = db.get_revision(space_id, key)? {
                        db.update_node(space_id, node_id, |n| n.apply_revision(&revision))?;
                        db.delete_revision(space_id, key)?;
                        tracing::info!(
                            upload_id = session.id(),
                            node_id = node_id,
                            revision = key.as_str(),
                            "Restored node from revision"
                        );
                    }
                    None
                }
                (true, None) => {
                    tracing::warn!(
                        upload_id = session.id(),
                        node_id = node_id,
                        "No revision to restore, keeping node"
                    );
                    None
                }
                // Only the latest session to touch a new node may remove it
                (false, _) if node.processing_id() == Some(session.id()) => {
                    db.delete_node(space_id, node_id)?
                }
                (false, _) => None,
            }
        };
        if let Some(node) = &removed {
            tracing::info!(upload_id = session.id(), node_id = node.id.as_str(), "Removed node");
        }

        // Content that was already moved into the blob store for this session
        let blob_id = &session.metadata().blob_id;
        if !blob_id.is_empty() {
            let still_used = db
                .get_node(space_id, node_id)?
                .is_some_and(|n| &n.blob_id == blob_id);
            if !still_used {
                self.tree()
                    .delete_blob_ref(&BlobRef::new(space_id, blob_id.as_str()))
                    .await?;
            }
        }
        Ok(())
    }

    async fn unmark_processing(&self, session: &UploadSession) -> Result<()> {
        let space_id = session.space_id();
        let node_id = session.node_id();
        if node_id.is_empty() {
            return Ok(());
        }
        let _guard = self.locks().lock_node(space_id, node_id).await;
        self.tree().db().update_node(space_id, node_id, |n| {
            n.unmark_processing(session.id());
        })?;
        Ok(())
    }
}
