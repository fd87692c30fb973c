//! The tree facade: node metadata in redb, content in a [`Blobstore`], and ancestor
//! aggregates kept current by a [`Propagator`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use crate::blobstore::{BlobRef, Blobstore};
use crate::error::{Result, UploadError};
use crate::lock::LockTable;
use crate::storage::models::NodeRecord;
use crate::storage::Database;

/// Updates ancestor size and tree mtime after a node changed.
#[async_trait]
pub trait Propagator: Send + Sync {
    /// Applies `size_diff` to every ancestor of `node`, starting at its parent.
    async fn propagate(&self, node: &NodeRecord, size_diff: i64) -> Result<()>;
}

/// Walks the parent chain synchronously, locking one ancestor at a time.
#[derive(Debug, Clone)]
pub struct SyncPropagator {
    db: Database,
    locks: LockTable,
}

impl SyncPropagator {
    pub fn new(db: Database, locks: LockTable) -> Self {
        Self { db, locks }
    }
}

fn apply_diff(size: u64, diff: i64) -> u64 {
    if diff >= 0 {
        size.saturating_add(diff.unsigned_abs())
    } else {
        size.saturating_sub(diff.unsigned_abs())
    }
}

#[async_trait]
impl Propagator for SyncPropagator {
    async fn propagate(&self, node: &NodeRecord, size_diff: i64) -> Result<()> {
        let space_id = node.space_id.as_str();
        let now = Utc::now();
        let mut current = node.parent_id.clone();

        while !current.is_empty() {
            let _guard = self.locks.lock_node(space_id, &current).await;
            let updated = self.db.update_node(space_id, &current, |n| {
                n.tree_size = apply_diff(n.tree_size, size_diff);
                n.tmtime = Some(now);
            })?;
            match updated {
                Some(parent) => current = parent.parent_id,
                None => {
                    tracing::warn!(
                        space_id = space_id,
                        node_id = current.as_str(),
                        "Ancestor vanished during propagation"
                    );
                    break;
                }
            }
        }

        tracing::debug!(
            space_id = space_id,
            node_id = node.id.as_str(),
            size_diff = size_diff,
            "Propagated change"
        );
        Ok(())
    }
}

/// Storage capability contract consumed by the upload engine.
#[derive(Clone)]
pub struct Tree {
    db: Database,
    blobstore: Arc<dyn Blobstore>,
    propagator: Arc<dyn Propagator>,
    locks: LockTable,
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree").field("db", &self.db).finish_non_exhaustive()
    }
}

impl Tree {
    pub fn new(
        db: Database,
        blobstore: Arc<dyn Blobstore>,
        propagator: Arc<dyn Propagator>,
        locks: LockTable,
    ) -> Self {
        Self {
            db,
            blobstore,
            propagator,
            locks,
        }
    }

    /// Tree using the [`SyncPropagator`] over the same database and lock table
    pub fn with_sync_propagation(db: Database, blobstore: Arc<dyn Blobstore>) -> Self {
        let locks = LockTable::new();
        let propagator = Arc::new(SyncPropagator::new(db.clone(), locks.clone()));
        Self::new(db, blobstore, propagator, locks)
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    pub fn read_node(&self, space_id: &str, node_id: &str) -> Result<Option<NodeRecord>> {
        Ok(self.db.get_node(space_id, node_id)?)
    }

    pub fn write_node(&self, node: &NodeRecord) -> Result<()> {
        Ok(self.db.put_node(node)?)
    }

    /// Resolves a slash separated path below the space root.
    pub fn node_by_path(&self, space_id: &str, path: &str) -> Result<Option<NodeRecord>> {
        let mut current = match self.db.get_node(space_id, space_id)? {
            Some(root) => root,
            None => return Ok(None),
        };
        for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            let Some(child_id) = self.db.child_id(space_id, &current.id, segment)? else {
                return Ok(None);
            };
            current = match self.db.get_node(space_id, &child_id)? {
                Some(n) => n,
                None => return Ok(None),
            };
        }
        Ok(Some(current))
    }

    /// Creates the root folder of a space. The root's node id equals the space id.
    pub fn create_space(
        &self,
        space_id: &str,
        owner: Option<&str>,
        quota: Option<u64>,
    ) -> Result<NodeRecord> {
        if space_id.is_empty() {
            return Err(UploadError::BadRequest("space id must not be empty".to_string()));
        }
        if self.db.get_node(space_id, space_id)?.is_some() {
            return Err(UploadError::AlreadyExists(format!("space {space_id}")));
        }
        let mut root = NodeRecord::new_folder(space_id, space_id, "", "");
        root.owner = owner.map(str::to_string);
        root.quota = quota;
        self.db.put_node(&root)?;
        tracing::info!(space_id = space_id, "Created space");
        Ok(root)
    }

    pub async fn create_dir(&self, space_id: &str, parent_id: &str, name: &str) -> Result<NodeRecord> {
        validate_name(name)?;
        let node = {
            let _guard = self.locks.lock_node(space_id, parent_id).await;

            match self.db.get_node(space_id, parent_id)? {
                Some(parent) if parent.is_dir() => {}
                Some(_) => {
                    return Err(UploadError::PreconditionFailed(format!(
                        "parent {parent_id} is not a folder"
                    )))
                }
                None => {
                    return Err(UploadError::PreconditionFailed(format!(
                        "parent {parent_id} does not exist"
                    )))
                }
            }

            let node =
                NodeRecord::new_folder(space_id, &uuid::Uuid::new_v4().to_string(), parent_id, name);
            if !self.db.link_child(space_id, parent_id, name, &node.id)? {
                return Err(UploadError::AlreadyExists(name.to_string()));
            }
            self.db.put_node(&node)?;
            node
        };
        // Parent lock is released, propagation locks each ancestor itself
        self.propagator.propagate(&node, 0).await?;
        Ok(node)
    }

    /// Moves a node under a new parent and name, moving its size between the ancestor chains.
    pub async fn move_node(
        &self,
        space_id: &str,
        node_id: &str,
        new_parent_id: &str,
        new_name: &str,
    ) -> Result<NodeRecord> {
        validate_name(new_name)?;
        let old = self
            .db
            .get_node(space_id, node_id)?
            .ok_or_else(|| UploadError::NotFound(format!("node {node_id}")))?;
        if old.is_space_root() {
            return Err(UploadError::BadRequest("cannot move a space root".to_string()));
        }
        if !self
            .db
            .get_node(space_id, new_parent_id)?
            .is_some_and(|p| p.is_dir())
        {
            return Err(UploadError::PreconditionFailed(format!(
                "target parent {new_parent_id} is not a folder"
            )));
        }
        if self.is_descendant(space_id, new_parent_id, node_id)? {
            return Err(UploadError::BadRequest(
                "cannot move a node below itself".to_string(),
            ));
        }

        let moved = {
            let _guard = self.locks.lock_node(space_id, node_id).await;
            self.db.move_node(space_id, node_id, new_parent_id, new_name)?
        };
        match moved {
            Some(true) => {}
            Some(false) => return Err(UploadError::AlreadyExists(new_name.to_string())),
            None => return Err(UploadError::NotFound(format!("node {node_id}"))),
        }

        let size = size_as_diff(old.size());
        self.propagator.propagate(&old, -size).await?;
        let new = self
            .db
            .get_node(space_id, node_id)?
            .ok_or_else(|| UploadError::NotFound(format!("node {node_id}")))?;
        self.propagator.propagate(&new, size).await?;
        Ok(new)
    }

    /// Whether `candidate` is `ancestor` or lies below it.
    fn is_descendant(&self, space_id: &str, candidate: &str, ancestor: &str) -> Result<bool> {
        let mut current = candidate.to_string();
        while !current.is_empty() {
            if current == ancestor {
                return Ok(true);
            }
            current = match self.db.get_node(space_id, &current)? {
                Some(n) => n.parent_id,
                None => break,
            };
        }
        Ok(false)
    }

    /// Deletes a node and everything below it, including revisions and blobs.
    pub async fn delete_node(&self, space_id: &str, node_id: &str) -> Result<NodeRecord> {
        let node = self
            .db
            .get_node(space_id, node_id)?
            .ok_or_else(|| UploadError::NotFound(format!("node {node_id}")))?;
        if node.is_space_root() {
            return Err(UploadError::BadRequest("cannot delete a space root".to_string()));
        }

        // Depth first, children before parents
        let mut stack = vec![node.id.clone()];
        let mut order = Vec::new();
        while let Some(id) = stack.pop() {
            for (_, child) in self.db.list_children(space_id, &id)? {
                stack.push(child);
            }
            order.push(id);
        }

        self.propagator
            .propagate(&node, -size_as_diff(node.size()))
            .await?;

        for id in order.into_iter().rev() {
            let _guard = self.locks.lock_node(space_id, &id).await;
            let revisions = self.db.list_revisions(space_id, &id)?;
            if let Some(removed) = self.db.delete_node(space_id, &id)? {
                if !removed.blob_id.is_empty() {
                    self.delete_blob(&removed).await?;
                }
            }
            for (_, revision) in revisions {
                if !revision.blob_id.is_empty() {
                    self.blobstore
                        .delete(&BlobRef::new(space_id, revision.blob_id))
                        .await?;
                }
            }
        }

        tracing::info!(space_id = space_id, node_id = node_id, "Deleted node");
        Ok(node)
    }

    // ========================================================================
    // Content
    // ========================================================================

    pub async fn write_blob(&self, node: &NodeRecord, source: &Path) -> Result<()> {
        if node.blob_id.is_empty() {
            return Err(UploadError::Internal(format!(
                "node {} has no blob id",
                node.id
            )));
        }
        self.blobstore
            .upload(&BlobRef::new(&node.space_id, &node.blob_id), source)
            .await?;
        Ok(())
    }

    /// Reads a node's content. A node without a blob id reads as empty.
    pub async fn read_blob(&self, node: &NodeRecord) -> Result<Bytes> {
        if node.blob_id.is_empty() {
            return Ok(Bytes::new());
        }
        Ok(self
            .blobstore
            .download(&BlobRef::new(&node.space_id, &node.blob_id))
            .await?)
    }

    pub async fn delete_blob(&self, node: &NodeRecord) -> Result<()> {
        if node.blob_id.is_empty() {
            return Ok(());
        }
        self.blobstore
            .delete(&BlobRef::new(&node.space_id, &node.blob_id))
            .await?;
        Ok(())
    }

    pub async fn delete_blob_ref(&self, blob: &BlobRef) -> Result<()> {
        self.blobstore.delete(blob).await?;
        Ok(())
    }

    pub async fn propagate(&self, node: &NodeRecord, size_diff: i64) -> Result<()> {
        self.propagator.propagate(node, size_diff).await
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(UploadError::BadRequest(format!("invalid name {name:?}")));
    }
    Ok(())
}

fn size_as_diff(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}
