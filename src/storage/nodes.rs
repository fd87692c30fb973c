use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::{NodeRecord, RevisionRecord, REVISION_ID_DELIMITER};
use super::tables::*;

fn node_key(space_id: &str, node_id: &str) -> String {
    format!("{space_id}/{node_id}")
}

fn child_key(space_id: &str, parent_id: &str, name: &str) -> String {
    format!("{space_id}/{parent_id}/{name}")
}

fn revision_table_key(space_id: &str, revision_key: &str) -> String {
    format!("{space_id}/{revision_key}")
}

impl Database {
    // ========================================================================
    // Node operations
    // ========================================================================

    /// Store a node record (insert or replace)
    pub fn put_node(&self, node: &NodeRecord) -> Result<(), DatabaseError> {
        debug_assert!(!node.id.is_empty(), "node id must not be empty");
        debug_assert!(!node.space_id.is_empty(), "space id must not be empty");

        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(NODES)?;
            let data = rmp_serde::to_vec_named(node)?;
            table.insert(node_key(&node.space_id, &node.id).as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get a node by space and node id
    pub fn get_node(
        &self,
        space_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(NODES)?;

        match table.get(node_key(space_id, node_id).as_str())? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write a node inside a single transaction.
    /// Returns the updated record, or `None` if the node does not exist.
    pub fn update_node<F>(
        &self,
        space_id: &str,
        node_id: &str,
        f: F,
    ) -> Result<Option<NodeRecord>, DatabaseError>
    where
        F: FnOnce(&mut NodeRecord),
    {
        let key = node_key(space_id, node_id);
        let write_txn = self.begin_write()?;

        let existing: Option<NodeRecord> = {
            let table = write_txn.open_table(NODES)?;
            let result = match table.get(key.as_str())? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            result
        };

        let updated = match existing {
            Some(mut node) => {
                f(&mut node);
                let data = rmp_serde::to_vec_named(&node)?;
                let mut table = write_txn.open_table(NODES)?;
                table.insert(key.as_str(), data.as_slice())?;
                Some(node)
            }
            None => None,
        };

        write_txn.commit()?;
        Ok(updated)
    }

    /// Delete a node, its child entry in the parent and all of its revisions.
    /// Returns the removed record.
    pub fn delete_node(
        &self,
        space_id: &str,
        node_id: &str,
    ) -> Result<Option<NodeRecord>, DatabaseError> {
        let key = node_key(space_id, node_id);
        let write_txn = self.begin_write()?;

        let existing: Option<NodeRecord> = {
            let table = write_txn.open_table(NODES)?;
            let result = match table.get(key.as_str())? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            result
        };

        if let Some(ref node) = existing {
            {
                let mut table = write_txn.open_table(NODES)?;
                table.remove(key.as_str())?;
            }
            // Only drop the child entry if it still points at this node
            {
                let ck = child_key(space_id, &node.parent_id, &node.name);
                let mut children = write_txn.open_table(CHILDREN)?;
                let points_here = children
                    .get(ck.as_str())?
                    .is_some_and(|v| v.value() == node_id);
                if points_here {
                    children.remove(ck.as_str())?;
                }
            }
            {
                let prefix = revision_table_key(space_id, &format!("{node_id}{REVISION_ID_DELIMITER}"));
                let keys: Vec<String> = {
                    let revisions = write_txn.open_table(REVISIONS)?;
                    let mut keys = Vec::new();
                    for entry in revisions.range(prefix.as_str()..)? {
                        let (k, _) = entry?;
                        if !k.value().starts_with(&prefix) {
                            break;
                        }
                        keys.push(k.value().to_string());
                    }
                    keys
                };
                let mut revisions = write_txn.open_table(REVISIONS)?;
                for k in keys {
                    revisions.remove(k.as_str())?;
                }
            }
        }

        write_txn.commit()?;
        Ok(existing)
    }

    /// Nodes in a space whose status marks them as being processed
    pub fn processing_nodes(&self, space_id: &str) -> Result<Vec<NodeRecord>, DatabaseError> {
        let prefix = format!("{space_id}/");
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(NODES)?;

        let mut nodes = Vec::new();
        for entry in table.range(prefix.as_str()..)? {
            let (k, v) = entry?;
            if !k.value().starts_with(&prefix) {
                break;
            }
            let node: NodeRecord = rmp_serde::from_slice(v.value())?;
            if node.is_processing() {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// All space roots
    pub fn list_spaces(&self) -> Result<Vec<NodeRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(NODES)?;

        let mut spaces = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            let node: NodeRecord = rmp_serde::from_slice(v.value())?;
            if node.is_space_root() {
                spaces.push(node);
            }
        }
        Ok(spaces)
    }

    // ========================================================================
    // Child index
    // ========================================================================

    /// Resolve a child name to a node id
    pub fn child_id(
        &self,
        space_id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(CHILDREN)?;
        Ok(table
            .get(child_key(space_id, parent_id, name).as_str())?
            .map(|v| v.value().to_string()))
    }

    /// Link a child name to a node id. Returns `false` without writing if the name is taken.
    pub fn link_child(
        &self,
        space_id: &str,
        parent_id: &str,
        name: &str,
        node_id: &str,
    ) -> Result<bool, DatabaseError> {
        let key = child_key(space_id, parent_id, name);
        let write_txn = self.begin_write()?;
        let linked = {
            let mut table = write_txn.open_table(CHILDREN)?;
            let taken = table.get(key.as_str())?.is_some();
            if !taken {
                table.insert(key.as_str(), node_id)?;
            }
            !taken
        };
        write_txn.commit()?;
        Ok(linked)
    }

    /// Remove a child entry. Returns whether it existed.
    pub fn unlink_child(
        &self,
        space_id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(CHILDREN)?;
            let removed = table
                .remove(child_key(space_id, parent_id, name).as_str())?
                .is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// List (name, node id) pairs below a parent
    pub fn list_children(
        &self,
        space_id: &str,
        parent_id: &str,
    ) -> Result<Vec<(String, String)>, DatabaseError> {
        let prefix = format!("{space_id}/{parent_id}/");
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(CHILDREN)?;

        let mut children = Vec::new();
        for entry in table.range(prefix.as_str()..)? {
            let (k, v) = entry?;
            let key = k.value();
            let Some(name) = key.strip_prefix(prefix.as_str()) else {
                break;
            };
            children.push((name.to_string(), v.value().to_string()));
        }
        Ok(children)
    }

    /// Atomically re-link a node under a new parent and name and update its record.
    /// Returns `false` if the target name is already taken.
    pub fn move_node(
        &self,
        space_id: &str,
        node_id: &str,
        new_parent_id: &str,
        new_name: &str,
    ) -> Result<Option<bool>, DatabaseError> {
        let key = node_key(space_id, node_id);
        let write_txn = self.begin_write()?;

        let existing: Option<NodeRecord> = {
            let table = write_txn.open_table(NODES)?;
            let result = match table.get(key.as_str())? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            result
        };

        let Some(mut node) = existing else {
            write_txn.commit()?;
            return Ok(None);
        };

        let target = child_key(space_id, new_parent_id, new_name);
        {
            let mut children = write_txn.open_table(CHILDREN)?;
            if children.get(target.as_str())?.is_some() {
                drop(children);
                write_txn.commit()?;
                return Ok(Some(false));
            }
            children.remove(child_key(space_id, &node.parent_id, &node.name).as_str())?;
            children.insert(target.as_str(), node_id)?;
        }

        node.parent_id = new_parent_id.to_string();
        node.name = new_name.to_string();
        {
            let data = rmp_serde::to_vec_named(&node)?;
            let mut table = write_txn.open_table(NODES)?;
            table.insert(key.as_str(), data.as_slice())?;
        }

        write_txn.commit()?;
        Ok(Some(true))
    }

    // ========================================================================
    // Revisions
    // ========================================================================

    /// Create a revision if none exists under the key. Returns `false` if one already exists.
    pub fn create_revision(
        &self,
        space_id: &str,
        revision_key: &str,
        revision: &RevisionRecord,
    ) -> Result<bool, DatabaseError> {
        let key = revision_table_key(space_id, revision_key);
        let write_txn = self.begin_write()?;
        let created = {
            let mut table = write_txn.open_table(REVISIONS)?;
            let exists = table.get(key.as_str())?.is_some();
            if !exists {
                let data = rmp_serde::to_vec_named(revision)?;
                table.insert(key.as_str(), data.as_slice())?;
            }
            !exists
        };
        write_txn.commit()?;
        Ok(created)
    }

    /// Store a revision, replacing any existing one under the key
    pub fn put_revision(
        &self,
        space_id: &str,
        revision_key: &str,
        revision: &RevisionRecord,
    ) -> Result<(), DatabaseError> {
        let key = revision_table_key(space_id, revision_key);
        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(REVISIONS)?;
            let data = rmp_serde::to_vec_named(revision)?;
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_revision(
        &self,
        space_id: &str,
        revision_key: &str,
    ) -> Result<Option<RevisionRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(REVISIONS)?;
        match table.get(revision_table_key(space_id, revision_key).as_str())? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    pub fn delete_revision(&self, space_id: &str, revision_key: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(REVISIONS)?;
            let removed = table
                .remove(revision_table_key(space_id, revision_key).as_str())?
                .is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// List (revision key, revision) pairs of a node, oldest first
    pub fn list_revisions(
        &self,
        space_id: &str,
        node_id: &str,
    ) -> Result<Vec<(String, RevisionRecord)>, DatabaseError> {
        let space_prefix = format!("{space_id}/");
        let prefix = revision_table_key(space_id, &format!("{node_id}{REVISION_ID_DELIMITER}"));
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(REVISIONS)?;

        let mut revisions = Vec::new();
        for entry in table.range(prefix.as_str()..)? {
            let (k, v) = entry?;
            let key = k.value();
            if !key.starts_with(&prefix) {
                break;
            }
            let revision: RevisionRecord = rmp_serde::from_slice(v.value())?;
            let revision_key = key.strip_prefix(&space_prefix).unwrap_or(key).to_string();
            revisions.push((revision_key, revision));
        }
        revisions.sort_by(|a, b| a.1.mtime.cmp(&b.1.mtime));
        Ok(revisions)
    }
}
