//! Keyed read/write locks scoping mutual exclusion to a single node or upload session.
//!
//! Entries are held weakly so the table only keeps locks that somebody is holding or
//! waiting on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

pub type ReadGuard = OwnedRwLockReadGuard<()>;
pub type WriteGuard = OwnedRwLockWriteGuard<()>;

const PRUNE_THRESHOLD: usize = 256;

#[derive(Clone, Default)]
pub struct LockTable {
    locks: Arc<Mutex<HashMap<String, Weak<RwLock<()>>>>>,
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable").finish_non_exhaustive()
    }
}

pub fn node_lock_key(space_id: &str, node_id: &str) -> String {
    format!("node:{space_id}/{node_id}")
}

pub fn session_lock_key(upload_id: &str) -> String {
    format!("session:{upload_id}")
}

pub fn quota_lock_key(space_id: &str) -> String {
    format!("quota:{space_id}")
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(key).and_then(Weak::upgrade) {
            return lock;
        }
        if locks.len() >= PRUNE_THRESHOLD {
            locks.retain(|_, l| l.strong_count() > 0);
        }
        let lock = Arc::new(RwLock::new(()));
        locks.insert(key.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Exclusive lock, waits until available
    pub async fn write(&self, key: &str) -> WriteGuard {
        self.entry(key).write_owned().await
    }

    /// Shared lock, waits until no writer holds the key
    pub async fn read(&self, key: &str) -> ReadGuard {
        self.entry(key).read_owned().await
    }

    pub async fn lock_node(&self, space_id: &str, node_id: &str) -> WriteGuard {
        self.write(&node_lock_key(space_id, node_id)).await
    }

    /// Serializes quota checks with the size change they admit. Taken before any node lock.
    pub async fn lock_quota(&self, space_id: &str) -> WriteGuard {
        self.write(&quota_lock_key(space_id)).await
    }

    pub async fn lock_session(&self, upload_id: &str) -> WriteGuard {
        self.write(&session_lock_key(upload_id)).await
    }

    pub async fn read_session(&self, upload_id: &str) -> ReadGuard {
        self.read(&session_lock_key(upload_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_write_lock_excludes() {
        let locks = LockTable::new();
        let guard = locks.write("a").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.write("a").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = LockTable::new();
        let _a = locks.write("a").await;
        tokio::time::timeout(Duration::from_millis(100), locks.write("b"))
            .await
            .expect("other key should be free");
    }

    #[tokio::test]
    async fn test_quota_lock_leaves_space_root_free() {
        let locks = LockTable::new();
        let _quota = locks.lock_quota("space").await;
        tokio::time::timeout(Duration::from_millis(100), locks.lock_node("space", "space"))
            .await
            .expect("propagation must not wait on the quota lock");
    }

    #[tokio::test]
    async fn test_readers_share() {
        let locks = LockTable::new();
        let _r1 = locks.read("a").await;
        tokio::time::timeout(Duration::from_millis(100), locks.read("a"))
            .await
            .expect("readers should not block each other");
    }
}
