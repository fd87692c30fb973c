//! Shared helpers for unit tests.

use std::sync::Arc;

use crate::blobstore::LocalBlobstore;
use crate::events::{EventStream, Publisher};
use crate::storage::Database;
use crate::tree::Tree;
use crate::upload::{SessionStore, StoreOptions, TokenOptions};

pub const SPACE: &str = "space-1";

pub struct TestEngine {
    pub tree: Tree,
    pub store: SessionStore,
    pub events: EventStream,
}

/// Engine with a space root, a temporary database and a local blob store.
pub fn test_engine(temp_dir: &tempfile::TempDir, async_uploads: bool) -> TestEngine {
    let db = Database::open(temp_dir.path().join("data")).expect("Failed to open test database");
    let blobstore = LocalBlobstore::new(temp_dir.path().join("storage"))
        .expect("Failed to create test blob store");
    let tree = Tree::with_sync_propagation(db, Arc::new(blobstore));
    tree.create_space(SPACE, Some("owner"), None)
        .expect("Failed to create test space");

    let events = EventStream::new(64);
    let options = StoreOptions {
        async_uploads,
        tokens: TokenOptions {
            transfer_shared_secret: "test-secret".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let publisher: Arc<dyn Publisher> = Arc::new(events.clone());
    let store = SessionStore::open(
        tree.clone(),
        temp_dir.path().join("storage"),
        options,
        Some(publisher),
    )
    .expect("Failed to open session store");

    TestEngine {
        tree,
        store,
        events,
    }
}
