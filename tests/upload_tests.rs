use std::sync::Arc;

use chrono::{TimeZone, Utc};
use upload_engine::blobstore::{BlobRef, Blobstore, LocalBlobstore};
use upload_engine::events::{Event, EventStream, Executant, Publisher};
use upload_engine::storage::Database;
use upload_engine::tree::Tree;
use upload_engine::upload::{
    InitiateRequest, SessionState, SessionStore, StoreOptions, TokenOptions, Upload,
    UploadSession,
};
use upload_engine::UploadError;

const SPACE: &str = "space-1";

struct Engine {
    _dir: tempfile::TempDir,
    tree: Tree,
    blobs: Arc<LocalBlobstore>,
    store: SessionStore,
    events: EventStream,
}

fn engine_with(async_uploads: bool, disable_versioning: bool, quota: Option<u64>) -> Engine {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let blobs = Arc::new(LocalBlobstore::new(dir.path().join("storage")).unwrap());
    let tree = Tree::with_sync_propagation(db, blobs.clone());
    tree.create_space(SPACE, Some("owner-1"), quota).unwrap();

    let events = EventStream::new(16);
    let publisher: Arc<dyn Publisher> = Arc::new(events.clone());
    let options = StoreOptions {
        async_uploads,
        disable_versioning,
        tokens: TokenOptions {
            transfer_shared_secret: "test-secret".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let store =
        SessionStore::open(tree.clone(), dir.path().join("storage"), options, Some(publisher))
            .unwrap();
    Engine {
        _dir: dir,
        tree,
        blobs,
        store,
        events,
    }
}

fn engine() -> Engine {
    engine_with(false, false, None)
}

fn request(path: &str, content: &[u8]) -> InitiateRequest {
    InitiateRequest {
        space_id: SPACE.to_string(),
        path: path.to_string(),
        size: Some(content.len() as u64),
        executant: Executant::new("user-1"),
        ..Default::default()
    }
}

async fn start(engine: &Engine, req: InitiateRequest, content: &[u8]) -> UploadSession {
    let mut session = engine.store.initiate(req).await.unwrap();
    session.write_chunk(0, &mut &content[..]).await.unwrap();
    session
}

async fn upload(engine: &Engine, path: &str, content: &[u8]) -> UploadSession {
    let mut session = start(engine, request(path, content), content).await;
    session.finish_upload().await.unwrap();
    session
}

async fn content_at(engine: &Engine, path: &str) -> Vec<u8> {
    let node = engine.tree.node_by_path(SPACE, path).unwrap().unwrap();
    engine.tree.read_blob(&node).await.unwrap().to_vec()
}

fn tree_size(engine: &Engine, node_id: &str) -> u64 {
    engine.tree.read_node(SPACE, node_id).unwrap().unwrap().tree_size
}

#[tokio::test]
async fn test_sync_upload_finalizes() {
    let engine = engine();
    let docs = engine.tree.create_dir(SPACE, SPACE, "docs").await.unwrap();
    let content = vec![7u8; 100];

    let session = upload(&engine, "/docs/report.txt", &content).await;
    assert_eq!(session.state(), SessionState::Finalized);
    assert!(!session.info_path().exists());
    assert!(!session.bin_path().exists());

    let node = engine.tree.node_by_path(SPACE, "/docs/report.txt").unwrap().unwrap();
    assert_eq!(node.blob_size, 100);
    assert_eq!(node.blob_id, session.id());
    assert_eq!(node.parent_id, docs.id);
    assert!(!node.is_processing());
    assert_eq!(content_at(&engine, "/docs/report.txt").await, content);

    assert_eq!(tree_size(&engine, &docs.id), 100);
    assert_eq!(tree_size(&engine, SPACE), 100);
    assert!(engine.tree.read_node(SPACE, &docs.id).unwrap().unwrap().tmtime.is_some());
}

#[tokio::test]
async fn test_checksum_verified() {
    let engine = engine();
    let mut req = request("/abc.txt", b"abc");
    req.checksum = Some("sha1 a9993e364706816aba3e25717850c26c9cd0d89d".to_string());
    let mut session = start(&engine, req, b"abc").await;
    session.finish_upload().await.unwrap();

    let node = engine.tree.node_by_path(SPACE, "/abc.txt").unwrap().unwrap();
    assert_eq!(hex::encode(&node.checksums.sha1), "a9993e364706816aba3e25717850c26c9cd0d89d");
    assert_eq!(hex::encode(&node.checksums.md5), "900150983cd24fb0d6963f7d28e17f72");
    assert_eq!(hex::encode(&node.checksums.adler32), "024d0127");
}

#[tokio::test]
async fn test_checksum_mismatch_rejects_upload() {
    let engine = engine();
    let mut req = request("/abc.txt", b"abc");
    req.checksum = Some("md5 00000000000000000000000000000000".to_string());
    let mut session = start(&engine, req, b"abc").await;

    let result = session.finish_upload().await;
    assert!(matches!(result, Err(UploadError::ChecksumMismatch(_))));
    assert_eq!(session.state(), SessionState::Aborted);
    assert!(engine.tree.node_by_path(SPACE, "/abc.txt").unwrap().is_none());
    assert!(!session.info_path().exists());
    assert!(!engine
        .blobs
        .exists(&BlobRef::new(SPACE, session.id()))
        .await
        .unwrap());
    assert_eq!(tree_size(&engine, SPACE), 0);
}

#[tokio::test]
async fn test_quota_boundary() {
    let engine = engine_with(false, false, Some(10));
    // All three pass the check at initiation while the space is still empty
    let mut a = start(&engine, request("/a.bin", &[1; 6]), &[1; 6]).await;
    let mut b = start(&engine, request("/b.bin", &[2; 4]), &[2; 4]).await;
    let mut c = start(&engine, request("/c.bin", &[3; 1]), &[3; 1]).await;

    a.finish_upload().await.unwrap();
    b.finish_upload().await.unwrap();
    assert_eq!(tree_size(&engine, SPACE), 10);

    assert!(matches!(
        c.finish_upload().await,
        Err(UploadError::InsufficientStorage(_))
    ));
    assert!(engine.tree.node_by_path(SPACE, "/c.bin").unwrap().is_none());
    assert!(!engine.blobs.exists(&BlobRef::new(SPACE, c.id())).await.unwrap());
    assert_eq!(tree_size(&engine, SPACE), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_uploads_share_quota() {
    let engine = engine_with(false, false, Some(10));
    let mut a = start(&engine, request("/a.bin", &[1; 6]), &[1; 6]).await;
    let mut b = start(&engine, request("/b.bin", &[2; 6]), &[2; 6]).await;

    let (ra, rb) = tokio::join!(a.finish_upload(), b.finish_upload());
    let (stored, rejected) = match (&ra, &rb) {
        (Ok(()), Err(UploadError::InsufficientStorage(_))) => ("/a.bin", "/b.bin"),
        (Err(UploadError::InsufficientStorage(_)), Ok(())) => ("/b.bin", "/a.bin"),
        other => panic!("expected exactly one upload over quota, got {other:?}"),
    };

    assert!(engine.tree.node_by_path(SPACE, stored).unwrap().is_some());
    assert!(engine.tree.node_by_path(SPACE, rejected).unwrap().is_none());
    assert_eq!(tree_size(&engine, SPACE), 6);
}

#[tokio::test]
async fn test_overwrite_within_quota() {
    let engine = engine_with(false, false, Some(10));
    upload(&engine, "/a.bin", &[1; 10]).await;
    // Replacing 10 bytes by 8 fits even though the space is full
    upload(&engine, "/a.bin", &[2; 8]).await;
    assert_eq!(tree_size(&engine, SPACE), 8);
    assert_eq!(content_at(&engine, "/a.bin").await, vec![2; 8]);
}

#[tokio::test]
async fn test_overwrite_creates_revision() {
    let engine = engine();
    let first = upload(&engine, "/a.txt", b"first").await;
    let node = engine.tree.node_by_path(SPACE, "/a.txt").unwrap().unwrap();

    let second = upload(&engine, "/a.txt", b"second!").await;
    assert!(second.node_exists());
    assert_eq!(second.size_diff(), 2);

    let updated = engine.tree.node_by_path(SPACE, "/a.txt").unwrap().unwrap();
    assert_eq!(updated.id, node.id);
    assert_eq!(updated.blob_id, second.id());
    assert_eq!(content_at(&engine, "/a.txt").await, b"second!");
    assert_eq!(tree_size(&engine, SPACE), 7);

    let revisions = engine.tree.db().list_revisions(SPACE, &node.id).unwrap();
    assert_eq!(revisions.len(), 1);
    let (key, revision) = &revisions[0];
    assert_eq!(Some(key), second.metadata().revision_key.as_ref());
    assert_eq!(revision.blob_id, first.id());
    assert_eq!(revision.blob_size, 5);
    assert_eq!(revision.mtime, node.mtime);
    // The old content is kept as version history
    assert!(engine.blobs.exists(&BlobRef::new(SPACE, first.id())).await.unwrap());
}

#[tokio::test]
async fn test_overwrite_without_versioning() {
    let engine = engine_with(false, true, None);
    upload(&engine, "/a.txt", b"first").await;
    let second = upload(&engine, "/a.txt", b"second").await;

    let node = engine.tree.node_by_path(SPACE, "/a.txt").unwrap().unwrap();
    assert!(second.metadata().revision_key.is_none());
    assert!(engine.tree.db().list_revisions(SPACE, &node.id).unwrap().is_empty());
    assert_eq!(content_at(&engine, "/a.txt").await, b"second");
}

#[tokio::test]
async fn test_client_mtime_is_kept() {
    let engine = engine();
    let mtime = Utc.with_ymd_and_hms(2023, 6, 1, 8, 30, 0).unwrap();
    let mut req = request("/a.txt", b"abc");
    req.mtime = Some(mtime);
    let mut session = start(&engine, req, b"abc").await;
    session.finish_upload().await.unwrap();

    let node = engine.tree.node_by_path(SPACE, "/a.txt").unwrap().unwrap();
    assert_eq!(node.mtime, mtime);
}

#[tokio::test]
async fn test_if_match() {
    let engine = engine();
    upload(&engine, "/a.txt", b"original").await;
    let node = engine.tree.node_by_path(SPACE, "/a.txt").unwrap().unwrap();

    let mut stale = request("/a.txt", b"changed");
    stale.if_match = Some("\"stale\"".to_string());
    let mut session = start(&engine, stale, b"changed").await;
    assert!(matches!(
        session.finish_upload().await,
        Err(UploadError::Aborted(_))
    ));
    assert_eq!(content_at(&engine, "/a.txt").await, b"original");
    assert!(engine.tree.db().list_revisions(SPACE, &node.id).unwrap().is_empty());
    assert_eq!(tree_size(&engine, SPACE), 8);

    let mut current = request("/a.txt", b"changed");
    current.if_match = Some(node.etag());
    let mut session = start(&engine, current, b"changed").await;
    session.finish_upload().await.unwrap();
    assert_eq!(content_at(&engine, "/a.txt").await, b"changed");
}

#[tokio::test]
async fn test_if_none_match_star() {
    let engine = engine();

    let mut create = request("/a.txt", b"one");
    create.if_none_match = Some("*".to_string());
    let mut session = start(&engine, create, b"one").await;
    session.finish_upload().await.unwrap();

    let mut overwrite = request("/a.txt", b"two");
    overwrite.if_none_match = Some("*".to_string());
    let mut session = start(&engine, overwrite, b"two").await;
    assert!(matches!(
        session.finish_upload().await,
        Err(UploadError::Aborted(_))
    ));
    assert_eq!(content_at(&engine, "/a.txt").await, b"one");
}

#[tokio::test]
async fn test_if_unmodified_since() {
    let engine = engine();
    let mtime = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let mut req = request("/a.txt", b"one");
    req.mtime = Some(mtime);
    let mut session = start(&engine, req, b"one").await;
    session.finish_upload().await.unwrap();

    let mut older = request("/a.txt", b"two");
    older.if_unmodified_since = Some("2024-02-01T00:00:00Z".to_string());
    let mut session = start(&engine, older, b"two").await;
    assert!(matches!(
        session.finish_upload().await,
        Err(UploadError::Aborted(_))
    ));

    let mut newer = request("/a.txt", b"two");
    newer.if_unmodified_since = Some("2024-03-01T12:00:00Z".to_string());
    let mut session = start(&engine, newer, b"two").await;
    session.finish_upload().await.unwrap();
    assert_eq!(content_at(&engine, "/a.txt").await, b"two");
}

#[tokio::test]
async fn test_concurrent_creates() {
    let engine = engine();
    let mut first = start(&engine, request("/same.txt", b"first"), b"first").await;
    let mut second = start(&engine, request("/same.txt", b"second"), b"second").await;
    assert!(!first.node_exists() && !second.node_exists());

    let (a, b) = tokio::join!(first.finish_upload(), second.finish_upload());
    let (winner, content): (&UploadSession, &[u8]) = match (&a, &b) {
        (Ok(()), Err(UploadError::AlreadyExists(_))) => (&first, &b"first"[..]),
        (Err(UploadError::AlreadyExists(_)), Ok(())) => (&second, &b"second"[..]),
        other => panic!("expected exactly one AlreadyExists, got {other:?}"),
    };

    let node = engine.tree.node_by_path(SPACE, "/same.txt").unwrap().unwrap();
    assert_eq!(node.id, winner.node_id());
    assert_eq!(content_at(&engine, "/same.txt").await, content);
    assert_eq!(tree_size(&engine, SPACE), content.len() as u64);
    assert_eq!(engine.tree.db().list_children(SPACE, SPACE).unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_handoff_reverts_node() {
    let engine = engine_with(true, false, None);
    let events = engine.events.subscribe();
    upload(&engine, "/b.bin", &[2; 100]).await;
    assert_eq!(tree_size(&engine, SPACE), 100);

    // Nobody listens anymore, so BytesReceived cannot be delivered
    drop(events);
    let mut session = start(&engine, request("/a.bin", &[1; 50]), &[1; 50]).await;
    assert!(matches!(
        session.finish_upload().await,
        Err(UploadError::Event(_))
    ));

    assert_eq!(session.state(), SessionState::Aborted);
    assert!(engine.tree.node_by_path(SPACE, "/a.bin").unwrap().is_none());
    assert_eq!(tree_size(&engine, SPACE), 100);
    // The bytes stay around for inspection
    assert!(session.bin_path().exists());
}

#[tokio::test]
async fn test_async_upload_waits_for_postprocessing() {
    let engine = engine_with(true, false, None);
    let mut events = engine.events.subscribe();

    let mut session = start(&engine, request("/a.txt", b"hello"), b"hello").await;
    session.finish_upload().await.unwrap();
    assert_eq!(session.state(), SessionState::Finishing);
    assert!(session.info_path().exists());

    let node = engine.tree.node_by_path(SPACE, "/a.txt").unwrap().unwrap();
    assert_eq!(node.processing_id(), Some(session.id()));
    assert_eq!(node.blob_size, 5);
    // Bytes stay in the upload area until postprocessing finishes
    assert!(!engine.blobs.exists(&BlobRef::new(SPACE, session.id())).await.unwrap());
    assert_eq!(tree_size(&engine, SPACE), 5);

    match events.recv().await.unwrap() {
        Event::BytesReceived {
            upload_id,
            url,
            executing_user,
            resource_id,
            filename,
            filesize,
            space_owner,
        } => {
            assert_eq!(upload_id, session.id());
            assert!(!url.is_empty());
            assert_eq!(executing_user.map(|u| u.id), Some("user-1".to_string()));
            assert_eq!(resource_id.space_id, SPACE);
            assert_eq!(resource_id.opaque_id, node.id);
            assert_eq!(filename, "a.txt");
            assert_eq!(filesize, 5);
            assert_eq!(space_owner.as_deref(), Some("owner-1"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let reloaded = engine.store.get(session.id()).await.unwrap();
    assert!(reloaded.is_processing());
    assert_eq!(reloaded.size_diff(), 5);
}

#[tokio::test]
async fn test_async_empty_file_finalizes_immediately() {
    let engine = engine_with(true, false, None);
    let mut events = engine.events.subscribe();

    let mut session = engine.store.initiate(request("/empty.txt", b"")).await.unwrap();
    session.finish_upload().await.unwrap();
    assert_eq!(session.state(), SessionState::Finalized);

    let node = engine.tree.node_by_path(SPACE, "/empty.txt").unwrap().unwrap();
    assert!(!node.is_processing());
    assert_eq!(node.blob_size, 0);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_finish_twice_is_rejected() {
    let engine = engine();
    let mut session = upload(&engine, "/a.txt", b"abc").await;
    assert!(matches!(
        session.finish_upload().await,
        Err(UploadError::InvalidState(_))
    ));
}
