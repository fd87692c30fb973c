use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use upload_engine::blobstore::LocalBlobstore;
use upload_engine::events::{EventStream, Executant, Publisher};
use upload_engine::storage::Database;
use upload_engine::tree::Tree;
use upload_engine::upload::{
    InitiateRequest, SessionState, SessionStore, StoreOptions, TokenOptions, Upload,
    UploadSessionFilter,
};
use upload_engine::UploadError;

const SPACE: &str = "space-1";

struct Engine {
    _dir: tempfile::TempDir,
    tree: Tree,
    store: SessionStore,
}

fn options() -> StoreOptions {
    StoreOptions {
        tokens: TokenOptions {
            data_gateway_endpoint: "https://gateway.example/data".to_string(),
            download_endpoint: "https://download.example/data".to_string(),
            transfer_shared_secret: "test-secret".to_string(),
            transfer_expires: Duration::from_secs(60),
        },
        ..Default::default()
    }
}

fn engine_with(options: StoreOptions, quota: Option<u64>) -> Engine {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let blobstore = LocalBlobstore::new(dir.path().join("storage")).unwrap();
    let tree = Tree::with_sync_propagation(db, Arc::new(blobstore));
    tree.create_space(SPACE, Some("owner-1"), quota).unwrap();

    let publisher: Arc<dyn Publisher> = Arc::new(EventStream::new(16));
    let store =
        SessionStore::open(tree.clone(), dir.path().join("storage"), options, Some(publisher))
            .unwrap();
    Engine {
        _dir: dir,
        tree,
        store,
    }
}

fn engine() -> Engine {
    engine_with(options(), None)
}

fn request(path: &str, size: Option<u64>) -> InitiateRequest {
    InitiateRequest {
        space_id: SPACE.to_string(),
        path: path.to_string(),
        size,
        executant: Executant::new("user-1"),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_initiate_persists_session() {
    let engine = engine();
    let session = engine.store.initiate(request("/report.txt", Some(5))).await.unwrap();

    assert!(session.info_path().exists());
    assert!(session.bin_path().exists());
    assert_eq!(session.state(), SessionState::Created);
    assert!(!session.node_exists());
    assert!(!session.node_id().is_empty());

    let loaded = engine.store.get(session.id()).await.unwrap();
    let m = loaded.metadata();
    assert_eq!(m.filename, "report.txt");
    assert_eq!(m.space_root, SPACE);
    assert_eq!(m.node_parent_id, SPACE);
    assert_eq!(m.space_owner.as_deref(), Some("owner-1"));
    assert_eq!(m.executant.id, "user-1");
    assert_eq!(m.size, 5);
    assert_eq!(m.blob_id, session.id());
    assert!(m.expires.is_some());
    assert_eq!(loaded.node_id(), session.node_id());
}

#[tokio::test]
async fn test_initiate_resolves_existing_node() {
    let engine = engine();
    let mut first = engine.store.initiate(request("/a.txt", Some(3))).await.unwrap();
    first.write_chunk(0, &mut &b"abc"[..]).await.unwrap();
    first.finish_upload().await.unwrap();
    let node = engine.tree.node_by_path(SPACE, "/a.txt").unwrap().unwrap();

    let second = engine.store.initiate(request("/a.txt", Some(4))).await.unwrap();
    assert!(second.node_exists());
    assert_eq!(second.node_id(), node.id);
}

#[tokio::test]
async fn test_initiate_errors() {
    let engine = engine_with(
        StoreOptions {
            max_upload_size: 100,
            ..options()
        },
        None,
    );
    let docs = engine.tree.create_dir(SPACE, SPACE, "docs").await.unwrap();

    let mut missing_space = request("/a.txt", Some(1));
    missing_space.space_id = "nope".to_string();
    assert!(matches!(
        engine.store.initiate(missing_space).await,
        Err(UploadError::NotFound(_))
    ));

    assert!(matches!(
        engine.store.initiate(request("/missing/a.txt", Some(1))).await,
        Err(UploadError::PreconditionFailed(_))
    ));

    assert!(matches!(
        engine.store.initiate(request("/docs", Some(1))).await,
        Err(UploadError::PreconditionFailed(_))
    ));

    assert!(matches!(
        engine.store.initiate(request("/big.bin", Some(101))).await,
        Err(UploadError::BadRequest(_))
    ));

    let mut bad_checksum = request("/a.txt", Some(1));
    bad_checksum.checksum = Some("crc32 deadbeef".to_string());
    assert!(matches!(
        engine.store.initiate(bad_checksum).await,
        Err(UploadError::BadRequest(_))
    ));

    assert!(matches!(
        engine.store.initiate(request("/docs/", Some(1))).await,
        Err(UploadError::BadRequest(_))
    ));

    // Nothing was left behind by the failed attempts
    assert!(engine.store.list().await.unwrap().is_empty());
    assert!(engine.tree.db().list_children(SPACE, &docs.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_initiate_quota_precheck() {
    let engine = engine_with(options(), Some(10));
    assert!(engine.store.initiate(request("/a.bin", Some(10))).await.is_ok());
    assert!(matches!(
        engine.store.initiate(request("/b.bin", Some(11))).await,
        Err(UploadError::InsufficientStorage(_))
    ));
}

#[tokio::test]
async fn test_get_unknown_session() {
    let engine = engine();
    assert!(matches!(
        engine.store.get("does-not-exist").await,
        Err(UploadError::NotFound(_))
    ));
    assert!(matches!(
        engine.store.get("../escape").await,
        Err(UploadError::NotFound(_))
    ));
    assert!(matches!(engine.store.get("").await, Err(UploadError::NotFound(_))));
}

#[tokio::test]
async fn test_offset_comes_from_binary_file() {
    let engine = engine();
    let mut session = engine.store.initiate(request("/a.txt", Some(6))).await.unwrap();
    assert_eq!(session.write_chunk(0, &mut &b"abc"[..]).await.unwrap(), 3);
    assert_eq!(session.state(), SessionState::Receiving);

    // A fresh load sees the bytes on disk even though the record was not rewritten
    let mut reloaded = engine.store.get(session.id()).await.unwrap();
    assert_eq!(reloaded.offset(), 3);
    assert_eq!(reloaded.state(), SessionState::Receiving);

    assert_eq!(reloaded.write_chunk(3, &mut &b"def"[..]).await.unwrap(), 3);
    let info = reloaded.get_info().await.unwrap();
    assert_eq!(info.offset, 6);
    assert_eq!(info.size, 6);

    let mut content = Vec::new();
    reloaded
        .get_reader()
        .await
        .unwrap()
        .read_to_end(&mut content)
        .await
        .unwrap();
    assert_eq!(content, b"abcdef");
}

#[tokio::test]
async fn test_write_chunk_offset_mismatch() {
    let engine = engine();
    let mut session = engine.store.initiate(request("/a.txt", Some(6))).await.unwrap();
    session.write_chunk(0, &mut &b"abc"[..]).await.unwrap();

    assert!(matches!(
        session.write_chunk(1, &mut &b"xyz"[..]).await,
        Err(UploadError::BadRequest(_))
    ));
    assert_eq!(session.offset(), 3);
}

#[tokio::test]
async fn test_write_chunk_stops_at_declared_size() {
    let engine = engine();
    let mut session = engine.store.initiate(request("/a.txt", Some(3))).await.unwrap();
    assert_eq!(session.write_chunk(0, &mut &b"abcdef"[..]).await.unwrap(), 3);
    assert_eq!(tokio::fs::read(session.bin_path()).await.unwrap(), b"abc");
}

#[tokio::test]
async fn test_finish_incomplete_upload() {
    let engine = engine();
    let mut session = engine.store.initiate(request("/a.txt", Some(6))).await.unwrap();
    session.write_chunk(0, &mut &b"abc"[..]).await.unwrap();
    assert!(matches!(
        session.finish_upload().await,
        Err(UploadError::BadRequest(_))
    ));
    assert!(engine.tree.node_by_path(SPACE, "/a.txt").unwrap().is_none());
}

#[tokio::test]
async fn test_deferred_length() {
    let engine = engine();
    let mut session = engine.store.initiate(request("/a.txt", None)).await.unwrap();
    assert!(session.metadata().size_is_deferred);

    session.write_chunk(0, &mut &b"hello"[..]).await.unwrap();
    assert!(matches!(
        session.finish_upload().await,
        Err(UploadError::BadRequest(_))
    ));
    assert!(matches!(
        session.declare_length(2).await,
        Err(UploadError::BadRequest(_))
    ));

    session.declare_length(5).await.unwrap();
    assert!(matches!(
        session.declare_length(5).await,
        Err(UploadError::BadRequest(_))
    ));
    let reloaded = engine.store.get(session.id()).await.unwrap();
    assert_eq!(reloaded.size(), 5);
    assert!(!reloaded.metadata().size_is_deferred);

    session.finish_upload().await.unwrap();
    let node = engine.tree.node_by_path(SPACE, "/a.txt").unwrap().unwrap();
    assert_eq!(node.blob_size, 5);
}

#[tokio::test]
async fn test_concat_uploads() {
    let engine = engine();
    let mut partials = Vec::new();
    for (i, part) in [&b"hello "[..], &b"world"[..]].into_iter().enumerate() {
        let mut req = request(&format!("/part-{i}"), Some(part.len() as u64));
        req.is_partial = true;
        let mut partial = engine.store.initiate(req).await.unwrap();
        partial.write_chunk(0, &mut &part[..]).await.unwrap();
        partials.push(partial);
    }

    let mut session = engine.store.initiate(request("/joined.txt", None)).await.unwrap();
    session.concat_uploads(&partials).await.unwrap();

    let info = session.get_info().await.unwrap();
    assert!(info.is_final);
    assert_eq!(info.offset, 11);
    assert_eq!(info.size, 11);
    assert_eq!(info.partial_uploads.len(), 2);

    session.finish_upload().await.unwrap();
    let node = engine.tree.node_by_path(SPACE, "/joined.txt").unwrap().unwrap();
    assert_eq!(&engine.tree.read_blob(&node).await.unwrap()[..], b"hello world");
}

#[tokio::test]
async fn test_concat_rejects_invalid_parts() {
    let engine = engine();
    let mut plain = engine.store.initiate(request("/plain", Some(5))).await.unwrap();
    plain.write_chunk(0, &mut &b"hello"[..]).await.unwrap();

    let mut session = engine.store.initiate(request("/joined.txt", None)).await.unwrap();
    assert!(matches!(
        session.concat_uploads(std::slice::from_ref(&plain)).await,
        Err(UploadError::BadRequest(_))
    ));

    let mut req = request("/part", Some(5));
    req.is_partial = true;
    let mut part = engine.store.initiate(req).await.unwrap();
    part.write_chunk(0, &mut &b"hello"[..]).await.unwrap();

    // Declared up front as 3 bytes, the 5 byte part does not fit
    let mut short = engine.store.initiate(request("/short.txt", Some(3))).await.unwrap();
    assert!(matches!(
        short.concat_uploads(std::slice::from_ref(&part)).await,
        Err(UploadError::BadRequest(_))
    ));
    let info = short.get_info().await.unwrap();
    assert_eq!(info.offset, 0);
    assert!(!info.is_final);
}

#[tokio::test]
async fn test_list_skips_unreadable_sessions() {
    let engine = engine();
    let session = engine.store.initiate(request("/a.txt", Some(1))).await.unwrap();
    tokio::fs::write(engine.store.uploads_dir().join("broken.info"), b"not msgpack")
        .await
        .unwrap();

    let sessions = engine.store.list().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id(), session.id());
}

#[tokio::test]
async fn test_list_filtered() {
    let engine = engine();
    let idle = engine.store.initiate(request("/idle.txt", Some(1))).await.unwrap();
    let other = engine.store.initiate(request("/other.txt", Some(1))).await.unwrap();

    let by_id = engine
        .store
        .list_filtered(&UploadSessionFilter {
            id: Some(idle.id().to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_id.len(), 1);
    assert_eq!(by_id[0].id(), idle.id());

    let unknown = engine
        .store
        .list_filtered(&UploadSessionFilter {
            id: Some("unknown".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(unknown.is_empty());

    let processing = engine
        .store
        .list_filtered(&UploadSessionFilter {
            processing: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(processing.is_empty());

    let not_expired = engine
        .store
        .list_filtered(&UploadSessionFilter {
            expired: Some(false),
            has_virus: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut ids: Vec<&str> = not_expired.iter().map(|s| s.id()).collect();
    ids.sort();
    let mut expected = vec![idle.id(), other.id()];
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_purge_expired() {
    let engine = engine_with(
        StoreOptions {
            upload_expiration: Duration::from_secs(60),
            ..options()
        },
        None,
    );
    let mut session = engine.store.initiate(request("/a.txt", Some(3))).await.unwrap();
    session.write_chunk(0, &mut &b"ab"[..]).await.unwrap();

    assert_eq!(engine.store.purge_expired(chrono::Utc::now()).await.unwrap(), 0);
    assert!(session.info_path().exists());

    let later = chrono::Utc::now() + chrono::Duration::minutes(5);
    assert_eq!(engine.store.purge_expired(later).await.unwrap(), 1);
    assert!(!session.info_path().exists());
    assert!(!session.bin_path().exists());
    assert!(matches!(
        engine.store.get(session.id()).await,
        Err(UploadError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_terminate_removes_session() {
    let engine = engine();
    let mut session = engine.store.initiate(request("/a.txt", Some(3))).await.unwrap();
    session.write_chunk(0, &mut &b"ab"[..]).await.unwrap();

    session.terminate().await.unwrap();
    assert_eq!(session.state(), SessionState::Aborted);
    assert!(!session.info_path().exists());
    assert!(!session.bin_path().exists());
    assert!(matches!(
        session.write_chunk(2, &mut &b"c"[..]).await,
        Err(UploadError::InvalidState(_))
    ));
    assert!(engine.tree.node_by_path(SPACE, "/a.txt").unwrap().is_none());
}

#[tokio::test]
async fn test_transfer_url_is_signed() {
    let engine = engine();
    let session = engine.store.initiate(request("/a.txt", Some(3))).await.unwrap();

    let url = session.url().unwrap();
    let token = url
        .strip_prefix("https://gateway.example/data/")
        .expect("url should point at the data gateway");

    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.set_audience(&["reva"]);
    let decoded = jsonwebtoken::decode::<serde_json::Value>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(b"test-secret"),
        &validation,
    )
    .unwrap();
    assert_eq!(
        decoded.claims["target"],
        format!("https://download.example/data/tus/{}", session.id())
    );
}

#[tokio::test]
async fn test_sessions_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let db = Database::open(dir.path().join("data")).unwrap();
        let blobstore = LocalBlobstore::new(dir.path().join("storage")).unwrap();
        let tree = Tree::with_sync_propagation(db, Arc::new(blobstore));
        tree.create_space(SPACE, None, None).unwrap();
        let store = SessionStore::open(tree, dir.path().join("storage"), options(), None).unwrap();
        let mut session = store.initiate(request("/a.txt", Some(4))).await.unwrap();
        session.write_chunk(0, &mut &b"ab"[..]).await.unwrap();
        session.id().to_string()
    };

    let db = Database::open(dir.path().join("data")).unwrap();
    let blobstore = LocalBlobstore::new(dir.path().join("storage")).unwrap();
    let tree = Tree::with_sync_propagation(db, Arc::new(blobstore));
    let store = SessionStore::open(tree.clone(), dir.path().join("storage"), options(), None).unwrap();

    let mut session = store.get(&id).await.unwrap();
    assert_eq!(session.offset(), 2);
    session.write_chunk(2, &mut &b"cd"[..]).await.unwrap();
    session.finish_upload().await.unwrap();

    let node = tree.node_by_path(SPACE, "/a.txt").unwrap().unwrap();
    assert_eq!(&tree.read_blob(&node).await.unwrap()[..], b"abcd");
}
