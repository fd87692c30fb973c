use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use upload_engine::{
    blobstore::LocalBlobstore,
    config::Config,
    events::{EventStream, Publisher},
    postprocessing::Postprocessor,
    storage::Database,
    tree::Tree,
    upload::{SessionStore, StoreOptions},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "upload-engine starting");

    let config = Config::load()?;
    info!(node_id = config.node.id.as_str(), "Loaded configuration");

    let db = Database::open(&config.node.data_dir)?;
    info!(data_dir = config.node.data_dir.as_str(), "Database opened");

    let blobstore = LocalBlobstore::new(&config.storage.root)?;
    info!(root = config.storage.root.as_str(), "Using local blob store");

    let tree = Tree::with_sync_propagation(db, Arc::new(blobstore));
    let events = EventStream::new(config.event_buffer);
    // Subscribe before anything can publish
    let receiver = events.subscribe();
    let publisher: Arc<dyn Publisher> = Arc::new(events.clone());

    let store = SessionStore::open(
        tree.clone(),
        &config.storage.root,
        StoreOptions::from(&config),
        Some(Arc::clone(&publisher)),
    )?;

    recover(&store, &tree).await?;

    let shutdown = CancellationToken::new();
    let postprocessor = Postprocessor::new(store, publisher);
    let loop_token = shutdown.clone();
    let handle = tokio::spawn(async move { postprocessor.run(receiver, loop_token).await });

    shutdown_signal().await;
    shutdown.cancel();
    if let Err(e) = handle.await {
        tracing::error!(error = %e, "Postprocessing loop ended abnormally");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Reports sessions left over from a previous run and repairs orphaned processing markers.
async fn recover(store: &SessionStore, tree: &Tree) -> anyhow::Result<()> {
    let sessions = store.list().await?;
    let processing = sessions.iter().filter(|s| s.is_processing()).count();
    info!(
        sessions = sessions.len(),
        processing = processing,
        "Found upload sessions on disk"
    );

    for space in tree.db().list_spaces()? {
        let repaired = store.sweep_stale_nodes(&space.id, false).await?;
        if repaired > 0 {
            info!(space_id = space.id.as_str(), nodes = repaired, "Repaired stale processing nodes");
        }
    }

    let purged = store.purge_expired(chrono::Utc::now()).await?;
    if purged > 0 {
        info!(sessions = purged, "Purged expired upload sessions");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping postprocessing");
}
