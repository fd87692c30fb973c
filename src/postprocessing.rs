//! Consumes postprocessing events and drives finalize, propagation and cleanup.
//!
//! Events are handled strictly one at a time. A bad event (unknown upload, missing node)
//! is logged and dropped so the loop keeps running.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::{
    Event, Executant, Outcome, PostprocessingStep, Publisher, ResourceId, ScanResult,
};
use crate::upload::{SessionStore, UploadSession};

/// Executing user reported when postprocessing is restarted by the engine.
pub const RESTART_USER: &str = "postprocessing-restart";

/// Cache of stat responses kept by a gateway in front of the engine.
#[async_trait]
pub trait StatCache: Send + Sync {
    async fn remove_stat(&self, user: Option<&Executant>, resource: &ResourceId);
}

pub struct Postprocessor {
    store: SessionStore,
    publisher: Arc<dyn Publisher>,
    stat_cache: Option<Arc<dyn StatCache>>,
}

impl Postprocessor {
    pub fn new(store: SessionStore, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            store,
            publisher,
            stat_cache: None,
        }
    }

    pub fn with_stat_cache(mut self, cache: Arc<dyn StatCache>) -> Self {
        self.stat_cache = Some(cache);
        self
    }

    /// Drains the receiver until it closes or the token is cancelled.
    pub async fn run(&self, mut events: broadcast::Receiver<Event>, shutdown: CancellationToken) {
        tracing::info!("Postprocessing loop started");
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => received,
            };
            match event {
                Ok(event) => self.handle(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Postprocessing receiver lagged, events were lost");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::info!("Postprocessing loop stopped");
    }

    pub async fn handle(&self, event: Event) {
        match event {
            Event::PostprocessingFinished {
                upload_id,
                outcome,
                filename,
                executing_user,
            } => {
                self.postprocessing_finished(&upload_id, outcome, filename, executing_user)
                    .await
            }
            Event::PostprocessingStepFinished {
                upload_id,
                finished_step,
                result,
                executing_user,
                ..
            } => {
                self.step_finished(&upload_id, finished_step, result, executing_user)
                    .await
            }
            Event::RestartPostprocessing { upload_id, .. } => self.restart(&upload_id).await,
            Event::CleanUpload {
                upload_id,
                keep_upload,
            } => self.clean_upload(&upload_id, keep_upload).await,
            // Published by the engine itself
            Event::BytesReceived { .. } | Event::UploadReady { .. } => {}
        }
    }

    async fn load(&self, upload_id: &str, event: &'static str) -> Option<UploadSession> {
        match self.store.get(upload_id).await {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::error!(event = event, upload_id = upload_id, error = %e, "Failed to get upload");
                None
            }
        }
    }

    async fn postprocessing_finished(
        &self,
        upload_id: &str,
        outcome: Outcome,
        filename: String,
        executing_user: Option<Executant>,
    ) {
        const EVENT: &str = "postprocessing_finished";
        let Some(mut session) = self.load(upload_id, EVENT).await else {
            return;
        };
        match session.node() {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::debug!(upload_id = upload_id, "Node no longer exists");
                self.store.cleanup(&mut session, false, false, false).await;
                return;
            }
            Err(e) => {
                tracing::error!(event = EVENT, upload_id = upload_id, error = %e, "Could not read node");
                return;
            }
        }

        let (failed, revert, keep_upload, unmark) = match outcome {
            Outcome::Continue => match self.finish(&session).await {
                Ok(()) => (false, false, false, true),
                Err(e) => {
                    tracing::error!(upload_id = upload_id, error = %e, "Could not finalize upload");
                    // Keep the marker so the upload survives housekeeping
                    (true, false, true, false)
                }
            },
            Outcome::Abort => (true, true, true, true),
            Outcome::Delete => (true, true, false, true),
            Outcome::Unknown => {
                tracing::error!(upload_id = upload_id, "Unknown postprocessing outcome, aborting");
                (true, true, true, true)
            }
        };

        let now = Utc::now();
        if failed {
            if let Err(e) = self.store.release_size_diff(&session).await {
                tracing::error!(upload_id = upload_id, error = %e, "Could not revert tree size change");
            }
        } else if let Err(e) = self.touch_parent(&session, now).await {
            tracing::error!(upload_id = upload_id, error = %e, "Could not propagate etag change");
        }

        self.store
            .cleanup(&mut session, revert, keep_upload, unmark)
            .await;

        let reference = session.reference();
        if let Some(cache) = &self.stat_cache {
            cache.remove_stat(executing_user.as_ref(), &reference).await;
        }

        let is_version = session.node_exists() && session.metadata().revision_key.is_some();
        let ready = Event::UploadReady {
            upload_id: upload_id.to_string(),
            failed,
            executing_user,
            filename,
            file_ref: reference,
            timestamp: now,
            space_owner: session.metadata().space_owner.clone(),
            is_version,
        };
        if let Err(e) = self.publisher.publish(ready).await {
            tracing::error!(upload_id = upload_id, error = %e, "Failed to publish UploadReady event");
        }
        tracing::info!(
            upload_id = upload_id,
            node_id = session.node_id(),
            failed = failed,
            "Postprocessing finished"
        );
    }

    async fn finish(&self, session: &UploadSession) -> Result<()> {
        session.finalize().await?;
        self.store.set_node_to_upload(session).await?;
        Ok(())
    }

    async fn touch_parent(&self, session: &UploadSession, now: chrono::DateTime<Utc>) -> Result<()> {
        let space_id = session.space_id();
        let parent_id = &session.metadata().node_parent_id;
        let parent = {
            let _guard = self.store.locks().lock_node(space_id, parent_id).await;
            self.store
                .tree()
                .db()
                .update_node(space_id, parent_id, |p| p.tmtime = Some(now))?
        };
        match parent {
            Some(parent) => self.store.tree().propagate(&parent, 0).await,
            None => Ok(()),
        }
    }

    async fn step_finished(
        &self,
        upload_id: &str,
        step: PostprocessingStep,
        result: Option<ScanResult>,
        executing_user: Option<Executant>,
    ) {
        const EVENT: &str = "postprocessing_step_finished";
        if step != PostprocessingStep::Antivirus {
            return;
        }
        let Some(result) = result else {
            tracing::warn!(upload_id = upload_id, "Antivirus step finished without a result");
            return;
        };
        if !result.error_msg.is_empty() {
            tracing::warn!(upload_id = upload_id, error = result.error_msg.as_str(), "Scan failed");
            return;
        }
        if upload_id.is_empty() {
            tracing::warn!("On-demand scan results are not supported");
            return;
        }

        let Some(mut session) = self.load(upload_id, EVENT).await else {
            return;
        };
        let node = match session.node() {
            Ok(Some(node)) => node,
            Ok(None) => {
                tracing::error!(event = EVENT, upload_id = upload_id, "Failed to get node after scan");
                return;
            }
            Err(e) => {
                tracing::error!(event = EVENT, upload_id = upload_id, error = %e, "Failed to get node after scan");
                return;
            }
        };

        session.set_scan_data(&result.description, result.scandate);
        if let Err(e) = session.persist().await {
            tracing::error!(upload_id = upload_id, error = %e, "Failed to persist scan results");
        }

        let scan = crate::storage::models::ScanData {
            result: result.description.clone(),
            date: result.scandate,
        };
        let updated = {
            let _guard = self.store.locks().lock_node(&node.space_id, &node.id).await;
            self.store
                .tree()
                .db()
                .update_node(&node.space_id, &node.id, |n| n.scan = Some(scan))
        };
        if let Err(e) = updated {
            tracing::error!(upload_id = upload_id, error = %e, "Failed to set scan results");
            return;
        }

        if let Some(cache) = &self.stat_cache {
            cache
                .remove_stat(executing_user.as_ref(), &session.reference())
                .await;
        }
        tracing::info!(
            upload_id = upload_id,
            infected = result.infected,
            description = result.description.as_str(),
            "Recorded scan result"
        );
    }

    async fn restart(&self, upload_id: &str) {
        const EVENT: &str = "restart_postprocessing";
        let Some(session) = self.load(upload_id, EVENT).await else {
            return;
        };
        let node = match session.node() {
            Ok(Some(node)) => node,
            Ok(None) => {
                tracing::error!(event = EVENT, upload_id = upload_id, "Could not read node");
                return;
            }
            Err(e) => {
                tracing::error!(event = EVENT, upload_id = upload_id, error = %e, "Could not read node");
                return;
            }
        };
        if !session.is_processing() {
            tracing::warn!(upload_id = upload_id, "Upload is not waiting on postprocessing");
            return;
        }

        let url = match session.url() {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(upload_id = upload_id, error = %e, "Could not create url");
                return;
            }
        };
        let event = Event::BytesReceived {
            upload_id: upload_id.to_string(),
            url,
            executing_user: Some(Executant::new(RESTART_USER)),
            resource_id: ResourceId {
                storage_id: session.metadata().provider_id.clone(),
                space_id: node.space_id.clone(),
                opaque_id: node.id.clone(),
            },
            filename: session.filename().to_string(),
            filesize: session.size(),
            space_owner: session.metadata().space_owner.clone(),
        };
        match self.publisher.publish(event).await {
            Ok(()) => tracing::info!(upload_id = upload_id, "Restarted postprocessing"),
            Err(e) => {
                tracing::error!(upload_id = upload_id, error = %e, "Failed to publish BytesReceived event")
            }
        }
    }

    async fn clean_upload(&self, upload_id: &str, keep_upload: bool) {
        let Some(mut session) = self.load(upload_id, "clean_upload").await else {
            return;
        };
        self.store
            .cleanup(&mut session, true, keep_upload, true)
            .await;
        tracing::info!(upload_id = upload_id, keep_upload = keep_upload, "Cleaned upload");
    }
}
