//! Postprocessing events and the publish/subscribe seam.
//!
//! Events are a closed set of variants. On an external bus they travel as tagged JSON
//! (see [`Event::to_json`]); in process they go through a [`EventStream`] broadcast channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 128;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("No subscriber for event: {0}")]
    NoSubscribers(&'static str),
    #[error("Event codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Identity of the user an operation runs as
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executant {
    pub id: String,
    #[serde(default)]
    pub idp: String,
    #[serde(default)]
    pub username: String,
}

impl Executant {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// Reference to a node as seen from outside the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceId {
    pub storage_id: String,
    pub space_id: String,
    pub opaque_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Continue,
    Abort,
    Delete,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostprocessingStep {
    Antivirus,
    Policies,
    Delay,
    #[serde(other)]
    Unknown,
}

/// Result reported by the antivirus step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    #[serde(default)]
    pub infected: bool,
    #[serde(default)]
    pub description: String,
    pub scandate: DateTime<Utc>,
    #[serde(default)]
    pub error_msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    BytesReceived {
        upload_id: String,
        url: String,
        executing_user: Option<Executant>,
        resource_id: ResourceId,
        filename: String,
        filesize: u64,
        #[serde(default)]
        space_owner: Option<String>,
    },
    PostprocessingStepFinished {
        upload_id: String,
        finished_step: PostprocessingStep,
        #[serde(default)]
        result: Option<ScanResult>,
        #[serde(default)]
        executing_user: Option<Executant>,
        #[serde(default)]
        filename: String,
    },
    PostprocessingFinished {
        upload_id: String,
        outcome: Outcome,
        #[serde(default)]
        filename: String,
        #[serde(default)]
        executing_user: Option<Executant>,
    },
    RestartPostprocessing {
        upload_id: String,
        timestamp: DateTime<Utc>,
    },
    CleanUpload {
        upload_id: String,
        #[serde(default)]
        keep_upload: bool,
    },
    UploadReady {
        upload_id: String,
        failed: bool,
        executing_user: Option<Executant>,
        filename: String,
        file_ref: ResourceId,
        timestamp: DateTime<Utc>,
        space_owner: Option<String>,
        is_version: bool,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::BytesReceived { .. } => "bytes_received",
            Event::PostprocessingStepFinished { .. } => "postprocessing_step_finished",
            Event::PostprocessingFinished { .. } => "postprocessing_finished",
            Event::RestartPostprocessing { .. } => "restart_postprocessing",
            Event::CleanUpload { .. } => "clean_upload",
            Event::UploadReady { .. } => "upload_ready",
        }
    }

    pub fn upload_id(&self) -> &str {
        match self {
            Event::BytesReceived { upload_id, .. }
            | Event::PostprocessingStepFinished { upload_id, .. }
            | Event::PostprocessingFinished { upload_id, .. }
            | Event::RestartPostprocessing { upload_id, .. }
            | Event::CleanUpload { upload_id, .. }
            | Event::UploadReady { upload_id, .. } => upload_id,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, EventError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, EventError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Publishing side of the event bus
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: Event) -> Result<(), EventError>;
}

/// In-process event bus backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct EventStream {
    sender: broadcast::Sender<Event>,
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl Publisher for EventStream {
    async fn publish(&self, event: Event) -> Result<(), EventError> {
        let kind = event.kind();
        tracing::trace!(event = kind, upload_id = event.upload_id(), "Publishing event");
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|_| EventError::NoSubscribers(kind))
    }
}
