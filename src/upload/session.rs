use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use super::checksum;
use super::metadata::{bin_path, info_path, write_atomic, SessionMetadata, SessionPhase};
use super::store::SessionStore;
use crate::error::{Result, UploadError};
use crate::events::{Event, Executant, ResourceId};
use crate::storage::models::NodeRecord;

const COPY_BUFFER: usize = 32 * 1024;
const TOKEN_AUDIENCE: &str = "reva";

/// Where a session stands from the transport's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Receiving,
    /// All bytes are in and the node is waiting for postprocessing
    Finishing,
    Finalized,
    Aborted,
}

/// Snapshot handed to the transport
#[derive(Debug, Clone, PartialEq)]
pub struct UploadInfo {
    pub id: String,
    pub filename: String,
    pub space_id: String,
    pub node_id: String,
    pub size: u64,
    pub size_is_deferred: bool,
    pub offset: u64,
    pub expires: Option<DateTime<Utc>>,
    pub is_partial: bool,
    pub is_final: bool,
    pub partial_uploads: Vec<String>,
}

/// Resumable upload contract consumed by the transport layer.
#[async_trait]
pub trait Upload: Send + Sync {
    /// Appends bytes at `offset` and returns how many were written.
    async fn write_chunk(
        &mut self,
        offset: u64,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64>;
    async fn get_info(&self) -> Result<UploadInfo>;
    async fn get_reader(&self) -> Result<Box<dyn AsyncRead + Unpin + Send>>;
    async fn finish_upload(&mut self) -> Result<()>;
    async fn terminate(&mut self) -> Result<()>;
    async fn declare_length(&mut self, length: u64) -> Result<()>;
    async fn concat_uploads(&mut self, partial_uploads: &[UploadSession]) -> Result<()>;
}

#[derive(Serialize)]
struct TransferClaims<'a> {
    exp: i64,
    aud: &'a str,
    iat: i64,
    target: String,
}

fn join_url(parts: &[&str]) -> String {
    let mut url = String::new();
    for (i, part) in parts.iter().enumerate() {
        url.push_str(part);
        if i + 1 != parts.len() && !part.ends_with('/') {
            url.push('/');
        }
    }
    url
}

/// Runtime handle over one session's `.info` record and binary file.
#[derive(Debug)]
pub struct UploadSession {
    store: SessionStore,
    metadata: SessionMetadata,
    finalized: bool,
}

impl UploadSession {
    pub(crate) fn from_metadata(store: SessionStore, metadata: SessionMetadata) -> Self {
        Self {
            store,
            metadata,
            finalized: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut SessionMetadata {
        &mut self.metadata
    }

    pub fn filename(&self) -> &str {
        &self.metadata.filename
    }

    pub fn space_id(&self) -> &str {
        &self.metadata.space_root
    }

    pub fn node_id(&self) -> &str {
        &self.metadata.node_id
    }

    pub fn node_exists(&self) -> bool {
        self.metadata.node_exists
    }

    pub fn size(&self) -> u64 {
        self.metadata.size
    }

    pub fn offset(&self) -> u64 {
        self.metadata.offset
    }

    pub fn size_diff(&self) -> i64 {
        self.metadata.size_diff
    }

    pub fn executant(&self) -> &Executant {
        &self.metadata.executant
    }

    pub fn mtime(&self) -> Option<DateTime<Utc>> {
        self.metadata.mtime
    }

    pub fn bin_path(&self) -> PathBuf {
        bin_path(self.store.uploads_dir(), self.id())
    }

    pub fn info_path(&self) -> PathBuf {
        info_path(self.store.uploads_dir(), self.id())
    }

    pub fn state(&self) -> SessionState {
        if self.finalized {
            return SessionState::Finalized;
        }
        match self.metadata.phase {
            SessionPhase::Aborted => SessionState::Aborted,
            SessionPhase::Processing => SessionState::Finishing,
            SessionPhase::Initiated if self.metadata.offset == 0 => SessionState::Created,
            SessionPhase::Initiated => SessionState::Receiving,
        }
    }

    pub(crate) fn set_state_aborted(&mut self) {
        self.metadata.phase = SessionPhase::Aborted;
    }

    /// True while the node waits on postprocessing for this session
    pub fn is_processing(&self) -> bool {
        self.metadata.phase == SessionPhase::Processing
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.metadata.expires.is_some_and(|e| e < now)
    }

    pub fn scan_data(&self) -> Option<(&str, DateTime<Utc>)> {
        match (&self.metadata.scan_result, self.metadata.scan_date) {
            (Some(result), Some(date)) => Some((result.as_str(), date)),
            _ => None,
        }
    }

    pub fn set_scan_data(&mut self, result: &str, date: DateTime<Utc>) {
        self.metadata.scan_result = Some(result.to_string());
        self.metadata.scan_date = Some(date);
    }

    pub fn reference(&self) -> ResourceId {
        ResourceId {
            storage_id: self.metadata.provider_id.clone(),
            space_id: self.metadata.space_root.clone(),
            opaque_id: self.metadata.node_id.clone(),
        }
    }

    /// The target node, if it exists
    pub fn node(&self) -> Result<Option<NodeRecord>> {
        if self.metadata.node_id.is_empty() {
            return Ok(None);
        }
        self.store.tree().read_node(self.space_id(), self.node_id())
    }

    /// Writes the `.info` record atomically under the session lock.
    pub async fn persist(&self) -> Result<()> {
        let data = self.metadata.encode()?;
        let _guard = self.store.locks().lock_session(self.id()).await;
        tokio::fs::create_dir_all(self.store.uploads_dir()).await?;
        write_atomic(&self.info_path(), &data).await?;
        Ok(())
    }

    /// Creates the empty binary file whose length tracks the offset.
    pub async fn touch_bin(&self) -> Result<()> {
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.bin_path())
            .await?;
        Ok(())
    }

    /// Signed download URL for the received bytes, used by postprocessing services.
    pub fn url(&self) -> Result<String> {
        let tokens = &self.store.options().tokens;
        let now = Utc::now();
        let ttl = i64::try_from(tokens.transfer_expires.as_secs()).unwrap_or(i64::MAX);
        let claims = TransferClaims {
            exp: now.timestamp().saturating_add(ttl),
            aud: TOKEN_AUDIENCE,
            iat: now.timestamp(),
            target: join_url(&[&tokens.download_endpoint, "tus/", self.id()]),
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(tokens.transfer_shared_secret.as_bytes()),
        )?;
        Ok(join_url(&[&tokens.data_gateway_endpoint, &token]))
    }

    /// Moves the received bytes into the blob store under the session's blob id.
    pub async fn finalize(&self) -> Result<()> {
        let mut target = NodeRecord::new_file(self.space_id(), self.node_id(), "", "");
        target.blob_id = self.metadata.blob_id.clone();
        target.blob_size = self.metadata.size;
        self.store
            .tree()
            .write_blob(&target, &self.bin_path())
            .await
            .map_err(|e| UploadError::Internal(format!("failed to upload file to blobstore: {e}")))
    }

    async fn publish_bytes_received(&self, node: &NodeRecord) -> Result<()> {
        let Some(publisher) = self.store.publisher() else {
            return Ok(());
        };
        publisher
            .publish(Event::BytesReceived {
                upload_id: self.id().to_string(),
                url: self.url()?,
                executing_user: Some(self.metadata.executant.clone()),
                resource_id: ResourceId {
                    storage_id: self.metadata.provider_id.clone(),
                    space_id: node.space_id.clone(),
                    opaque_id: node.id.clone(),
                },
                filename: self.metadata.filename.clone(),
                filesize: self.metadata.size,
                space_owner: self.metadata.space_owner.clone(),
            })
            .await?;
        Ok(())
    }

    fn ensure_receiving(&self) -> Result<()> {
        match self.state() {
            SessionState::Created | SessionState::Receiving => Ok(()),
            state => Err(UploadError::InvalidState(format!(
                "upload {} is {state:?}",
                self.id()
            ))),
        }
    }
}

#[async_trait]
impl Upload for UploadSession {
    async fn write_chunk(
        &mut self,
        offset: u64,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64> {
        self.ensure_receiving()?;
        if offset != self.metadata.offset {
            return Err(UploadError::BadRequest(format!(
                "offset mismatch: expected {} got {offset}",
                self.metadata.offset
            )));
        }

        let limit = if self.metadata.size_is_deferred {
            u64::MAX
        } else {
            self.metadata.size.saturating_sub(offset)
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.bin_path())
            .await?;
        let mut source = reader.take(limit);
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut written = 0u64;

        let outcome = loop {
            match source.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    if let Err(e) = file.write_all(&buf[..n]).await {
                        break Err(e);
                    }
                    written += n as u64;
                }
                // The client went away mid-request. It can resume from the new offset.
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        file.flush().await?;
        self.metadata.offset += written;

        tracing::debug!(
            upload_id = self.id(),
            offset = self.metadata.offset,
            written = written,
            "Wrote chunk"
        );
        outcome?;
        Ok(written)
    }

    async fn get_info(&self) -> Result<UploadInfo> {
        Ok(UploadInfo {
            id: self.metadata.id.clone(),
            filename: self.metadata.filename.clone(),
            space_id: self.metadata.space_root.clone(),
            node_id: self.metadata.node_id.clone(),
            size: self.metadata.size,
            size_is_deferred: self.metadata.size_is_deferred,
            offset: self.metadata.offset,
            expires: self.metadata.expires,
            is_partial: self.metadata.is_partial,
            is_final: self.metadata.is_final,
            partial_uploads: self.metadata.partial_uploads.clone(),
        })
    }

    async fn get_reader(&self) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        let file = tokio::fs::File::open(self.bin_path()).await?;
        Ok(Box::new(file))
    }

    async fn finish_upload(&mut self) -> Result<()> {
        self.ensure_receiving()?;
        if self.metadata.size_is_deferred {
            return Err(UploadError::BadRequest(
                "upload length has not been declared".to_string(),
            ));
        }
        if self.metadata.offset != self.metadata.size {
            return Err(UploadError::BadRequest(format!(
                "upload incomplete: {} of {} bytes",
                self.metadata.offset, self.metadata.size
            )));
        }

        let store = self.store.clone();
        let checksums = checksum::checksum_file(&self.bin_path()).await?;
        if let Some(declared) = self.metadata.checksum.clone() {
            if let Err(e) = checksum::verify(&declared, &checksums) {
                tracing::info!(upload_id = self.id(), error = %e, "Declared checksum rejected");
                store.cleanup(self, true, false, false).await;
                self.set_state_aborted();
                return Err(e);
            }
        }
        self.metadata.checksums = checksums;

        let node = store.create_node_for_upload(self).await?;

        let options = store.options();
        if options.async_uploads && self.metadata.size > 0 {
            if let Err(e) = self.publish_bytes_received(&node).await {
                tracing::error!(upload_id = self.id(), error = %e, "Could not hand upload to postprocessing");
                store.abandon_node(self).await;
                return Err(e);
            }
        }

        // Synchronous setups and empty files never see a postprocessing event
        if !options.async_uploads || self.metadata.size == 0 {
            if let Err(e) = self.finalize().await {
                tracing::error!(upload_id = self.id(), error = %e, "Failed to finalize upload");
                if let Err(revert) = store.release_size_diff(self).await {
                    tracing::error!(upload_id = self.id(), error = %revert, "Could not revert tree size change");
                }
                store.cleanup(self, true, false, false).await;
                self.set_state_aborted();
                return Err(e);
            }
            store.cleanup(self, false, false, true).await;
            self.finalized = true;
        }

        tracing::info!(
            upload_id = self.id(),
            space_id = node.space_id.as_str(),
            node_id = node.id.as_str(),
            size = self.metadata.size,
            "Upload finished"
        );
        Ok(())
    }

    async fn terminate(&mut self) -> Result<()> {
        let store = self.store.clone();
        store.cleanup(self, true, false, true).await;
        self.set_state_aborted();
        tracing::info!(upload_id = self.id(), "Upload terminated");
        Ok(())
    }

    async fn declare_length(&mut self, length: u64) -> Result<()> {
        if !self.metadata.size_is_deferred {
            return Err(UploadError::BadRequest(
                "upload length is already known".to_string(),
            ));
        }
        let max = self.store.options().max_upload_size;
        if max > 0 && length > max {
            return Err(UploadError::BadRequest(format!(
                "upload length {length} exceeds maximum of {max}"
            )));
        }
        if length < self.metadata.offset {
            return Err(UploadError::BadRequest(format!(
                "upload length {length} is smaller than the received {} bytes",
                self.metadata.offset
            )));
        }
        self.metadata.size = length;
        self.metadata.blob_size = length;
        self.metadata.size_is_deferred = false;
        self.persist().await
    }

    async fn concat_uploads(&mut self, partial_uploads: &[UploadSession]) -> Result<()> {
        self.ensure_receiving()?;
        if let Some(part) = partial_uploads.iter().find(|p| !p.metadata.is_partial) {
            return Err(UploadError::BadRequest(format!(
                "upload {} was not initiated as partial",
                part.id()
            )));
        }
        let joined = partial_uploads
            .iter()
            .fold(self.metadata.offset, |acc, p| acc.saturating_add(p.offset()));
        if !self.metadata.size_is_deferred && joined > self.metadata.size {
            return Err(UploadError::BadRequest(format!(
                "concatenated length {joined} exceeds declared size {}",
                self.metadata.size
            )));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.bin_path())
            .await?;

        for partial in partial_uploads {
            let mut source = tokio::fs::File::open(partial.bin_path()).await?;
            let copied = tokio::io::copy(&mut source, &mut file).await?;
            self.metadata.offset += copied;
        }
        file.flush().await?;

        self.metadata.is_final = true;
        self.metadata.partial_uploads = partial_uploads.iter().map(|p| p.id().to_string()).collect();
        if self.metadata.size_is_deferred {
            self.metadata.size = self.metadata.offset;
            self.metadata.blob_size = self.metadata.offset;
            self.metadata.size_is_deferred = false;
        }
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url(&["http://gw", "tok"]), "http://gw/tok");
        assert_eq!(join_url(&["http://gw/", "tok"]), "http://gw/tok");
        assert_eq!(
            join_url(&["http://dl/data", "tus/", "abc"]),
            "http://dl/data/tus/abc"
        );
    }
}
