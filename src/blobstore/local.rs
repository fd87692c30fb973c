use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

use super::{BlobRef, Blobstore, BlobstoreError};

/// Splits the first `depth` groups of `width` characters of an id into path segments,
/// e.g. `pathify("abcdef1234", 4, 2)` is `ab/cd/ef/12/34`.
pub fn pathify(id: &str, depth: usize, width: usize) -> PathBuf {
    let mut path = PathBuf::new();
    let mut rest = id;
    for _ in 0..depth {
        if rest.len() <= width || !rest.is_char_boundary(width) {
            break;
        }
        let (head, tail) = rest.split_at(width);
        path.push(head);
        rest = tail;
    }
    path.push(rest);
    path
}

/// Local filesystem blob store, sharded by blob id.
#[derive(Debug)]
pub struct LocalBlobstore {
    base_path: PathBuf,
}

impl LocalBlobstore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn blob_path(&self, blob: &BlobRef) -> Result<PathBuf, BlobstoreError> {
        if blob.blob_id.is_empty() || blob.space_id.is_empty() {
            return Err(BlobstoreError::Backend(
                "blob ref with empty space or blob id".to_string(),
            ));
        }
        Ok(self
            .base_path
            .join("spaces")
            .join(pathify(&blob.space_id, 1, 2))
            .join("blobs")
            .join(pathify(&blob.blob_id, 4, 2)))
    }
}

#[async_trait]
impl Blobstore for LocalBlobstore {
    async fn upload(&self, blob: &BlobRef, source: &Path) -> Result<(), BlobstoreError> {
        let path = self.blob_path(blob)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        // Copy next to the target and rename so readers never see a partial blob
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::copy(source, &tmp).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn download(&self, blob: &BlobRef) -> Result<Bytes, BlobstoreError> {
        let path = self.blob_path(blob)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobstoreError::NotFound(blob.blob_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, blob: &BlobRef) -> Result<(), BlobstoreError> {
        let path = self.blob_path(blob)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, blob: &BlobRef) -> Result<bool, BlobstoreError> {
        let path = self.blob_path(blob)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}
