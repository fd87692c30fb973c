use std::path::Path;

use adler2::Adler32;
use md5::{Digest, Md5};
use ring::digest;
use tokio::io::AsyncReadExt;

use crate::error::{Result, UploadError};
use crate::storage::models::Checksums;

const READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha1,
    Md5,
    Adler32,
}

impl ChecksumAlgorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha1" => Some(Self::Sha1),
            "md5" => Some(Self::Md5),
            "adler32" => Some(Self::Adler32),
            _ => None,
        }
    }

    fn select(self, checksums: &Checksums) -> &[u8] {
        match self {
            Self::Sha1 => &checksums.sha1,
            Self::Md5 => &checksums.md5,
            Self::Adler32 => &checksums.adler32,
        }
    }
}

/// Feeds every chunk to SHA-1, MD5 and Adler-32 at once.
pub struct MultiHasher {
    sha1: digest::Context,
    md5: Md5,
    adler32: Adler32,
}

impl Default for MultiHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiHasher {
    pub fn new() -> Self {
        Self {
            sha1: digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY),
            md5: Md5::new(),
            adler32: Adler32::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.sha1.update(data);
        self.md5.update(data);
        self.adler32.write_slice(data);
    }

    pub fn finish(self) -> Checksums {
        Checksums {
            sha1: self.sha1.finish().as_ref().to_vec(),
            md5: self.md5.finalize().to_vec(),
            adler32: self.adler32.checksum().to_be_bytes().to_vec(),
        }
    }
}

/// Hashes a file in a single read pass.
pub async fn checksum_file(path: &Path) -> Result<Checksums> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = MultiHasher::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

/// Parses a declared `"<algorithm> <hex>"` checksum.
pub fn parse_declared(declared: &str) -> Result<(ChecksumAlgorithm, &str)> {
    let Some((algorithm, value)) = declared.trim().split_once(' ') else {
        return Err(UploadError::BadRequest(
            "invalid checksum format. must be '[algorithm] [checksum]'".to_string(),
        ));
    };
    let algorithm = ChecksumAlgorithm::parse(algorithm).ok_or_else(|| {
        UploadError::BadRequest(format!("unsupported checksum algorithm: {algorithm}"))
    })?;
    Ok((algorithm, value.trim()))
}

/// Compares a declared checksum against the computed set.
pub fn verify(declared: &str, computed: &Checksums) -> Result<()> {
    let (algorithm, expected) = parse_declared(declared)?;
    let actual = hex::encode(algorithm.select(computed));
    if !expected.eq_ignore_ascii_case(&actual) {
        return Err(UploadError::ChecksumMismatch(format!(
            "invalid checksum: expected {expected} got {actual}"
        )));
    }
    Ok(())
}
