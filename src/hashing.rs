//! Whole-image digests in a single pass
//!
//! The image is streamed once through a 1 MiB buffer and every chunk feeds
//! MD5, SHA-1 and SHA-256 together. Digests recorded inside segmented
//! containers are attached for cross-validation when present.

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::common::hash::{compare_hashes, HashMatchResult, MultiDigest, MultiHasher};
use crate::config::DEFAULT_READ_BUFFER_SIZE;
use crate::container::ImageContainer;
use crate::error::ContainerResult;

#[derive(Debug, Clone, Serialize)]
pub struct ImageDigests {
    pub path: String,
    pub size: u64,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub stored_md5: Option<String>,
    pub stored_sha1: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerificationStatus {
    Verified,
    Mismatch,
    /// The container carries no digest for this algorithm
    NoReference,
}

#[derive(Debug, Clone, Serialize)]
pub struct DigestCheck {
    pub algorithm: &'static str,
    pub computed: String,
    pub stored: Option<String>,
    pub status: VerificationStatus,
}

impl ImageDigests {
    /// Compare computed MD5/SHA-1 against the container's stored values
    pub fn verification(&self) -> Vec<DigestCheck> {
        [
            ("MD5", &self.md5, &self.stored_md5),
            ("SHA1", &self.sha1, &self.stored_sha1),
        ]
        .into_iter()
        .map(|(algorithm, computed, stored)| {
            let status = match stored {
                None => VerificationStatus::NoReference,
                Some(s) => match compare_hashes(computed, s) {
                    HashMatchResult::Exact | HashMatchResult::CaseInsensitive => VerificationStatus::Verified,
                    HashMatchResult::Mismatch | HashMatchResult::Invalid => VerificationStatus::Mismatch,
                },
            };
            DigestCheck {
                algorithm,
                computed: computed.clone(),
                stored: stored.clone(),
                status,
            }
        })
        .collect()
    }

    /// True when at least one stored digest exists and none disagrees
    pub fn is_verified(&self) -> bool {
        let checks = self.verification();
        checks.iter().any(|c| c.status == VerificationStatus::Verified)
            && checks.iter().all(|c| c.status != VerificationStatus::Mismatch)
    }
}

/// Digest the whole image
pub fn compute(image: &mut ImageContainer) -> ContainerResult<ImageDigests> {
    compute_with_progress(image, DEFAULT_READ_BUFFER_SIZE, |_, _| {})
}

/// Digest the whole image, reporting (bytes_done, total) after every chunk
#[instrument(skip(image, progress), fields(path = %image.path().display()))]
pub fn compute_with_progress<F>(
    image: &mut ImageContainer,
    buffer_size: usize,
    mut progress: F,
) -> ContainerResult<ImageDigests>
where
    F: FnMut(u64, u64),
{
    let total = image.size();
    let buffer_size = buffer_size.max(512);
    let mut buffer = vec![0u8; buffer_size];
    let mut hasher = MultiHasher::new();
    let mut offset = 0u64;

    debug!(total, buffer_size, "Starting image hash");
    while offset < total {
        let n = image.read_at(offset, &mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        offset += n as u64;
        progress(offset, total);
    }

    let MultiDigest { md5, sha1, sha256 } = hasher.finalize();
    info!(bytes = offset, %md5, "Image hash complete");

    Ok(ImageDigests {
        path: image.path().to_string_lossy().to_string(),
        size: offset,
        md5,
        sha1,
        sha256,
        stored_md5: image.stored_hash("MD5"),
        stored_sha1: image.stored_hash("SHA1"),
    })
}

/// Digest an in-memory buffer with the same three algorithms
pub fn digest_bytes(data: &[u8]) -> MultiDigest {
    let mut hasher = MultiHasher::new();
    hasher.update(data);
    hasher.finalize()
}
