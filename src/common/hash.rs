// Shared hash utilities for evidence verification
//
// MD5, SHA-1 and SHA-256 are the digests acquisition tools record; the
// multi-hasher feeds all three from a single pass over the image.

use md5::Md5;
use sha1::{Sha1, Digest};
use sha2::Sha256;
use serde::Serialize;

/// Chunks at least this large are fed to the three digests in parallel
const PARALLEL_UPDATE_THRESHOLD: usize = 64 * 1024;

// =============================================================================
// Multi Hasher - MD5 + SHA-1 + SHA-256 in one pass
// =============================================================================

/// Hex digests produced by [`MultiHasher::finalize`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultiDigest {
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
}

pub struct MultiHasher {
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
}

impl Default for MultiHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiHasher {
    pub fn new() -> Self {
        Self {
            md5: Md5::new(),
            sha1: Sha1::new(),
            sha256: Sha256::new(),
        }
    }

    /// Feed one chunk to all three digests
    pub fn update(&mut self, data: &[u8]) {
        if data.len() < PARALLEL_UPDATE_THRESHOLD {
            Digest::update(&mut self.md5, data);
            Digest::update(&mut self.sha1, data);
            Digest::update(&mut self.sha256, data);
            return;
        }

        let Self { md5, sha1, sha256 } = self;
        rayon::join(
            || Digest::update(md5, data),
            || {
                rayon::join(
                    || Digest::update(sha1, data),
                    || Digest::update(sha256, data),
                )
            },
        );
    }

    pub fn finalize(self) -> MultiDigest {
        MultiDigest {
            md5: hex::encode(self.md5.finalize()),
            sha1: hex::encode(self.sha1.finalize()),
            sha256: hex::encode(self.sha256.finalize()),
        }
    }
}

// =============================================================================
// Hash Comparison
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HashMatchResult {
    /// Exact match (same case)
    Exact,
    /// Match but different case (e.g., "abc" vs "ABC")
    CaseInsensitive,
    /// Hashes do not match
    Mismatch,
    /// One or both hashes are invalid format
    Invalid,
}

/// Compare two hash strings with detailed result
pub fn compare_hashes(computed: &str, expected: &str) -> HashMatchResult {
    let computed = computed.trim();
    let expected = expected.trim();

    if computed.is_empty()
        || expected.is_empty()
        || !computed.chars().all(|c| c.is_ascii_hexdigit())
        || !expected.chars().all(|c| c.is_ascii_hexdigit())
    {
        return HashMatchResult::Invalid;
    }

    if computed.len() != expected.len() {
        return HashMatchResult::Mismatch;
    }

    if computed == expected {
        return HashMatchResult::Exact;
    }

    if computed.eq_ignore_ascii_case(expected) {
        return HashMatchResult::CaseInsensitive;
    }

    HashMatchResult::Mismatch
}
