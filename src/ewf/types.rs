//! Type definitions for EWF container parsing

use serde::Serialize;

// =============================================================================
// Core Constants
// =============================================================================

pub(crate) const EWF_SIGNATURE: &[u8; 8] = b"EVF\x09\x0d\x0a\xff\x00";
pub(crate) const LVF_SIGNATURE: &[u8; 8] = b"LVF\x09\x0d\x0a\xff\x00";
pub(crate) const EWF2_SIGNATURE: &[u8; 8] = b"EVF2\x0d\x0a\x81\x00";
pub(crate) const LEF2_SIGNATURE: &[u8; 8] = b"LEF2\x0d\x0a\x81\x00";

/// Signature + fields_start + segment number + fields_end
pub(crate) const FILE_HEADER_SIZE: u64 = 13;
pub(crate) const SECTION_DESCRIPTOR_SIZE: u64 = 76;
pub(crate) const TABLE_HEADER_SIZE: u64 = 24;

/// High bit of a table entry marks a zlib-compressed chunk
pub(crate) const COMPRESSED_CHUNK_FLAG: u32 = 0x8000_0000;

pub(crate) const MAX_OPEN_FILES: usize = 16;
pub(crate) const CHUNK_CACHE_ENTRIES: usize = 64;
pub(crate) const MAX_SECTIONS_PER_SEGMENT: u32 = 10_000;

// =============================================================================
// Stored Hash Types - Digests embedded in hash/digest sections
// =============================================================================

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct StoredImageHash {
    /// "MD5" or "SHA1"
    pub algorithm: String,
    pub hash: String,
    /// Section the digest came from
    pub source: String,
}

// =============================================================================
// Section Structures
// =============================================================================

#[derive(Clone, Debug)]
pub(crate) struct SectionDescriptor {
    pub section_type: String,
    /// Segment-relative offset of the following section
    pub next_offset: u64,
    /// Section size including this descriptor
    pub size: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct VolumeSection {
    pub media_type: u8,
    pub chunk_count: u32,
    pub sectors_per_chunk: u32,
    pub bytes_per_sector: u32,
    pub sector_count: u64,
}

impl VolumeSection {
    pub fn chunk_size(&self) -> u64 {
        self.sectors_per_chunk as u64 * self.bytes_per_sector as u64
    }

    pub fn media_size(&self) -> u64 {
        self.sector_count * self.bytes_per_sector as u64
    }
}

// =============================================================================
// Chunk Location - Maps a chunk to its stored bytes
// =============================================================================

#[derive(Clone, Debug)]
pub(crate) struct ChunkLocation {
    pub segment_index: usize,
    /// Segment-relative offset of the stored chunk
    pub offset: u64,
    /// Stored size (compressed size, or data + checksum)
    pub stored_size: u64,
    pub compressed: bool,
}

// =============================================================================
// Public API Types
// =============================================================================

#[derive(Serialize, Clone, Debug)]
pub struct EwfInfo {
    pub segment_count: usize,
    pub segment_files: Vec<String>,
    pub chunk_count: u32,
    pub sectors_per_chunk: u32,
    pub bytes_per_sector: u32,
    pub sector_count: u64,
    pub media_size: u64,
    pub stored_hashes: Vec<StoredImageHash>,
}
