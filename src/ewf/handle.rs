//! EwfHandle - random access to the media stored in an EWF segment series

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use flate2::read::ZlibDecoder;
use tracing::{debug, trace, warn};

use crate::common::{
    FileIoPool,
    binary::{bytes_to_string, le_u32, le_u64, read_bytes_at},
    segments::discover_ewf_segments,
};

use super::cache::ChunkCache;
use super::types::*;

pub struct EwfHandle {
    /// File I/O pool managing all segment files
    file_pool: FileIoPool,
    /// Volume information from the first volume/disk section
    volume: VolumeSection,
    /// Chunk index -> stored location
    chunk_table: Vec<ChunkLocation>,
    chunk_cache: ChunkCache,
    /// Digests recorded by the acquisition tool
    stored_hashes: Vec<StoredImageHash>,
}

impl EwfHandle {
    /// Resolve the segment series for `path` and index every chunk
    pub fn open(path: &Path) -> Result<Self, String> {
        let segment_paths = discover_ewf_segments(path)?;
        let mut file_pool = FileIoPool::open(segment_paths, MAX_OPEN_FILES)?;

        let mut volume: Option<VolumeSection> = None;
        let mut chunk_table = Vec::new();
        let mut stored_hashes = Vec::new();

        for segment_index in 0..file_pool.get_file_count() {
            Self::check_signature(&mut file_pool, segment_index)?;
            Self::parse_segment(
                &mut file_pool,
                segment_index,
                &mut volume,
                &mut chunk_table,
                &mut stored_hashes,
            )?;
        }

        let volume = volume.ok_or("No volume section found")?;
        if volume.chunk_size() == 0 {
            return Err("Volume section declares a zero chunk size".to_string());
        }

        debug!(
            segments = file_pool.get_file_count(),
            chunks = chunk_table.len(),
            media_size = volume.media_size(),
            "EWF container indexed"
        );

        Ok(Self {
            file_pool,
            volume,
            chunk_table,
            chunk_cache: ChunkCache::new(CHUNK_CACHE_ENTRIES),
            stored_hashes,
        })
    }

    fn check_signature(file_pool: &mut FileIoPool, segment_index: usize) -> Result<(), String> {
        let mut sig = [0u8; 8];
        let n = file_pool.read_at(segment_index, 0, &mut sig)?;
        if n < sig.len() {
            return Err(format!("Segment {} is too small for an EWF header", segment_index + 1));
        }
        if &sig == EWF2_SIGNATURE || &sig == LEF2_SIGNATURE {
            return Err("EWF version 2 containers are not supported".to_string());
        }
        if &sig != EWF_SIGNATURE && &sig != LVF_SIGNATURE {
            return Err(format!("Segment {} has no EWF signature", segment_index + 1));
        }
        Ok(())
    }

    /// Walk one segment's section chain
    fn parse_segment(
        file_pool: &mut FileIoPool,
        segment_index: usize,
        volume: &mut Option<VolumeSection>,
        chunk_table: &mut Vec<ChunkLocation>,
        stored_hashes: &mut Vec<StoredImageHash>,
    ) -> Result<(), String> {
        let segment_size = file_pool.file_sizes()[segment_index];
        let mut offset = FILE_HEADER_SIZE;
        let mut sectors_end: Option<u64> = None;

        for _ in 0..MAX_SECTIONS_PER_SEGMENT {
            if offset + SECTION_DESCRIPTOR_SIZE > segment_size {
                trace!(segment_index, offset, "Section chain runs past end of segment");
                break;
            }

            let file = file_pool.get_file(segment_index)?;
            let desc = Self::read_section_descriptor(file, offset)?;
            let data_offset = offset + SECTION_DESCRIPTOR_SIZE;
            trace!(segment_index, offset, section = %desc.section_type, size = desc.size, "Section");

            match desc.section_type.as_str() {
                "volume" | "disk" => {
                    if volume.is_none() {
                        *volume = Some(Self::read_volume_section(file, data_offset)?);
                    }
                }
                "sectors" => {
                    sectors_end = Some(offset.saturating_add(desc.size.max(SECTION_DESCRIPTOR_SIZE)));
                }
                "table" => {
                    match Self::read_table_section(file, data_offset, segment_index, sectors_end) {
                        Ok(locations) => {
                            trace!(entries = locations.len(), "Table section");
                            chunk_table.extend(locations);
                        }
                        Err(e) => warn!(segment_index, "Unreadable table section: {}", e),
                    }
                }
                "hash" => {
                    stored_hashes.extend(Self::read_hash_section(file, data_offset));
                }
                "digest" => {
                    stored_hashes.extend(Self::read_digest_section(file, data_offset));
                }
                "next" | "done" => break,
                _ => {}
            }

            if desc.next_offset <= offset {
                break;
            }
            offset = desc.next_offset;
        }
        Ok(())
    }

    // =========================================================================
    // Section Readers
    // =========================================================================

    fn read_section_descriptor<R: Read + Seek>(file: &mut R, offset: u64) -> Result<SectionDescriptor, String> {
        let raw = read_bytes_at(file, offset, SECTION_DESCRIPTOR_SIZE as usize)?;
        Ok(SectionDescriptor {
            section_type: bytes_to_string(&raw[..16]),
            next_offset: le_u64(&raw, 16),
            size: le_u64(&raw, 24),
        })
    }

    fn read_volume_section<R: Read + Seek>(file: &mut R, offset: u64) -> Result<VolumeSection, String> {
        let raw = read_bytes_at(file, offset, 24)?;
        let volume = VolumeSection {
            media_type: raw[0],
            chunk_count: le_u32(&raw, 4),
            sectors_per_chunk: le_u32(&raw, 8),
            bytes_per_sector: le_u32(&raw, 12),
            sector_count: le_u64(&raw, 16),
        };
        trace!(?volume, "Volume section");
        Ok(volume)
    }

    /// Read a table section into chunk locations
    ///
    /// Entry offsets are relative to the table's base offset; the stored size
    /// of each chunk runs to the next entry, and the last one to the end of
    /// the preceding sectors section.
    fn read_table_section<R: Read + Seek>(
        file: &mut R,
        offset: u64,
        segment_index: usize,
        sectors_end: Option<u64>,
    ) -> Result<Vec<ChunkLocation>, String> {
        let header = read_bytes_at(file, offset, TABLE_HEADER_SIZE as usize)?;
        let entry_count = le_u32(&header, 0) as usize;
        let base_offset = le_u64(&header, 8);

        let raw = read_bytes_at(file, offset + TABLE_HEADER_SIZE, entry_count * 4)?;
        let entries: Vec<(u64, bool)> = raw
            .chunks_exact(4)
            .map(|c| {
                let value = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                (
                    base_offset + (value & !COMPRESSED_CHUNK_FLAG) as u64,
                    value & COMPRESSED_CHUNK_FLAG != 0,
                )
            })
            .collect();

        let mut locations = Vec::with_capacity(entries.len());
        for (i, &(chunk_offset, compressed)) in entries.iter().enumerate() {
            let end = match entries.get(i + 1) {
                Some(&(next, _)) => next,
                None => sectors_end.unwrap_or(chunk_offset),
            };
            locations.push(ChunkLocation {
                segment_index,
                offset: chunk_offset,
                stored_size: end.saturating_sub(chunk_offset),
                compressed,
            });
        }
        Ok(locations)
    }

    fn read_hash_section<R: Read + Seek>(file: &mut R, offset: u64) -> Vec<StoredImageHash> {
        match read_bytes_at(file, offset, 16) {
            Ok(md5) => non_zero_digest("MD5", &md5, "hash").into_iter().collect(),
            Err(e) => {
                trace!("Unreadable hash section: {}", e);
                Vec::new()
            }
        }
    }

    fn read_digest_section<R: Read + Seek>(file: &mut R, offset: u64) -> Vec<StoredImageHash> {
        match read_bytes_at(file, offset, 36) {
            Ok(raw) => non_zero_digest("MD5", &raw[..16], "digest")
                .into_iter()
                .chain(non_zero_digest("SHA1", &raw[16..36], "digest"))
                .collect(),
            Err(e) => {
                trace!("Unreadable digest section: {}", e);
                Vec::new()
            }
        }
    }

    // =========================================================================
    // Chunk Access
    // =========================================================================

    /// Expected decompressed length of chunk `chunk_index`
    fn chunk_length(&self, chunk_index: usize) -> u64 {
        let chunk_size = self.volume.chunk_size();
        let start = chunk_index as u64 * chunk_size;
        self.volume.media_size().saturating_sub(start).min(chunk_size)
    }

    /// Read one chunk, decompressing when needed
    pub fn read_chunk(&mut self, chunk_index: usize) -> Result<Arc<Vec<u8>>, String> {
        if let Some(cached) = self.chunk_cache.get(chunk_index) {
            return Ok(cached);
        }

        let expected_len = self.chunk_length(chunk_index) as usize;
        let location = match self.chunk_table.get(chunk_index) {
            Some(loc) => loc.clone(),
            None => {
                // Chunks absent from every table read as zeroes
                trace!(chunk_index, "Chunk not present in any table");
                return Ok(Arc::new(vec![0u8; expected_len]));
            }
        };

        let file = self.file_pool.get_file(location.segment_index)?;
        file.seek(SeekFrom::Start(location.offset))
            .map_err(|e| format!("Seek to chunk {} at offset {} failed: {}", chunk_index, location.offset, e))?;

        let mut chunk_data = if location.compressed {
            let limit = if location.stored_size > 0 {
                location.stored_size
            } else {
                self.volume.chunk_size() * 2
            };
            let mut decoder = ZlibDecoder::new(file.take(limit));
            let mut decompressed = Vec::with_capacity(expected_len);
            decoder.read_to_end(&mut decompressed)
                .map_err(|e| format!("Chunk {} decompression failed at offset {}: {}", chunk_index, location.offset, e))?;
            decompressed
        } else {
            let mut raw = Vec::with_capacity(expected_len);
            file.take(expected_len as u64)
                .read_to_end(&mut raw)
                .map_err(|e| format!("Read uncompressed chunk {} failed: {}", chunk_index, e))?;
            raw
        };

        chunk_data.resize(expected_len, 0);
        let chunk_data = Arc::new(chunk_data);
        self.chunk_cache.insert(chunk_index, Arc::clone(&chunk_data));
        Ok(chunk_data)
    }

    /// Read up to `buf.len()` media bytes at `offset`; short only at end of media
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, String> {
        let media_size = self.volume.media_size();
        if offset >= media_size {
            return Ok(0);
        }

        let chunk_size = self.volume.chunk_size();
        let wanted = buf.len().min((media_size - offset) as usize);
        let mut filled = 0usize;

        while filled < wanted {
            let position = offset + filled as u64;
            let chunk_index = (position / chunk_size) as usize;
            let within = (position % chunk_size) as usize;

            let chunk = self.read_chunk(chunk_index)?;
            if within >= chunk.len() {
                break;
            }
            let n = (chunk.len() - within).min(wanted - filled);
            buf[filled..filled + n].copy_from_slice(&chunk[within..within + n]);
            filled += n;
        }

        Ok(filled)
    }

    pub fn media_size(&self) -> u64 {
        self.volume.media_size()
    }

    pub fn volume(&self) -> &VolumeSection {
        &self.volume
    }

    pub fn stored_hashes(&self) -> &[StoredImageHash] {
        &self.stored_hashes
    }

    /// Stored digest for `algorithm` ("MD5" or "SHA1"), if the container has one
    pub fn stored_hash(&self, algorithm: &str) -> Option<&str> {
        self.stored_hashes
            .iter()
            .find(|h| h.algorithm.eq_ignore_ascii_case(algorithm))
            .map(|h| h.hash.as_str())
    }

    pub fn segment_paths(&self) -> &[PathBuf] {
        self.file_pool.get_paths()
    }

    pub fn info(&self) -> EwfInfo {
        EwfInfo {
            segment_count: self.file_pool.get_file_count(),
            segment_files: self
                .segment_paths()
                .iter()
                .filter_map(|p| p.file_name())
                .map(|f| f.to_string_lossy().to_string())
                .collect(),
            chunk_count: self.volume.chunk_count,
            sectors_per_chunk: self.volume.sectors_per_chunk,
            bytes_per_sector: self.volume.bytes_per_sector,
            sector_count: self.volume.sector_count,
            media_size: self.volume.media_size(),
            stored_hashes: self.stored_hashes.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn cache_stats(&self) -> (u64, u64) {
        self.chunk_cache.stats()
    }
}

fn non_zero_digest(algorithm: &str, bytes: &[u8], source: &str) -> Option<StoredImageHash> {
    if bytes.iter().all(|&b| b == 0) {
        return None;
    }
    Some(StoredImageHash {
        algorithm: algorithm.to_string(),
        hash: hex::encode(bytes),
        source: source.to_string(),
    })
}
