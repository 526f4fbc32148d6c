//! File content, registry hive and unallocated-range reads
//!
//! Nothing here returns an error. Unreadable inodes, empty files and I/O
//! failures all come back as `None`.

use tracing::{debug, trace};

use crate::common::SECTOR_SIZE;
use crate::container::lock_image;
use crate::fs::{FileMeta, FileSystem};
use crate::session::EvidenceSession;

/// Whole content of `inode`: one read up to `threshold`, `chunk`-sized reads above it
pub(crate) fn read_content(
    fs: &mut dyn FileSystem,
    inode: u64,
    size: u64,
    threshold: u64,
    chunk: u64,
) -> Option<Vec<u8>> {
    if size <= threshold {
        return match fs.read_at(inode, 0, size as usize) {
            Ok(data) => Some(data),
            Err(e) => {
                debug!(inode, error = %e, "Content read failed");
                None
            }
        };
    }

    let mut data = Vec::with_capacity(size.min(chunk) as usize);
    let mut offset = 0u64;
    while offset < size {
        let want = chunk.min(size - offset) as usize;
        match fs.read_at(inode, offset, want) {
            Ok(part) if part.is_empty() => {
                debug!(inode, offset, size, "Short content, stopping at empty chunk");
                break;
            }
            Ok(part) => {
                offset += part.len() as u64;
                data.extend_from_slice(&part);
            }
            Err(e) => {
                debug!(inode, offset, error = %e, "Chunked content read failed");
                return None;
            }
        }
    }
    trace!(inode, bytes = data.len(), "Chunked read complete");
    Some(data)
}

impl EvidenceSession {
    /// Metadata of one inode, cached until `clear_cache`
    pub fn file_meta(&mut self, fs_offset: u64, inode: u64) -> Option<FileMeta> {
        if let Some(meta) = self.meta_cache.get(&(fs_offset, inode)) {
            return Some(meta.clone());
        }
        let fs = self.filesystem(fs_offset)?;
        match fs.stat(inode) {
            Ok(meta) => {
                self.meta_cache.insert((fs_offset, inode), meta.clone());
                Some(meta)
            }
            Err(e) => {
                debug!(fs_offset, inode, error = %e, "Stat failed");
                None
            }
        }
    }

    /// Content and metadata of a file; `None` for empty files and any failure
    pub fn read_file(&mut self, fs_offset: u64, inode: u64) -> Option<(Vec<u8>, FileMeta)> {
        let meta = self.file_meta(fs_offset, inode)?;
        if meta.size == 0 || meta.is_dir() {
            return None;
        }
        let (threshold, chunk) = (self.config().large_file_threshold, self.config().chunk_size);
        let fs = self.filesystem(fs_offset)?;
        read_content(&mut **fs, inode, meta.size, threshold, chunk).map(|data| (data, meta))
    }

    /// Raw bytes of a hive (or any file) addressed by path
    pub fn read_hive(&mut self, fs_offset: u64, path: &str) -> Option<Vec<u8>> {
        let (threshold, chunk) = (self.config().large_file_threshold, self.config().chunk_size);
        let fs = self.filesystem(fs_offset)?;
        let meta = match fs.lookup(path) {
            Ok(meta) => meta,
            Err(e) => {
                debug!(fs_offset, path, error = %e, "Hive not found");
                return None;
            }
        };
        if meta.size == 0 || meta.is_dir() {
            return None;
        }
        read_content(&mut **fs, meta.inode, meta.size, threshold, chunk)
    }

    /// Bytes of an absolute sector range; at least one sector is requested
    pub fn read_unallocated(&mut self, start_sector: u64, end_sector: u64) -> Option<Vec<u8>> {
        let range = start_sector.checked_mul(SECTOR_SIZE).and_then(|start| {
            let end = end_sector.checked_mul(SECTOR_SIZE)?.max(start.checked_add(SECTOR_SIZE - 1)?);
            Some((start, end - start + 1))
        });
        let Some((start, size)) = range else {
            debug!(start_sector, end_sector, "Sector range beyond addressable bytes");
            return None;
        };

        let data = match lock_image(self.image()) {
            Ok(mut image) => image.read(start, size),
            Err(e) => {
                debug!(error = %e, "Image unavailable for unallocated read");
                return None;
            }
        };
        match data {
            Ok(data) if !data.is_empty() => Some(data),
            Ok(_) => None,
            Err(e) => {
                debug!(start_sector, end_sector, error = %e, "Unallocated read failed");
                None
            }
        }
    }
}
