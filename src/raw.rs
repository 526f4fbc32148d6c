// Linear disk image reader (.dd, .raw, .img, .iso, .001/.002 ..., etc.)
// A numbered segment set is presented as one contiguous address space.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::common::{discover_numbered_segments, FileIoPool};
use crate::common::io_pool::DEFAULT_MAX_OPEN_FILES;

#[derive(Serialize, Clone, Debug)]
pub struct RawInfo {
    pub segment_count: usize,
    pub total_size: u64,
    pub segment_sizes: Vec<u64>,
    pub segment_files: Vec<String>,
}

pub struct RawHandle {
    pool: FileIoPool,
    /// Start offset of each segment in the linear address space
    segment_starts: Vec<u64>,
    total_size: u64,
}

impl RawHandle {
    /// Open a raw image (single file or numbered segment set)
    pub fn open(path: &Path) -> Result<Self, String> {
        if !path.is_file() {
            return Err(format!("File not found: {}", path.display()));
        }

        let (segments, segment_sizes) = discover_numbered_segments(path)?;
        let mut segment_starts = Vec::with_capacity(segment_sizes.len());
        let mut total_size = 0u64;
        for size in &segment_sizes {
            segment_starts.push(total_size);
            total_size += size;
        }

        let pool = FileIoPool::open(segments, DEFAULT_MAX_OPEN_FILES)?;
        debug!(segments = segment_starts.len(), total_size, "Opened linear image");

        Ok(RawHandle {
            pool,
            segment_starts,
            total_size,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn segment_paths(&self) -> &[PathBuf] {
        self.pool.get_paths()
    }

    /// Read up to `buf.len()` bytes at `offset`; short only at end of image
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, String> {
        if offset >= self.total_size {
            return Ok(0);
        }

        let wanted = buf.len().min((self.total_size - offset) as usize);
        let mut filled = 0usize;

        while filled < wanted {
            let position = offset + filled as u64;
            let (seg_idx, seg_offset) = self.position_to_segment(position);
            let seg_remaining = self.pool.file_sizes()[seg_idx] - seg_offset;
            let to_read = (wanted - filled).min(seg_remaining as usize);

            let n = self.pool.read_at(seg_idx, seg_offset, &mut buf[filled..filled + to_read])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        Ok(filled)
    }

    /// Convert absolute position to (segment_index, offset_within_segment)
    fn position_to_segment(&self, pos: u64) -> (usize, u64) {
        let idx = match self.segment_starts.binary_search(&pos) {
            Ok(exact) => {
                // Zero-length segments share a start; take the last one
                let mut i = exact;
                while i + 1 < self.segment_starts.len() && self.segment_starts[i + 1] == pos {
                    i += 1;
                }
                i
            }
            Err(insert) => insert.saturating_sub(1),
        };
        (idx, pos - self.segment_starts[idx])
    }

    pub fn info(&self) -> RawInfo {
        RawInfo {
            segment_count: self.segment_starts.len(),
            total_size: self.total_size,
            segment_sizes: self.pool.file_sizes().to_vec(),
            segment_files: self
                .segment_paths()
                .iter()
                .filter_map(|p| p.file_name())
                .map(|f| f.to_string_lossy().to_string())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::patterned_bytes;
    use tempfile::TempDir;

    #[test]
    fn test_single_file() {
        let dir = TempDir::new().unwrap();
        let data = patterned_bytes(1000);
        let path = dir.path().join("disk.dd");
        std::fs::write(&path, &data).unwrap();

        let mut handle = RawHandle::open(&path).unwrap();
        assert_eq!(handle.total_size(), 1000);

        let mut buf = [0u8; 100];
        assert_eq!(handle.read_at(950, &mut buf).unwrap(), 50);
        assert_eq!(&buf[..50], &data[950..]);
    }

    #[test]
    fn test_numbered_segments_read_across_boundary() {
        let dir = TempDir::new().unwrap();
        let data = patterned_bytes(3000);
        std::fs::write(dir.path().join("disk.001"), &data[..1000]).unwrap();
        std::fs::write(dir.path().join("disk.002"), &data[1000..2500]).unwrap();
        std::fs::write(dir.path().join("disk.003"), &data[2500..]).unwrap();

        let mut handle = RawHandle::open(&dir.path().join("disk.001")).unwrap();
        assert_eq!(handle.total_size(), 3000);
        assert_eq!(handle.info().segment_count, 3);

        let mut buf = vec![0u8; 2000];
        assert_eq!(handle.read_at(900, &mut buf).unwrap(), 2000);
        assert_eq!(buf, &data[900..2900]);
    }

    #[test]
    fn test_missing_file() {
        assert!(RawHandle::open(Path::new("/nonexistent/disk.dd")).is_err());
    }
}
