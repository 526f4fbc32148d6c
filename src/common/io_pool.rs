// Bounded pool of segment file handles
//
// Segmented containers (EWF series, numbered raw sets) can span hundreds of
// files; the pool keeps at most `max_open` of them open and evicts the least
// recently used handle when a new one is needed.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::{debug, trace};

/// Default maximum number of simultaneously open file handles
pub const DEFAULT_MAX_OPEN_FILES: usize = 16;

pub struct FileIoPool {
    /// Paths to all segment files in order
    file_paths: Vec<PathBuf>,
    /// Size of every segment, captured when the pool was built
    file_sizes: Vec<u64>,
    /// Currently open file handles (file_index -> File)
    open_handles: HashMap<usize, File>,
    /// Most recently used first
    lru_queue: VecDeque<usize>,
    max_open: usize,
}

impl FileIoPool {
    /// Build a pool over `file_paths`, failing if any segment is unreadable
    pub fn open(file_paths: Vec<PathBuf>, max_open: usize) -> Result<Self, String> {
        let mut file_sizes = Vec::with_capacity(file_paths.len());
        for path in &file_paths {
            let size = std::fs::metadata(path)
                .map_err(|e| format!("Failed to stat segment {}: {}", path.display(), e))?
                .len();
            file_sizes.push(size);
        }

        Ok(Self {
            file_paths,
            file_sizes,
            open_handles: HashMap::new(),
            lru_queue: VecDeque::new(),
            max_open: max_open.max(1),
        })
    }

    /// Get a file handle, opening it if necessary and managing the LRU queue
    pub fn get_file(&mut self, file_index: usize) -> Result<&mut File, String> {
        if file_index >= self.file_paths.len() {
            return Err(format!(
                "File index {} out of range (have {} files)",
                file_index,
                self.file_paths.len()
            ));
        }

        if self.open_handles.contains_key(&file_index) {
            self.lru_queue.retain(|&x| x != file_index);
            self.lru_queue.push_front(file_index);
            trace!(file_index, "File handle cache hit");
        } else {
            if self.open_handles.len() >= self.max_open {
                if let Some(lru_index) = self.lru_queue.pop_back() {
                    trace!(lru_index, "Evicting LRU file handle");
                    self.open_handles.remove(&lru_index);
                }
            }

            let file_path = &self.file_paths[file_index];
            debug!(file_index, ?file_path, "Opening file handle");
            let file = File::open(file_path)
                .map_err(|e| format!("Failed to open segment {}: {}", file_index, e))?;
            self.open_handles.insert(file_index, file);
            self.lru_queue.push_front(file_index);
        }

        self.open_handles
            .get_mut(&file_index)
            .ok_or_else(|| format!("Segment {} handle vanished from pool", file_index))
    }

    /// Read up to `buf.len()` bytes from one segment at `offset`
    pub fn read_at(&mut self, file_index: usize, offset: u64, buf: &mut [u8]) -> Result<usize, String> {
        let file = self.get_file(file_index)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| format!("Seek to {} in segment {} failed: {}", offset, file_index, e))?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])
                .map_err(|e| format!("Read from segment {} failed: {}", file_index, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    pub fn get_file_count(&self) -> usize {
        self.file_paths.len()
    }

    pub fn file_sizes(&self) -> &[u64] {
        &self.file_sizes
    }

    pub fn get_paths(&self) -> &[PathBuf] {
        &self.file_paths
    }

    /// Get the number of currently open handles
    pub fn open_count(&self) -> usize {
        self.open_handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn make_segments(dir: &TempDir, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.path().join(format!("seg_{}.bin", i));
                let mut file = File::create(&path).unwrap();
                file.write_all(&[i as u8; 100]).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_file_pool_evicts_lru() {
        let temp_dir = TempDir::new().unwrap();
        let paths = make_segments(&temp_dir, 5);
        let mut pool = FileIoPool::open(paths, 3).unwrap();

        assert_eq!(pool.get_file_count(), 5);
        assert_eq!(pool.file_sizes(), &[100, 100, 100, 100, 100]);
        assert_eq!(pool.open_count(), 0);

        pool.get_file(0).unwrap();
        pool.get_file(1).unwrap();
        pool.get_file(2).unwrap();
        assert_eq!(pool.open_count(), 3);

        pool.get_file(3).unwrap();
        assert_eq!(pool.open_count(), 3);
    }

    #[test]
    fn test_read_at_short_at_end() {
        let temp_dir = TempDir::new().unwrap();
        let paths = make_segments(&temp_dir, 2);
        let mut pool = FileIoPool::open(paths, 1).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(pool.read_at(1, 90, &mut buf).unwrap(), 10);
        assert!(buf[..10].iter().all(|&b| b == 1));
    }

    #[test]
    fn test_file_pool_errors() {
        let mut pool = FileIoPool::open(Vec::new(), 3).unwrap();
        assert!(pool.get_file(0).is_err());
        assert!(FileIoPool::open(vec![PathBuf::from("/nonexistent/seg.E01")], 3).is_err());
    }
}
