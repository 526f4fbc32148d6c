//! LRU cache of decompressed chunks

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Sequential reads through a partition touch the same chunk many times
/// (one sector at a time); keeping recent chunks avoids re-inflating them.
pub(crate) struct ChunkCache {
    cache: HashMap<usize, Arc<Vec<u8>>>,
    lru_queue: VecDeque<usize>,
    max_entries: usize,
    hits: u64,
    misses: u64,
}

impl ChunkCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            cache: HashMap::new(),
            lru_queue: VecDeque::new(),
            max_entries: max_entries.max(1),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, chunk_index: usize) -> Option<Arc<Vec<u8>>> {
        match self.cache.get(&chunk_index) {
            Some(data) => {
                self.hits += 1;
                if self.lru_queue.front() != Some(&chunk_index) {
                    self.lru_queue.retain(|&x| x != chunk_index);
                    self.lru_queue.push_front(chunk_index);
                }
                Some(Arc::clone(data))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, chunk_index: usize, data: Arc<Vec<u8>>) {
        if self.cache.contains_key(&chunk_index) {
            self.lru_queue.retain(|&x| x != chunk_index);
        } else if self.cache.len() >= self.max_entries {
            if let Some(old_index) = self.lru_queue.pop_back() {
                self.cache.remove(&old_index);
            }
        }

        self.cache.insert(chunk_index, data);
        self.lru_queue.push_front(chunk_index);
    }

    /// (hits, misses) since creation
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
