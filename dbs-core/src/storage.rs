//! Local replica storage seam. The peer provides a disk implementation;
//! `MemoryStorage` backs tests and embedding hosts.

use std::collections::BTreeMap;
use std::io;

use parking_lot::Mutex;

use crate::chunk::ChunkKey;
use crate::identity::FileId;

/// Replicas this peer keeps on behalf of others.
pub trait ChunkStorage: Send + Sync {
    fn contains(&self, key: &ChunkKey) -> bool;

    /// Store a replica. `Ok(false)` when it does not fit in the capacity.
    /// Storing an already present chunk succeeds without using more space.
    fn store(&self, key: ChunkKey, data: &[u8]) -> io::Result<bool>;

    fn load(&self, key: &ChunkKey) -> io::Result<Option<Vec<u8>>>;

    /// Returns true if the chunk was present.
    fn remove(&self, key: &ChunkKey) -> io::Result<bool>;

    /// Remove every chunk of a file. Returns how many were removed.
    fn remove_file(&self, file_id: FileId) -> io::Result<usize>;

    /// Stored chunks with their sizes.
    fn list(&self) -> Vec<(ChunkKey, usize)>;

    fn used_bytes(&self) -> u64;

    fn capacity(&self) -> u64;

    fn set_capacity(&self, bytes: u64);
}

#[derive(Debug)]
struct MemoryInner {
    chunks: BTreeMap<ChunkKey, Vec<u8>>,
    used: u64,
    capacity: u64,
}

#[derive(Debug)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                chunks: BTreeMap::new(),
                used: 0,
                capacity,
            }),
        }
    }
}

impl ChunkStorage for MemoryStorage {
    fn contains(&self, key: &ChunkKey) -> bool {
        self.inner.lock().chunks.contains_key(key)
    }

    fn store(&self, key: ChunkKey, data: &[u8]) -> io::Result<bool> {
        let mut inner = self.inner.lock();
        if inner.chunks.contains_key(&key) {
            return Ok(true);
        }
        let projected = inner.used.saturating_add(data.len() as u64);
        if projected > inner.capacity {
            return Ok(false);
        }
        inner.chunks.insert(key, data.to_vec());
        inner.used = projected;
        Ok(true)
    }

    fn load(&self, key: &ChunkKey) -> io::Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().chunks.get(key).cloned())
    }

    fn remove(&self, key: &ChunkKey) -> io::Result<bool> {
        let mut inner = self.inner.lock();
        match inner.chunks.remove(key) {
            Some(v) => {
                inner.used = inner.used.saturating_sub(v.len() as u64);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove_file(&self, file_id: FileId) -> io::Result<usize> {
        let keys: Vec<ChunkKey> = self
            .inner
            .lock()
            .chunks
            .keys()
            .filter(|k| k.file_id == file_id)
            .copied()
            .collect();
        let mut removed = 0;
        for k in keys {
            if self.remove(&k)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn list(&self) -> Vec<(ChunkKey, usize)> {
        self.inner
            .lock()
            .chunks
            .iter()
            .map(|(k, v)| (*k, v.len()))
            .collect()
    }

    fn used_bytes(&self) -> u64 {
        self.inner.lock().used
    }

    fn capacity(&self) -> u64 {
        self.inner.lock().capacity
    }

    fn set_capacity(&self, bytes: u64) {
        self.inner.lock().capacity = bytes;
    }
}
