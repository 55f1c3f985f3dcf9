//! Replicas on disk: `<root>/<file id>/chk<n>`.
//!
//! The index lock covers bookkeeping only. A store reserves its bytes under
//! the lock, writes with the lock released, then commits or rolls back.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::PathBuf;

use dbs_core::chunk::ChunkKey;
use dbs_core::identity::FileId;
use dbs_core::storage::ChunkStorage;
use parking_lot::Mutex;
use tracing::debug;

const CHUNK_PREFIX: &str = "chk";

struct Index {
    chunks: BTreeMap<ChunkKey, usize>,
    /// Reserved and being written. Counted in `used`.
    writing: BTreeSet<ChunkKey>,
    used: u64,
    capacity: u64,
}

enum Reservation {
    /// Stored already, or another worker is writing it.
    Present,
    Full,
    Reserved,
}

pub struct DiskStorage {
    root: PathBuf,
    index: Mutex<Index>,
}

impl DiskStorage {
    /// Open `root`, indexing replicas left by a previous run.
    pub fn open(root: impl Into<PathBuf>, capacity: u64) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let mut chunks = BTreeMap::new();
        for dir in fs::read_dir(&root)? {
            let dir = dir?;
            let Some(file_id) = dir
                .file_name()
                .to_str()
                .and_then(|n| FileId::parse(n).ok())
            else {
                continue;
            };
            if !dir.file_type()?.is_dir() {
                continue;
            }
            for chunk in fs::read_dir(dir.path())? {
                let chunk = chunk?;
                let Some(chunk_no) = chunk
                    .file_name()
                    .to_str()
                    .and_then(|n| n.strip_prefix(CHUNK_PREFIX))
                    .and_then(|n| n.parse::<u32>().ok())
                else {
                    continue;
                };
                let size = chunk.metadata()?.len() as usize;
                chunks.insert(ChunkKey::new(file_id, chunk_no), size);
            }
        }
        let used = chunks.values().map(|s| *s as u64).sum();
        debug!(root = %root.display(), chunks = chunks.len(), used, "opened chunk storage");
        Ok(Self {
            root,
            index: Mutex::new(Index {
                chunks,
                writing: BTreeSet::new(),
                used,
                capacity,
            }),
        })
    }

    fn file_dir(&self, file_id: FileId) -> PathBuf {
        self.root.join(file_id.to_hex())
    }

    fn chunk_path(&self, key: &ChunkKey) -> PathBuf {
        self.file_dir(key.file_id)
            .join(format!("{CHUNK_PREFIX}{}", key.chunk_no))
    }

    fn reserve(&self, key: ChunkKey, len: usize) -> Reservation {
        let mut index = self.index.lock();
        if index.chunks.contains_key(&key) || index.writing.contains(&key) {
            return Reservation::Present;
        }
        let projected = index.used.saturating_add(len as u64);
        if projected > index.capacity {
            return Reservation::Full;
        }
        index.writing.insert(key);
        index.used = projected;
        Reservation::Reserved
    }

    fn finish(&self, key: ChunkKey, len: usize, written: bool) {
        let mut index = self.index.lock();
        index.writing.remove(&key);
        if written {
            index.chunks.insert(key, len);
        } else {
            index.used = index.used.saturating_sub(len as u64);
        }
    }

    /// Write through a temporary file so a crash never leaves a truncated
    /// replica under its final name.
    fn write_chunk(&self, key: &ChunkKey, data: &[u8]) -> io::Result<()> {
        fs::create_dir_all(self.file_dir(key.file_id))?;
        let path = self.chunk_path(key);
        let tmp = path.with_extension("tmp");
        let written = fs::write(&tmp, data).and_then(|()| fs::rename(&tmp, &path));
        if written.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        written
    }
}

impl ChunkStorage for DiskStorage {
    fn contains(&self, key: &ChunkKey) -> bool {
        self.index.lock().chunks.contains_key(key)
    }

    fn store(&self, key: ChunkKey, data: &[u8]) -> io::Result<bool> {
        match self.reserve(key, data.len()) {
            Reservation::Present => return Ok(true),
            Reservation::Full => return Ok(false),
            Reservation::Reserved => {}
        }
        let written = self.write_chunk(&key, data);
        self.finish(key, data.len(), written.is_ok());
        if let Err(e) = &written {
            debug!(chunk = %key, error = %e, "replica write failed");
        }
        written.map(|()| true)
    }

    fn load(&self, key: &ChunkKey) -> io::Result<Option<Vec<u8>>> {
        if !self.contains(key) {
            return Ok(None);
        }
        match fs::read(self.chunk_path(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn remove(&self, key: &ChunkKey) -> io::Result<bool> {
        let mut index = self.index.lock();
        let Some(size) = index.chunks.remove(key) else {
            return Ok(false);
        };
        index.used = index.used.saturating_sub(size as u64);
        match fs::remove_file(self.chunk_path(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(true)
    }

    fn remove_file(&self, file_id: FileId) -> io::Result<usize> {
        let removed = {
            let mut index = self.index.lock();
            let keys: Vec<ChunkKey> = index
                .chunks
                .keys()
                .filter(|k| k.file_id == file_id)
                .copied()
                .collect();
            for k in &keys {
                if let Some(size) = index.chunks.remove(k) {
                    index.used = index.used.saturating_sub(size as u64);
                }
            }
            keys.len()
        };
        match fs::remove_dir_all(self.file_dir(file_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(removed)
    }

    fn list(&self) -> Vec<(ChunkKey, usize)> {
        self.index
            .lock()
            .chunks
            .iter()
            .map(|(k, s)| (*k, *s))
            .collect()
    }

    fn used_bytes(&self) -> u64 {
        self.index.lock().used
    }

    fn capacity(&self) -> u64 {
        self.index.lock().capacity
    }

    fn set_capacity(&self, bytes: u64) {
        self.index.lock().capacity = bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(file: u8, n: u32) -> ChunkKey {
        ChunkKey::new(FileId::from_bytes([file; 32]), n)
    }

    #[test]
    fn chunks_land_in_file_directories() {
        let dir = tempfile::tempdir().unwrap();
        let s = DiskStorage::open(dir.path(), 1000).unwrap();
        assert!(s.store(key(1, 4), b"four").unwrap());
        let path = dir
            .path()
            .join(FileId::from_bytes([1; 32]).to_hex())
            .join("chk4");
        assert_eq!(fs::read(path).unwrap(), b"four");
        assert_eq!(s.load(&key(1, 4)).unwrap(), Some(b"four".to_vec()));
        assert_eq!(s.load(&key(1, 5)).unwrap(), None);
    }

    #[test]
    fn capacity_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let s = DiskStorage::open(dir.path(), 8).unwrap();
        assert!(s.store(key(1, 0), &[0; 5]).unwrap());
        assert!(!s.store(key(1, 1), &[0; 5]).unwrap());
        assert!(s.store(key(1, 0), &[0; 5]).unwrap());
        assert_eq!(s.used_bytes(), 5);
        s.set_capacity(2);
        assert_eq!(s.capacity(), 2);
        assert!(s.remove(&key(1, 0)).unwrap());
        assert!(!s.remove(&key(1, 0)).unwrap());
        assert_eq!(s.used_bytes(), 0);
    }

    #[test]
    fn reopen_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = DiskStorage::open(dir.path(), 1000).unwrap();
            s.store(key(1, 0), &[1; 10]).unwrap();
            s.store(key(1, 1), &[1; 3]).unwrap();
            s.store(key(2, 0), &[2; 7]).unwrap();
        }
        fs::write(dir.path().join("stray.txt"), b"x").unwrap();
        let s = DiskStorage::open(dir.path(), 1000).unwrap();
        assert_eq!(s.used_bytes(), 20);
        assert_eq!(s.list().len(), 3);

        assert_eq!(s.remove_file(FileId::from_bytes([1; 32])).unwrap(), 2);
        assert_eq!(s.used_bytes(), 7);
        assert!(!dir
            .path()
            .join(FileId::from_bytes([1; 32]).to_hex())
            .exists());
    }

    #[test]
    fn reserved_write_does_not_block_other_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let s = DiskStorage::open(dir.path(), 20).unwrap();
        assert!(matches!(s.reserve(key(1, 0), 8), Reservation::Reserved));

        // Another chunk goes through while the first is still in flight.
        assert!(s.store(key(2, 0), &[2; 8]).unwrap());
        assert!(s.contains(&key(2, 0)));
        assert!(!s.contains(&key(1, 0)));
        assert_eq!(s.used_bytes(), 16);
        // The reservation counts against capacity.
        assert!(!s.store(key(3, 0), &[3; 8]).unwrap());
        // A duplicate PUTCHUNK of the in-flight chunk is not written twice.
        assert!(s.store(key(1, 0), &[1; 8]).unwrap());

        s.finish(key(1, 0), 8, true);
        assert!(s.contains(&key(1, 0)));
        assert_eq!(s.used_bytes(), 16);
    }

    #[test]
    fn failed_write_releases_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let s = DiskStorage::open(dir.path(), 100).unwrap();
        // A plain file where the chunk directory should go.
        fs::write(dir.path().join(FileId::from_bytes([1; 32]).to_hex()), b"x").unwrap();

        assert!(s.store(key(1, 0), &[0; 10]).is_err());
        assert!(!s.contains(&key(1, 0)));
        assert_eq!(s.used_bytes(), 0);
        assert!(s.store(key(2, 0), &[0; 10]).unwrap());
    }

    #[test]
    fn concurrent_stores_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let s = DiskStorage::open(dir.path(), 10_000).unwrap();
        std::thread::scope(|scope| {
            for n in 0..8u32 {
                let s = &s;
                scope.spawn(move || {
                    assert!(s.store(key(1, n), &[n as u8; 100]).unwrap());
                });
            }
        });
        assert_eq!(s.list().len(), 8);
        assert_eq!(s.used_bytes(), 800);
        let file_dir = dir.path().join(FileId::from_bytes([1; 32]).to_hex());
        let leftovers = fs::read_dir(file_dir)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().is_some())
            .count();
        assert_eq!(leftovers, 0);
    }
}
