//! Chunk records: who holds a replica of which chunk. Plus splitting a file
//! into chunks and reassembling it on restore.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::identity::{FileId, PeerId};
use crate::protocol::MAX_CHUNK_SIZE;

/// Chunk identifier: file id + chunk number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub file_id: FileId,
    pub chunk_no: u32,
}

impl ChunkKey {
    pub fn new(file_id: FileId, chunk_no: u32) -> Self {
        Self { file_id, chunk_no }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", &self.file_id.to_hex()[..8], self.chunk_no)
    }
}

#[derive(Debug, Default)]
struct RecordState {
    desired: Option<u8>,
    size: Option<usize>,
    holders: BTreeSet<PeerId>,
}

/// Bookkeeping for one chunk. All fields sit behind one per-record lock so a
/// reader never sees half of an update.
#[derive(Debug)]
pub struct ChunkRecord {
    key: ChunkKey,
    state: Mutex<RecordState>,
}

impl ChunkRecord {
    fn new(key: ChunkKey) -> Self {
        Self {
            key,
            state: Mutex::new(RecordState::default()),
        }
    }

    pub fn key(&self) -> ChunkKey {
        self.key
    }

    /// Desired replication degree, once known. Set at most once.
    pub fn desired_degree(&self) -> Option<u8> {
        self.state.lock().desired
    }

    /// Set the desired degree if it is not known yet. Returns the value in
    /// effect afterwards.
    pub fn init_desired_degree(&self, degree: u8) -> u8 {
        *self.state.lock().desired.get_or_insert(degree)
    }

    pub fn size(&self) -> Option<usize> {
        self.state.lock().size
    }

    pub fn set_size(&self, size: usize) {
        self.state.lock().size = Some(size);
    }

    /// Number of distinct peers known to hold a replica.
    pub fn replication_degree(&self) -> usize {
        self.state.lock().holders.len()
    }

    pub fn holders(&self) -> BTreeSet<PeerId> {
        self.state.lock().holders.clone()
    }

    /// Returns true if the peer was not already a holder.
    pub fn add_holder(&self, peer: PeerId) -> bool {
        self.state.lock().holders.insert(peer)
    }

    /// Returns true if the peer was a holder.
    pub fn remove_holder(&self, peer: PeerId) -> bool {
        self.state.lock().holders.remove(&peer)
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        let s = self.state.lock();
        RecordSnapshot {
            key: self.key,
            desired: s.desired,
            size: s.size,
            holders: s.holders.iter().copied().collect(),
        }
    }
}

/// Point-in-time copy of a record (status reports, persistence).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub key: ChunkKey,
    pub desired: Option<u8>,
    pub size: Option<usize>,
    pub holders: Vec<PeerId>,
}

/// Table of chunk records. The table lock only guards lookup and insert;
/// holder updates take the lock of the one record they touch.
#[derive(Debug, Default)]
pub struct ChunkRecordStore {
    records: RwLock<HashMap<ChunkKey, Arc<ChunkRecord>>>,
}

impl ChunkRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ChunkKey) -> Option<Arc<ChunkRecord>> {
        self.records.read().get(key).cloned()
    }

    /// Idempotent: returns the existing record if present.
    pub fn create_or_get(&self, key: ChunkKey) -> Arc<ChunkRecord> {
        if let Some(r) = self.get(&key) {
            return r;
        }
        self.records
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(ChunkRecord::new(key)))
            .clone()
    }

    /// Add `peer` to the chunk's holders, creating the record if needed.
    /// Returns true if the peer was new.
    pub fn record_holder(&self, file_id: FileId, chunk_no: u32, peer: PeerId) -> bool {
        self.create_or_get(ChunkKey::new(file_id, chunk_no))
            .add_holder(peer)
    }

    /// Remove `peer` from the chunk's holders. No-op if absent.
    pub fn remove_holder(&self, file_id: FileId, chunk_no: u32, peer: PeerId) -> bool {
        self.get(&ChunkKey::new(file_id, chunk_no))
            .map(|r| r.remove_holder(peer))
            .unwrap_or(false)
    }

    /// Current holder count; 0 for an unknown chunk.
    pub fn replication_degree(&self, file_id: FileId, chunk_no: u32) -> usize {
        self.get(&ChunkKey::new(file_id, chunk_no))
            .map(|r| r.replication_degree())
            .unwrap_or(0)
    }

    pub fn desired_degree(&self, file_id: FileId, chunk_no: u32) -> Option<u8> {
        self.get(&ChunkKey::new(file_id, chunk_no))
            .and_then(|r| r.desired_degree())
    }

    /// Records of one file, ordered by chunk number.
    pub fn records_for_file(&self, file_id: FileId) -> Vec<Arc<ChunkRecord>> {
        let mut out: Vec<Arc<ChunkRecord>> = self
            .records
            .read()
            .values()
            .filter(|r| r.key.file_id == file_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.key.chunk_no);
        out
    }

    /// Drop every record of a file. Returns how many were removed.
    pub fn forget_file(&self, file_id: FileId) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|k, _| k.file_id != file_id);
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<RecordSnapshot> {
        let records: Vec<Arc<ChunkRecord>> = self.records.read().values().cloned().collect();
        let mut out: Vec<RecordSnapshot> = records.iter().map(|r| r.snapshot()).collect();
        out.sort_by_key(|s| s.key);
        out
    }

    /// Load records saved with [`ChunkRecordStore::snapshot`]. Holders are
    /// merged into existing records.
    pub fn restore(&self, snapshots: Vec<RecordSnapshot>) {
        for s in snapshots {
            let record = self.create_or_get(s.key);
            if let Some(d) = s.desired {
                record.init_desired_degree(d);
            }
            if let Some(size) = s.size {
                record.set_size(size);
            }
            for h in s.holders {
                record.add_holder(h);
            }
        }
    }
}

/// Split file contents into chunk bodies of `chunk_size` bytes. A file whose
/// length is a multiple of the chunk size (including an empty file) ends with
/// an empty chunk, so a short last chunk always marks the end.
pub fn split_into_chunks(data: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    let size = if chunk_size == 0 {
        MAX_CHUNK_SIZE
    } else {
        chunk_size
    };
    let mut out: Vec<&[u8]> = data.chunks(size).collect();
    if data.len() % size == 0 {
        out.push(&data[data.len()..]);
    }
    out
}

/// Number of chunks [`split_into_chunks`] produces for a file of `len` bytes.
pub fn chunk_count(len: u64, chunk_size: usize) -> u32 {
    let size = if chunk_size == 0 {
        MAX_CHUNK_SIZE
    } else {
        chunk_size
    };
    (len / size as u64 + 1) as u32
}

/// Per-restore state: chunk bodies received so far; reassembly.
pub struct RestoreState {
    pub file_id: FileId,
    chunk_count: u32,
    received: HashMap<u32, Vec<u8>>,
}

impl RestoreState {
    pub fn new(file_id: FileId, chunk_count: u32) -> Self {
        Self {
            file_id,
            chunk_count,
            received: HashMap::new(),
        }
    }

    /// Record a chunk body. Returns true if the restore is now complete.
    /// Chunks of other files or beyond the chunk count are rejected.
    pub fn mark_received(&mut self, key: ChunkKey, data: Vec<u8>) -> Result<bool, ChunkError> {
        if key.file_id != self.file_id {
            return Err(ChunkError::UnknownFile);
        }
        if key.chunk_no >= self.chunk_count {
            return Err(ChunkError::OutOfRange(key.chunk_no));
        }
        self.received.insert(key.chunk_no, data);
        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        (0..self.chunk_count).all(|n| self.received.contains_key(&n))
    }

    pub fn missing(&self) -> Vec<u32> {
        (0..self.chunk_count)
            .filter(|n| !self.received.contains_key(n))
            .collect()
    }

    /// Concatenate chunks in order. Call only when `is_complete()`.
    pub fn reassemble(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for n in 0..self.chunk_count {
            if let Some(body) = self.received.get(&n) {
                out.extend_from_slice(body);
            }
        }
        out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk belongs to another file")]
    UnknownFile,
    #[error("chunk {0} is past the end of the file")]
    OutOfRange(u32),
}
