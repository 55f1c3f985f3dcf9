//! Files this peer originated, plus the persisted form of the peer's
//! bookkeeping.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkRecordStore, RecordSnapshot};
use crate::identity::FileId;

/// Local metadata for a backed-up file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackedUpFile {
    pub file_id: FileId,
    pub path: PathBuf,
    pub size: u64,
    pub chunk_count: u32,
    pub replication_degree: u8,
}

#[derive(Debug, Default)]
pub struct BackedUpFiles {
    files: RwLock<HashMap<FileId, BackedUpFile>>,
}

impl BackedUpFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns the previous entry for the same id.
    pub fn insert(&self, file: BackedUpFile) -> Option<BackedUpFile> {
        self.files.write().insert(file.file_id, file)
    }

    pub fn remove(&self, file_id: FileId) -> Option<BackedUpFile> {
        self.files.write().remove(&file_id)
    }

    pub fn contains(&self, file_id: FileId) -> bool {
        self.files.read().contains_key(&file_id)
    }

    /// Backup entry of a path. The peer replaces the entry when the path is
    /// backed up again, so there is normally at most one.
    pub fn by_path(&self, path: &std::path::Path) -> Option<BackedUpFile> {
        self.files
            .read()
            .values()
            .find(|f| f.path == path)
            .cloned()
    }

    pub fn list(&self) -> Vec<BackedUpFile> {
        let mut out: Vec<BackedUpFile> = self.files.read().values().cloned().collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }
}

/// Everything a peer persists between runs.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub backed_up: Vec<BackedUpFile>,
    pub records: Vec<RecordSnapshot>,
    /// Capacity set by the last reclaim. Unset until the user reclaims, so
    /// the configured capacity applies.
    #[serde(default)]
    pub reclaimed_capacity: Option<u64>,
}

impl Metadata {
    pub fn capture(
        files: &BackedUpFiles,
        store: &ChunkRecordStore,
        reclaimed_capacity: Option<u64>,
    ) -> Self {
        Self {
            backed_up: files.list(),
            records: store.snapshot(),
            reclaimed_capacity,
        }
    }

    pub fn apply(self, files: &BackedUpFiles, store: &ChunkRecordStore) {
        for f in self.backed_up {
            files.insert(f);
        }
        store.restore(self.records);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;

    fn entry(n: u8, path: &str) -> BackedUpFile {
        BackedUpFile {
            file_id: FileId::from_bytes([n; 32]),
            path: PathBuf::from(path),
            size: 10,
            chunk_count: 1,
            replication_degree: 2,
        }
    }

    #[test]
    fn lookup_by_id_and_path() {
        let files = BackedUpFiles::new();
        files.insert(entry(1, "/a"));
        files.insert(entry(2, "/b"));
        assert!(files.contains(FileId::from_bytes([1; 32])));
        assert_eq!(
            files.by_path(std::path::Path::new("/b")).map(|f| f.file_id),
            Some(FileId::from_bytes([2; 32]))
        );
        assert!(files.remove(FileId::from_bytes([1; 32])).is_some());
        assert_eq!(files.list().len(), 1);
    }

    #[test]
    fn metadata_json_roundtrip() {
        let files = BackedUpFiles::new();
        files.insert(entry(1, "/a"));
        let store = ChunkRecordStore::new();
        store.record_holder(FileId::from_bytes([1; 32]), 0, PeerId(3));

        let json = serde_json::to_string(&Metadata::capture(&files, &store, Some(1000))).unwrap();
        let meta: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta.reclaimed_capacity, Some(1000));

        let files2 = BackedUpFiles::new();
        let store2 = ChunkRecordStore::new();
        meta.apply(&files2, &store2);
        assert_eq!(files2.list(), files.list());
        assert_eq!(store2.replication_degree(FileId::from_bytes([1; 32]), 0), 1);
    }

    #[test]
    fn capacity_is_only_kept_once_reclaimed() {
        let json = serde_json::to_string(&Metadata::capture(
            &BackedUpFiles::new(),
            &ChunkRecordStore::new(),
            None,
        ))
        .unwrap();
        let meta: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta.reclaimed_capacity, None);

        let bare: Metadata = serde_json::from_str(r#"{"backed_up":[],"records":[]}"#).unwrap();
        assert_eq!(bare, Metadata::default());
    }
}
