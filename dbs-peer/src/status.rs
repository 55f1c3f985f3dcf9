//! Point-in-time report of what this peer backed up and what it stores.

use std::fmt;

use dbs_core::chunk::{ChunkKey, ChunkRecordStore};
use dbs_core::registry::{BackedUpFile, BackedUpFiles};
use dbs_core::storage::ChunkStorage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkStatus {
    pub chunk_no: u32,
    pub perceived: usize,
    pub desired: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    pub file: BackedUpFile,
    pub chunks: Vec<ChunkStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunkStatus {
    pub key: ChunkKey,
    pub size: usize,
    pub perceived: usize,
    pub desired: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub files: Vec<FileStatus>,
    pub stored: Vec<StoredChunkStatus>,
    pub capacity: u64,
    pub used: u64,
}

impl StatusReport {
    pub fn collect(
        files: &BackedUpFiles,
        records: &ChunkRecordStore,
        storage: &dyn ChunkStorage,
    ) -> Self {
        let files = files
            .list()
            .into_iter()
            .map(|file| {
                let chunks = (0..file.chunk_count)
                    .map(|chunk_no| ChunkStatus {
                        chunk_no,
                        perceived: records.replication_degree(file.file_id, chunk_no),
                        desired: records.desired_degree(file.file_id, chunk_no),
                    })
                    .collect();
                FileStatus { file, chunks }
            })
            .collect();
        let stored = storage
            .list()
            .into_iter()
            .map(|(key, size)| StoredChunkStatus {
                key,
                size,
                perceived: records.replication_degree(key.file_id, key.chunk_no),
                desired: records.desired_degree(key.file_id, key.chunk_no),
            })
            .collect();
        Self {
            files,
            stored,
            capacity: storage.capacity(),
            used: storage.used_bytes(),
        }
    }
}

fn degree(d: Option<u8>) -> String {
    d.map_or_else(|| "?".into(), |d| d.to_string())
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Backed up files: {}", self.files.len())?;
        for fs in &self.files {
            writeln!(
                f,
                "  {} id={} desired={}",
                fs.file.path.display(),
                fs.file.file_id,
                fs.file.replication_degree
            )?;
            for c in &fs.chunks {
                writeln!(
                    f,
                    "    chunk {} perceived={} desired={}",
                    c.chunk_no,
                    c.perceived,
                    degree(c.desired)
                )?;
            }
        }
        writeln!(f, "Stored chunks: {}", self.stored.len())?;
        for s in &self.stored {
            writeln!(
                f,
                "  {} size={} perceived={} desired={}",
                s.key,
                s.size,
                s.perceived,
                degree(s.desired)
            )?;
        }
        write!(f, "Storage: {} of {} bytes used", self.used, self.capacity)
    }
}
