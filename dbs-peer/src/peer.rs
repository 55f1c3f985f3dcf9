//! The peer: owns the three channels, the dispatch pool and the shared
//! bookkeeping, and runs the backup, restore, delete and reclaim protocols.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::Context;
use dbs_core::action::{Expectation, PendingAction};
use dbs_core::chunk::{
    chunk_count, split_into_chunks, ChunkError, ChunkKey, ChunkRecordStore, RestoreState,
};
use dbs_core::dispatch::{
    self, ChannelKind, DispatchContext, DispatchTask, LocalPeer, OutboundAction, Sightings,
};
use dbs_core::identity::{FileId, PeerId};
use dbs_core::protocol::{
    Message, MessageKind, MessageType, ValidationError, MAX_CHUNK_NO, MAX_CHUNK_SIZE,
};
use dbs_core::registry::{BackedUpFile, BackedUpFiles, Metadata};
use dbs_core::wire::encode_message;
use dbs_core::RetryPolicy;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelError, MulticastChannel};
use crate::config::Config;
use crate::pool::DispatchPool;
use crate::request::request;
use crate::status::StatusReport;
use crate::storage::DiskStorage;

const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("cannot read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("file needs {chunks} chunks, more than chunk numbers can address")]
    TooLarge { chunks: u32 },
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("chunk {chunk_no}: replication degree {achieved} below desired {desired}")]
    ReplicationDegreeNotMet {
        chunk_no: u32,
        achieved: usize,
        desired: usize,
    },
    #[error("backup task failed: {0}")]
    Task(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("{0:?} was not backed up by this peer")]
    NotBackedUp(PathBuf),
    #[error("no peer returned chunk {chunk_no}")]
    ChunkUnavailable { chunk_no: u32 },
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Reassembly(#[from] ChunkError),
    #[error("cannot write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("restore task failed: {0}")]
    Task(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("{0:?} was not backed up by this peer")]
    NotBackedUp(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Everything the peer needs from the configuration, validated.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub local: LocalPeer,
    pub mc: String,
    pub mdb: String,
    pub mdr: String,
    pub storage_dir: PathBuf,
    pub capacity: u64,
    pub retry: RetryPolicy,
    pub max_reply_delay: Duration,
    pub delete_repeats: u32,
    pub max_parallel_chunks: usize,
    pub pool_workers: usize,
    pub pool_queue: usize,
}

impl PeerSettings {
    pub fn from_config(c: &Config) -> anyhow::Result<Self> {
        c.validate()?;
        Ok(Self {
            local: LocalPeer {
                id: PeerId(c.peer_id),
                version: c.version()?,
            },
            mc: c.mc.clone(),
            mdb: c.mdb.clone(),
            mdr: c.mdr.clone(),
            storage_dir: c.storage_dir(),
            capacity: c.capacity,
            retry: c.retry_policy(),
            max_reply_delay: c.max_reply_delay(),
            delete_repeats: c.delete_repeats.max(1),
            max_parallel_chunks: c.max_parallel_chunks,
            pool_workers: c.pool_workers,
            pool_queue: c.pool_queue,
        })
    }
}

pub struct Channels {
    pub control: Arc<MulticastChannel>,
    pub backup: Arc<MulticastChannel>,
    pub restore: Arc<MulticastChannel>,
}

impl Channels {
    pub fn join(mc: &str, mdb: &str, mdr: &str) -> Result<Self, ChannelError> {
        Ok(Self {
            control: Arc::new(MulticastChannel::join(ChannelKind::Control, mc)?),
            backup: Arc::new(MulticastChannel::join(ChannelKind::Backup, mdb)?),
            restore: Arc::new(MulticastChannel::join(ChannelKind::Restore, mdr)?),
        })
    }

    pub fn get(&self, kind: ChannelKind) -> &Arc<MulticastChannel> {
        match kind {
            ChannelKind::Control => &self.control,
            ChannelKind::Backup => &self.backup,
            ChannelKind::Restore => &self.restore,
        }
    }
}

/// Receive loops of the three channels. One finishing means the peer can no
/// longer take part in the protocol.
pub type ReceiveLoops = JoinSet<Result<(), ChannelError>>;

pub struct BackupReport {
    pub file_id: FileId,
    pub chunk_count: u32,
    pub replication_degree: u8,
}

pub struct Peer {
    settings: PeerSettings,
    ctx: Arc<DispatchContext>,
    channels: Channels,
    /// Set by `reclaim`; persisted so it outlives restarts.
    reclaimed_capacity: Mutex<Option<u64>>,
    metadata_lock: Mutex<()>,
}

/// Local state rebuilt from the storage directory.
struct LocalState {
    ctx: DispatchContext,
    reclaimed_capacity: Option<u64>,
}

impl LocalState {
    /// A capacity set by reclaim wins over the configured one.
    fn open(settings: &PeerSettings) -> anyhow::Result<Self> {
        let dir = &settings.storage_dir;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating storage dir {}", dir.display()))?;
        let metadata = load_metadata(&dir.join(METADATA_FILE))?;
        let reclaimed_capacity = metadata.as_ref().and_then(|m| m.reclaimed_capacity);
        let capacity = reclaimed_capacity.unwrap_or(settings.capacity);
        let storage = DiskStorage::open(dir.join("backup"), capacity)
            .with_context(|| format!("opening chunk storage in {}", dir.display()))?;

        let records = Arc::new(ChunkRecordStore::new());
        let backed_up = Arc::new(BackedUpFiles::new());
        if let Some(m) = metadata {
            m.apply(&backed_up, &records);
        }
        Ok(Self {
            ctx: DispatchContext {
                local: settings.local,
                records,
                backed_up,
                storage: Arc::new(storage),
                sightings: Arc::new(Sightings::new()),
                max_reply_delay: settings.max_reply_delay,
            },
            reclaimed_capacity,
        })
    }
}

impl Peer {
    /// Load persisted state, join the channels and start the dispatch pool,
    /// the receive loops and the outbound executor.
    pub async fn start(settings: PeerSettings) -> anyhow::Result<(Arc<Self>, ReceiveLoops)> {
        let state = LocalState::open(&settings)?;
        let channels = Channels::join(&settings.mc, &settings.mdb, &settings.mdr)?;
        let ctx = Arc::new(state.ctx);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let pool = {
            let ctx = ctx.clone();
            let (workers, queue) = (settings.pool_workers, settings.pool_queue);
            DispatchPool::spawn(workers, queue, move |task: DispatchTask| {
                let dispatched = dispatch::handle(&ctx, task);
                if let Some(id) = dispatched.satisfied {
                    trace!(?id, "action satisfied");
                }
                for action in dispatched.outbound {
                    if outbound_tx.send(action).is_err() {
                        break;
                    }
                }
            })
        };

        let peer = Arc::new(Self {
            settings,
            ctx,
            channels,
            reclaimed_capacity: Mutex::new(state.reclaimed_capacity),
            metadata_lock: Mutex::new(()),
        });
        tokio::spawn(peer.clone().run_outbound(outbound_rx));

        let mut loops = JoinSet::new();
        for kind in [ChannelKind::Control, ChannelKind::Backup, ChannelKind::Restore] {
            loops.spawn(peer.channels.get(kind).clone().run_receive_loop(pool.clone()));
        }
        info!(
            peer = %peer.id(),
            version = %peer.settings.local.version,
            files = peer.ctx.backed_up.list().len(),
            stored = peer.ctx.storage.list().len(),
            "peer started"
        );
        Ok((peer, loops))
    }

    pub fn id(&self) -> PeerId {
        self.settings.local.id
    }

    pub fn status(&self) -> StatusReport {
        StatusReport::collect(&self.ctx.backed_up, &self.ctx.records, &*self.ctx.storage)
    }

    /// Back up `path` with the given desired degree. Chunks are sent
    /// concurrently; every chunk is tried before the first failure is returned.
    pub async fn backup(
        self: &Arc<Self>,
        path: &Path,
        degree: u8,
    ) -> Result<BackupReport, BackupError> {
        let read_err = |source| BackupError::Read {
            path: path.to_path_buf(),
            source,
        };
        let meta = tokio::fs::metadata(path).await.map_err(read_err)?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let file_id = FileId::derive(&path.to_string_lossy(), meta.len(), modified);
        let data = tokio::fs::read(path).await.map_err(read_err)?;
        let chunks = chunk_count(data.len() as u64, MAX_CHUNK_SIZE);
        if chunks > MAX_CHUNK_NO + 1 {
            return Err(BackupError::TooLarge { chunks });
        }

        if let Some(previous) = self.ctx.backed_up.by_path(path) {
            if previous.file_id != file_id {
                info!(
                    path = %path.display(),
                    old = %previous.file_id,
                    "file changed, deleting previous backup"
                );
                self.delete_file(previous.file_id).await;
            }
        }
        self.ctx.backed_up.insert(BackedUpFile {
            file_id,
            path: path.to_path_buf(),
            size: meta.len(),
            chunk_count: chunks,
            replication_degree: degree,
        });
        info!(path = %path.display(), file = %file_id, chunks, degree, "backup started");

        let bodies: Vec<Vec<u8>> = split_into_chunks(&data, MAX_CHUNK_SIZE)
            .into_iter()
            .map(<[u8]>::to_vec)
            .collect();
        drop(data);
        let limit = Arc::new(Semaphore::new(self.settings.max_parallel_chunks));
        let mut tasks = JoinSet::new();
        for (chunk_no, body) in (0u32..).zip(bodies) {
            let Ok(permit) = limit.clone().acquire_owned().await else {
                break;
            };
            let peer = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let key = ChunkKey::new(file_id, chunk_no);
                (chunk_no, peer.backup_chunk(key, body, degree, usize::from(degree)).await)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((chunk_no, Err(e))) => failures.push((chunk_no, e)),
                Err(e) => failures.push((u32::MAX, BackupError::Task(e.to_string()))),
            }
        }
        self.persist();

        if let Some((_, e)) = failures.into_iter().min_by_key(|(n, _)| *n) {
            warn!(file = %file_id, error = %e, "backup incomplete");
            return Err(e);
        }
        info!(file = %file_id, "backup complete");
        Ok(BackupReport {
            file_id,
            chunk_count: chunks,
            replication_degree: degree,
        })
    }

    /// PUTCHUNK until `required` distinct peers answered STORED. Returns how
    /// many did.
    async fn backup_chunk(
        &self,
        key: ChunkKey,
        body: Vec<u8>,
        degree: u8,
        required: usize,
    ) -> Result<usize, BackupError> {
        self.ctx.records.create_or_get(key).init_desired_degree(degree);
        let message = self.message(
            key.file_id,
            MessageKind::Putchunk {
                chunk_no: key.chunk_no,
                replication_degree: degree,
                data: body,
            },
        )?;
        let bytes = encode_message(&message);
        let bytes = &bytes[..];
        let channel: &MulticastChannel = &self.channels.backup;
        let action = PendingAction::new(Expectation::stored(key), required);
        let outcome = request(
            self.channels.control.subscriptions(),
            action.clone(),
            &self.settings.retry,
            move |_| channel.send(bytes),
        )
        .await;
        let achieved = action.responders().len();
        if outcome.is_satisfied() {
            debug!(chunk = %key, achieved, attempts = outcome.attempts, "chunk replicated");
            Ok(achieved)
        } else {
            Err(BackupError::ReplicationDegreeNotMet {
                chunk_no: key.chunk_no,
                achieved,
                desired: required,
            })
        }
    }

    /// Fetch every chunk of a file this peer backed up and write it to
    /// `<storage dir>/restored/<file name>`.
    pub async fn restore(self: &Arc<Self>, path: &Path) -> Result<PathBuf, RestoreError> {
        let entry = self
            .ctx
            .backed_up
            .by_path(path)
            .ok_or_else(|| RestoreError::NotBackedUp(path.to_path_buf()))?;
        info!(
            path = %path.display(),
            file = %entry.file_id,
            chunks = entry.chunk_count,
            "restore started"
        );

        let limit = Arc::new(Semaphore::new(self.settings.max_parallel_chunks));
        let mut tasks = JoinSet::new();
        for chunk_no in 0..entry.chunk_count {
            let Ok(permit) = limit.clone().acquire_owned().await else {
                break;
            };
            let peer = self.clone();
            let key = ChunkKey::new(entry.file_id, chunk_no);
            tasks.spawn(async move {
                let _permit = permit;
                (key, peer.fetch_chunk(key).await)
            });
        }

        let mut state = RestoreState::new(entry.file_id, entry.chunk_count);
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Ok(data))) => {
                    state.mark_received(key, data)?;
                }
                Ok((_, Err(e))) => failure = failure.or(Some(e)),
                Err(e) => failure = failure.or(Some(RestoreError::Task(e.to_string()))),
            }
        }
        if let Some(&chunk_no) = state.missing().first() {
            let e = failure.unwrap_or(RestoreError::ChunkUnavailable { chunk_no });
            warn!(
                file = %entry.file_id,
                missing = state.missing().len(),
                error = %e,
                "restore failed"
            );
            return Err(e);
        }

        let out_dir = self.settings.storage_dir.join("restored");
        let name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| entry.file_id.to_hex().into());
        let out = out_dir.join(name);
        let write_err = |source| RestoreError::Write {
            path: out.clone(),
            source,
        };
        tokio::fs::create_dir_all(&out_dir).await.map_err(write_err)?;
        tokio::fs::write(&out, state.reassemble())
            .await
            .map_err(write_err)?;
        info!(file = %entry.file_id, out = %out.display(), "restore complete");
        Ok(out)
    }

    async fn fetch_chunk(&self, key: ChunkKey) -> Result<Vec<u8>, RestoreError> {
        let message = self.message(
            key.file_id,
            MessageKind::Getchunk {
                chunk_no: key.chunk_no,
            },
        )?;
        let bytes = encode_message(&message);
        let bytes = &bytes[..];
        let channel: &MulticastChannel = &self.channels.control;
        let action = PendingAction::new(Expectation::chunk(key), 1);
        let outcome = request(
            self.channels.restore.subscriptions(),
            action.clone(),
            &self.settings.retry,
            move |_| channel.send(bytes),
        )
        .await;
        let unavailable = RestoreError::ChunkUnavailable {
            chunk_no: key.chunk_no,
        };
        if !outcome.is_satisfied() {
            return Err(unavailable);
        }
        match action.take_reply().map(Message::into_kind) {
            Some(MessageKind::Chunk { data, .. }) => Ok(data),
            _ => Err(unavailable),
        }
    }

    /// Ask the group to drop every replica of a file this peer backed up.
    pub async fn delete(&self, path: &Path) -> Result<FileId, PeerError> {
        let entry = self
            .ctx
            .backed_up
            .by_path(path)
            .ok_or_else(|| PeerError::NotBackedUp(path.to_path_buf()))?;
        self.delete_file(entry.file_id).await;
        self.persist();
        info!(path = %path.display(), file = %entry.file_id, "deleted");
        Ok(entry.file_id)
    }

    /// DELETE has no acknowledgement, so it is sent several times.
    async fn delete_file(&self, file_id: FileId) {
        match self.message(file_id, MessageKind::Delete) {
            Ok(message) => {
                let bytes = encode_message(&message);
                for repeat in 0..self.settings.delete_repeats {
                    if repeat > 0 {
                        tokio::time::sleep(self.settings.retry.initial_interval).await;
                    }
                    if let Err(e) = self.channels.control.send(&bytes).await {
                        warn!(file = %file_id, error = %e, "DELETE not sent");
                    }
                }
            }
            Err(e) => warn!(file = %file_id, error = %e, "cannot build DELETE"),
        }
        self.ctx.backed_up.remove(file_id);
        self.ctx.records.forget_file(file_id);
    }

    /// Shrink the space offered to other peers, evicting replicas with the
    /// most surplus replication first. Returns the evicted chunks.
    pub async fn reclaim(&self, capacity: u64) -> Result<Vec<ChunkKey>, PeerError> {
        let storage = &self.ctx.storage;
        storage.set_capacity(capacity);
        *self.reclaimed_capacity.lock() = Some(capacity);
        let mut evicted = Vec::new();
        while storage.used_bytes() > storage.capacity() {
            let Some(key) = pick_eviction(&storage.list(), &self.ctx.records) else {
                break;
            };
            storage.remove(&key)?;
            self.ctx
                .records
                .remove_holder(key.file_id, key.chunk_no, self.id());
            match self.message(
                key.file_id,
                MessageKind::Removed {
                    chunk_no: key.chunk_no,
                },
            ) {
                Ok(m) => {
                    if let Err(e) = self.channels.control.send_message(&m).await {
                        warn!(chunk = %key, error = %e, "REMOVED not sent");
                    }
                }
                Err(e) => warn!(chunk = %key, error = %e, "cannot build REMOVED"),
            }
            evicted.push(key);
        }
        self.persist();
        info!(capacity, used = storage.used_bytes(), evicted = evicted.len(), "reclaimed");
        Ok(evicted)
    }

    async fn run_outbound(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<OutboundAction>) {
        while let Some(action) = rx.recv().await {
            let peer = self.clone();
            tokio::spawn(async move { peer.execute(action).await });
        }
    }

    async fn execute(&self, action: OutboundAction) {
        match action {
            OutboundAction::Send {
                channel,
                message,
                delay,
                suppress,
            } => {
                tokio::time::sleep(delay).await;
                if let Some(s) = suppress {
                    if self.ctx.sightings.seen_since(s.message_type, s.key, s.since) {
                        debug!(chunk = %s.key, kind = %s.message_type, "reply suppressed");
                        return;
                    }
                }
                if let Err(e) = self.channels.get(channel).send_message(&message).await {
                    warn!(error = %e, "reply not sent");
                }
            }
            OutboundAction::Rebackup {
                key,
                replication_degree,
                delay,
                since,
            } => {
                tokio::time::sleep(delay).await;
                if self
                    .ctx
                    .sightings
                    .seen_since(MessageType::Putchunk, key, since)
                {
                    debug!(chunk = %key, "another peer is already re-replicating");
                    return;
                }
                let body = match self.ctx.storage.load(&key) {
                    Ok(Some(body)) => body,
                    Ok(None) => return,
                    Err(e) => {
                        warn!(chunk = %key, error = %e, "cannot read replica");
                        return;
                    }
                };
                info!(chunk = %key, degree = replication_degree, "re-replicating");
                // This peer is one of the holders already.
                let required = usize::from(replication_degree).saturating_sub(1).max(1);
                match self
                    .backup_chunk(key, body, replication_degree, required)
                    .await
                {
                    Ok(n) => info!(chunk = %key, stored = n, "re-replicated"),
                    Err(e) => warn!(chunk = %key, error = %e, "re-replication incomplete"),
                }
            }
        }
    }

    fn message(&self, file_id: FileId, kind: MessageKind) -> Result<Message, ValidationError> {
        Message::from_parts(self.settings.local.version, self.id(), file_id, kind)
    }

    /// Write metadata.json.
    pub fn save(&self) -> io::Result<()> {
        let _guard = self.metadata_lock.lock();
        let metadata = Metadata::capture(
            &self.ctx.backed_up,
            &self.ctx.records,
            *self.reclaimed_capacity.lock(),
        );
        save_metadata(&self.settings.storage_dir.join(METADATA_FILE), &metadata)
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to save metadata");
        }
    }
}

/// Replica to evict next: largest surplus over the desired degree, larger
/// chunks first on ties.
pub fn pick_eviction(stored: &[(ChunkKey, usize)], records: &ChunkRecordStore) -> Option<ChunkKey> {
    stored
        .iter()
        .max_by_key(|(key, size)| {
            let (perceived, desired) = records
                .get(key)
                .map(|r| (r.replication_degree(), r.desired_degree()))
                .unwrap_or((0, None));
            let surplus = perceived as i64 - i64::from(desired.unwrap_or(0));
            (surplus, *size)
        })
        .map(|(key, _)| *key)
}

pub fn save_metadata(path: &Path, metadata: &Metadata) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(metadata).map_err(io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

pub fn load_metadata(path: &Path) -> anyhow::Result<Option<Metadata>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .with_context(|| format!("parsing {}", path.display())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}
