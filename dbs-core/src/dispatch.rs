//! Message handlers. Host-driven: a handler updates the shared bookkeeping
//! passed in its context and returns outbound actions for the host to run.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::action::{offer_to_first, ActionId, Offer, SubscriptionSnapshot, Subscriptions};
use crate::chunk::{ChunkKey, ChunkRecordStore};
use crate::identity::PeerId;
use crate::protocol::{Message, MessageKind, MessageType, Version};
use crate::registry::BackedUpFiles;
use crate::storage::ChunkStorage;

/// Sightings older than this are dropped when the table grows.
const SIGHTING_TTL: Duration = Duration::from_secs(60);
const SIGHTING_PRUNE_THRESHOLD: usize = 4096;

/// The three multicast channels of a backup group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// MC: STORED, GETCHUNK, DELETE, REMOVED.
    Control,
    /// MDB: PUTCHUNK.
    Backup,
    /// MDR: CHUNK.
    Restore,
}

impl ChannelKind {
    pub fn for_message(message_type: MessageType) -> Self {
        match message_type {
            MessageType::Putchunk => ChannelKind::Backup,
            MessageType::Chunk => ChannelKind::Restore,
            MessageType::Stored
            | MessageType::Getchunk
            | MessageType::Delete
            | MessageType::Removed => ChannelKind::Control,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelKind::Control => "MC",
            ChannelKind::Backup => "MDB",
            ChannelKind::Restore => "MDR",
        })
    }
}

/// Identity the handlers answer with.
#[derive(Debug, Clone, Copy)]
pub struct LocalPeer {
    pub id: PeerId,
    pub version: Version,
}

/// When messages of some type were last seen for a chunk. Lets a delayed
/// reply back off if another peer answered first.
#[derive(Debug, Default)]
pub struct Sightings {
    seen: Mutex<HashMap<(MessageType, ChunkKey), Instant>>,
}

impl Sightings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, message_type: MessageType, key: ChunkKey) {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        if seen.len() >= SIGHTING_PRUNE_THRESHOLD {
            seen.retain(|_, t| now.duration_since(*t) < SIGHTING_TTL);
        }
        seen.insert((message_type, key), now);
    }

    pub fn seen_since(&self, message_type: MessageType, key: ChunkKey, since: Instant) -> bool {
        self.seen
            .lock()
            .get(&(message_type, key))
            .is_some_and(|t| *t >= since)
    }
}

/// Everything a handler may read or update. Owned by the peer, shared with
/// every pool worker.
pub struct DispatchContext {
    pub local: LocalPeer,
    pub records: Arc<ChunkRecordStore>,
    pub backed_up: Arc<BackedUpFiles>,
    pub storage: Arc<dyn ChunkStorage>,
    pub sightings: Arc<Sightings>,
    /// Upper bound of the random wait before STORED, CHUNK and re-backup.
    pub max_reply_delay: Duration,
}

impl DispatchContext {
    fn reply_delay(&self) -> Duration {
        let max = self.max_reply_delay.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    fn build(&self, key: ChunkKey, kind: MessageKind) -> Option<Message> {
        match Message::from_parts(self.local.version, self.local.id, key.file_id, kind) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(chunk = %key, error = %e, "cannot build reply");
                None
            }
        }
    }
}

/// One received datagram, ready for a pool worker.
pub struct DispatchTask {
    pub channel: ChannelKind,
    pub message: Message,
    /// Subscriptions of `channel` at receive time.
    pub snapshot: SubscriptionSnapshot,
    /// Live list of `channel`, for unsubscribing a satisfied action.
    pub subscriptions: Arc<Subscriptions>,
}

/// Condition under which a delayed send is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suppression {
    pub message_type: MessageType,
    pub key: ChunkKey,
    pub since: Instant,
}

/// Work for the host after a handler ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Send `message` on `channel` after `delay`, unless `suppress` was seen
    /// in the meantime.
    Send {
        channel: ChannelKind,
        message: Message,
        delay: Duration,
        suppress: Option<Suppression>,
    },
    /// Back up a locally stored replica again because the group lost one.
    /// Skipped if another peer's PUTCHUNK for the chunk shows up first.
    Rebackup {
        key: ChunkKey,
        replication_degree: u8,
        delay: Duration,
        since: Instant,
    },
}

#[derive(Debug, Default)]
pub struct Dispatched {
    /// Action completed by this message and removed from its channel.
    pub satisfied: Option<ActionId>,
    pub outbound: Vec<OutboundAction>,
}

/// Handle one received message.
pub fn handle(ctx: &DispatchContext, task: DispatchTask) -> Dispatched {
    let DispatchTask {
        channel,
        message,
        snapshot,
        subscriptions,
    } = task;
    let mut out = Dispatched::default();

    // Multicast loops our own datagrams back.
    if message.sender() == ctx.local.id {
        trace!(%channel, kind = %message.message_type(), "own message");
        return out;
    }
    if message.version().major() != ctx.local.version.major() {
        debug!(%channel, version = %message.version(), "incompatible protocol version");
        return out;
    }

    if let Some((action, offer)) = offer_to_first(&snapshot, &message) {
        if offer == Offer::Satisfied {
            subscriptions.unsubscribe(action.id());
            out.satisfied = Some(action.id());
        }
    }

    let file_id = message.file_id();
    let sender = message.sender();
    match message.kind() {
        MessageKind::Putchunk {
            chunk_no,
            replication_degree,
            data,
        } => on_putchunk(
            ctx,
            ChunkKey::new(file_id, *chunk_no),
            *replication_degree,
            data,
            &mut out.outbound,
        ),
        MessageKind::Stored { chunk_no } => {
            if ctx.records.record_holder(file_id, *chunk_no, sender) {
                debug!(chunk = %ChunkKey::new(file_id, *chunk_no), peer = %sender, "new holder");
            }
        }
        MessageKind::Getchunk { chunk_no } => {
            on_getchunk(ctx, ChunkKey::new(file_id, *chunk_no), &mut out.outbound)
        }
        MessageKind::Chunk { chunk_no, .. } => {
            ctx.sightings
                .observe(MessageType::Chunk, ChunkKey::new(file_id, *chunk_no));
        }
        MessageKind::Delete => on_delete(ctx, &message),
        MessageKind::Removed { chunk_no } => on_removed(
            ctx,
            ChunkKey::new(file_id, *chunk_no),
            sender,
            &mut out.outbound,
        ),
    }
    out
}

fn on_putchunk(
    ctx: &DispatchContext,
    key: ChunkKey,
    replication_degree: u8,
    data: &[u8],
    outbound: &mut Vec<OutboundAction>,
) {
    ctx.sightings.observe(MessageType::Putchunk, key);
    if ctx.backed_up.contains(key.file_id) {
        debug!(chunk = %key, "not storing a chunk of our own file");
        return;
    }
    let record = ctx.records.create_or_get(key);
    record.init_desired_degree(replication_degree);

    let stored = ctx.storage.contains(&key)
        || match ctx.storage.store(key, data) {
            Ok(true) => true,
            Ok(false) => {
                debug!(chunk = %key, size = data.len(), "no space for chunk");
                false
            }
            Err(e) => {
                warn!(chunk = %key, error = %e, "failed to store chunk");
                false
            }
        };
    if !stored {
        return;
    }
    record.set_size(data.len());
    record.add_holder(ctx.local.id);
    if let Some(reply) = ctx.build(
        key,
        MessageKind::Stored {
            chunk_no: key.chunk_no,
        },
    ) {
        outbound.push(OutboundAction::Send {
            channel: ChannelKind::Control,
            message: reply,
            delay: ctx.reply_delay(),
            suppress: None,
        });
    }
}

fn on_getchunk(ctx: &DispatchContext, key: ChunkKey, outbound: &mut Vec<OutboundAction>) {
    if !ctx.storage.contains(&key) {
        return;
    }
    let data = match ctx.storage.load(&key) {
        Ok(Some(data)) => data,
        Ok(None) => return,
        Err(e) => {
            warn!(chunk = %key, error = %e, "failed to read chunk");
            return;
        }
    };
    if let Some(reply) = ctx.build(
        key,
        MessageKind::Chunk {
            chunk_no: key.chunk_no,
            data,
        },
    ) {
        outbound.push(OutboundAction::Send {
            channel: ChannelKind::Restore,
            message: reply,
            delay: ctx.reply_delay(),
            suppress: Some(Suppression {
                message_type: MessageType::Chunk,
                key,
                since: Instant::now(),
            }),
        });
    }
}

fn on_delete(ctx: &DispatchContext, message: &Message) {
    let file_id = message.file_id();
    if ctx.backed_up.contains(file_id) {
        debug!(file = %file_id, "ignoring DELETE for a file we own");
        return;
    }
    match ctx.storage.remove_file(file_id) {
        Ok(n) if n > 0 => debug!(file = %file_id, chunks = n, "deleted replicas"),
        Ok(_) => {}
        Err(e) => warn!(file = %file_id, error = %e, "failed to delete replicas"),
    }
    ctx.records.forget_file(file_id);
}

fn on_removed(
    ctx: &DispatchContext,
    key: ChunkKey,
    sender: PeerId,
    outbound: &mut Vec<OutboundAction>,
) {
    ctx.records
        .remove_holder(key.file_id, key.chunk_no, sender);
    if !ctx.storage.contains(&key) {
        return;
    }
    let Some(record) = ctx.records.get(&key) else {
        return;
    };
    let Some(desired) = record.desired_degree() else {
        return;
    };
    if record.replication_degree() < usize::from(desired) {
        debug!(chunk = %key, have = record.replication_degree(), desired, "degree dropped");
        outbound.push(OutboundAction::Rebackup {
            key,
            replication_degree: desired,
            delay: ctx.reply_delay(),
            since: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionStatus, Expectation, PendingAction};
    use crate::identity::FileId;
    use crate::protocol::PROTOCOL_VERSION;
    use crate::registry::BackedUpFile;
    use crate::storage::MemoryStorage;
    use crate::wire::{decode_message, encode_message};

    const FILE: &str = "a3f1c0d2e4b5968778695a4b3c2d1e0f0e1d2c3b4a5968778695a4b3c2d1e0f9";

    struct TestPeer {
        ctx: DispatchContext,
        control: Arc<Subscriptions>,
        restore: Arc<Subscriptions>,
    }

    impl TestPeer {
        fn new(id: u32) -> Self {
            Self::with_capacity(id, 1 << 20)
        }

        fn with_capacity(id: u32, capacity: u64) -> Self {
            Self {
                ctx: DispatchContext {
                    local: LocalPeer {
                        id: PeerId(id),
                        version: PROTOCOL_VERSION,
                    },
                    records: Arc::new(ChunkRecordStore::new()),
                    backed_up: Arc::new(BackedUpFiles::new()),
                    storage: Arc::new(MemoryStorage::new(capacity)),
                    sightings: Arc::new(Sightings::new()),
                    max_reply_delay: Duration::from_millis(400),
                },
                control: Arc::new(Subscriptions::new()),
                restore: Arc::new(Subscriptions::new()),
            }
        }

        /// Deliver raw bytes as if they arrived on `channel`.
        fn deliver(&self, channel: ChannelKind, bytes: &[u8]) -> Dispatched {
            let subscriptions = match channel {
                ChannelKind::Restore => self.restore.clone(),
                _ => self.control.clone(),
            };
            let task = DispatchTask {
                channel,
                message: decode_message(bytes).unwrap(),
                snapshot: subscriptions.snapshot(),
                subscriptions,
            };
            handle(&self.ctx, task)
        }
    }

    fn file_id() -> FileId {
        FileId::parse(FILE).unwrap()
    }

    fn message(sender: u32, kind: MessageKind) -> Vec<u8> {
        encode_message(&Message::new(PROTOCOL_VERSION, PeerId(sender), FILE, kind).unwrap())
    }

    fn sent(out: &Dispatched) -> Vec<(ChannelKind, Message)> {
        out.outbound
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Send {
                    channel, message, ..
                } => Some((*channel, message.clone())),
                _ => None,
            })
            .collect()
    }

    fn putchunk(sender: u32, degree: u8, body: &[u8]) -> Vec<u8> {
        message(
            sender,
            MessageKind::Putchunk {
                chunk_no: 0,
                replication_degree: degree,
                data: body.to_vec(),
            },
        )
    }

    #[test]
    fn putchunk_answered_by_two_peers_reaches_degree() {
        let a = TestPeer::new(1);
        let b = TestPeer::new(2);
        let c = TestPeer::new(3);
        let key = ChunkKey::new(file_id(), 0);

        // A initiates the backup.
        a.ctx.backed_up.insert(BackedUpFile {
            file_id: file_id(),
            path: "/tmp/f".into(),
            size: 4,
            chunk_count: 1,
            replication_degree: 2,
        });
        a.ctx.records.create_or_get(key).init_desired_degree(2);
        let action = PendingAction::new(Expectation::stored(key), 2);
        a.control.subscribe(action.clone());

        let put = putchunk(1, 2, b"body");
        let mut replies = Vec::new();
        for peer in [&b, &c] {
            let out = peer.deliver(ChannelKind::Backup, &put);
            let msgs = sent(&out);
            assert_eq!(msgs.len(), 1);
            assert_eq!(msgs[0].0, ChannelKind::Control);
            assert_eq!(msgs[0].1.message_type(), MessageType::Stored);
            replies.push(encode_message(&msgs[0].1));
        }

        let first = a.deliver(ChannelKind::Control, &replies[0]);
        assert_eq!(first.satisfied, None);
        let second = a.deliver(ChannelKind::Control, &replies[1]);
        assert_eq!(second.satisfied, Some(action.id()));
        assert_eq!(action.status(), ActionStatus::Satisfied);
        assert!(a.control.is_empty());

        let record = a.ctx.records.get(&key).unwrap();
        assert_eq!(
            record.holders().into_iter().collect::<Vec<_>>(),
            vec![PeerId(2), PeerId(3)]
        );
        assert_eq!(a.ctx.records.replication_degree(file_id(), 0), 2);
        assert_eq!(a.ctx.records.desired_degree(file_id(), 0), Some(2));
    }

    #[test]
    fn stored_reply_layout() {
        let b = TestPeer::new(2);
        let out = b.deliver(ChannelKind::Backup, &putchunk(1, 2, b"x"));
        let bytes = encode_message(&sent(&out)[0].1);
        assert_eq!(bytes, format!("STORED 1.0 2 {} 0\r\n\r\n", FILE).as_bytes());
        match &out.outbound[0] {
            OutboundAction::Send { delay, .. } => assert!(*delay <= Duration::from_millis(400)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn duplicate_putchunk_is_idempotent() {
        let b = TestPeer::new(2);
        let put = putchunk(1, 1, &[7; 100]);
        assert_eq!(sent(&b.deliver(ChannelKind::Backup, &put)).len(), 1);
        assert_eq!(sent(&b.deliver(ChannelKind::Backup, &put)).len(), 1);
        assert_eq!(b.ctx.storage.used_bytes(), 100);
        assert_eq!(b.ctx.records.replication_degree(file_id(), 0), 1);
    }

    #[test]
    fn putchunk_without_space_is_not_acknowledged() {
        let b = TestPeer::with_capacity(2, 10);
        let out = b.deliver(ChannelKind::Backup, &putchunk(1, 3, &[0; 11]));
        assert!(out.outbound.is_empty());
        assert_eq!(b.ctx.records.desired_degree(file_id(), 0), Some(3));
        assert_eq!(b.ctx.records.replication_degree(file_id(), 0), 0);
    }

    #[test]
    fn own_messages_and_own_files_are_ignored() {
        let a = TestPeer::new(1);
        let out = a.deliver(ChannelKind::Backup, &putchunk(1, 1, b"x"));
        assert!(out.outbound.is_empty());
        assert!(a.ctx.records.is_empty());

        a.ctx.backed_up.insert(BackedUpFile {
            file_id: file_id(),
            path: "/tmp/f".into(),
            size: 1,
            chunk_count: 1,
            replication_degree: 1,
        });
        let out = a.deliver(ChannelKind::Backup, &putchunk(9, 1, b"x"));
        assert!(out.outbound.is_empty());
        assert_eq!(a.ctx.storage.used_bytes(), 0);
    }

    #[test]
    fn getchunk_without_chunk_is_silent() {
        let b = TestPeer::new(2);
        let get = message(4, MessageKind::Getchunk { chunk_no: 0 });
        let out = b.deliver(ChannelKind::Control, &get);
        assert!(out.outbound.is_empty());
        assert!(b.ctx.records.is_empty());
    }

    #[test]
    fn getchunk_with_chunk_replies_on_restore_channel() {
        let b = TestPeer::new(2);
        b.deliver(ChannelKind::Backup, &putchunk(1, 1, b"payload"));
        let before = b.ctx.records.snapshot();

        let get = message(4, MessageKind::Getchunk { chunk_no: 0 });
        let out = b.deliver(ChannelKind::Control, &get);
        let msgs = sent(&out);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].0, ChannelKind::Restore);
        let bytes = encode_message(&msgs[0].1);
        assert_eq!(
            bytes,
            format!("CHUNK 1.0 2 {} 0\r\n\r\npayload", FILE).as_bytes()
        );
        assert_eq!(b.ctx.records.snapshot(), before);
        match &out.outbound[0] {
            OutboundAction::Send {
                suppress: Some(s), ..
            } => assert_eq!(s.message_type, MessageType::Chunk),
            other => panic!("expected suppressible send, got {:?}", other),
        }
    }

    #[test]
    fn chunk_sighting_suppresses_pending_reply() {
        let b = TestPeer::new(2);
        let since = Instant::now();
        let key = ChunkKey::new(file_id(), 0);
        assert!(!b.ctx.sightings.seen_since(MessageType::Chunk, key, since));
        let chunk = message(
            3,
            MessageKind::Chunk {
                chunk_no: 0,
                data: b"x".to_vec(),
            },
        );
        b.deliver(ChannelKind::Restore, &chunk);
        assert!(b.ctx.sightings.seen_since(MessageType::Chunk, key, since));
    }

    #[test]
    fn chunk_satisfies_restore_action() {
        let a = TestPeer::new(1);
        let key = ChunkKey::new(file_id(), 0);
        let action = PendingAction::new(Expectation::chunk(key), 1);
        a.restore.subscribe(action.clone());
        let chunk = message(
            3,
            MessageKind::Chunk {
                chunk_no: 0,
                data: b"abc".to_vec(),
            },
        );
        let out = a.deliver(ChannelKind::Restore, &chunk);
        assert_eq!(out.satisfied, Some(action.id()));
        assert_eq!(
            action.take_reply().and_then(|m| m.data().map(|d| d.to_vec())),
            Some(b"abc".to_vec())
        );
        // A duplicate reply from another holder completes nothing.
        let dup = message(
            4,
            MessageKind::Chunk {
                chunk_no: 0,
                data: b"abc".to_vec(),
            },
        );
        assert_eq!(a.deliver(ChannelKind::Restore, &dup).satisfied, None);
    }

    #[test]
    fn stored_after_expiry_still_updates_records() {
        let a = TestPeer::new(1);
        let key = ChunkKey::new(file_id(), 0);
        let action = PendingAction::new(Expectation::stored(key), 1);
        a.control.subscribe(action.clone());
        action.expire();
        a.control.unsubscribe(action.id());

        let stored = message(2, MessageKind::Stored { chunk_no: 0 });
        let out = a.deliver(ChannelKind::Control, &stored);
        assert_eq!(out.satisfied, None);
        assert_eq!(action.status(), ActionStatus::Expired);
        assert_eq!(a.ctx.records.replication_degree(file_id(), 0), 1);
    }

    #[test]
    fn delete_drops_replicas_and_records() {
        let b = TestPeer::new(2);
        b.deliver(ChannelKind::Backup, &putchunk(1, 1, b"x"));
        assert!(b.ctx.storage.used_bytes() > 0);
        b.deliver(ChannelKind::Control, &message(1, MessageKind::Delete));
        assert_eq!(b.ctx.storage.used_bytes(), 0);
        assert!(b.ctx.records.is_empty());
    }

    #[test]
    fn removed_below_desired_triggers_rebackup() {
        let b = TestPeer::new(2);
        b.deliver(ChannelKind::Backup, &putchunk(1, 2, b"x"));
        b.deliver(
            ChannelKind::Control,
            &message(3, MessageKind::Stored { chunk_no: 0 }),
        );
        assert_eq!(b.ctx.records.replication_degree(file_id(), 0), 2);

        let out = b.deliver(
            ChannelKind::Control,
            &message(3, MessageKind::Removed { chunk_no: 0 }),
        );
        assert_eq!(b.ctx.records.replication_degree(file_id(), 0), 1);
        assert!(matches!(
            out.outbound.as_slice(),
            [OutboundAction::Rebackup {
                replication_degree: 2,
                ..
            }]
        ));
    }

    #[test]
    fn removed_at_desired_degree_does_nothing() {
        let b = TestPeer::new(2);
        b.deliver(ChannelKind::Backup, &putchunk(1, 1, b"x"));
        b.deliver(
            ChannelKind::Control,
            &message(3, MessageKind::Stored { chunk_no: 0 }),
        );
        let out = b.deliver(
            ChannelKind::Control,
            &message(3, MessageKind::Removed { chunk_no: 0 }),
        );
        assert!(out.outbound.is_empty());
    }

    #[test]
    fn channel_for_message_type() {
        assert_eq!(ChannelKind::for_message(MessageType::Putchunk), ChannelKind::Backup);
        assert_eq!(ChannelKind::for_message(MessageType::Chunk), ChannelKind::Restore);
        assert_eq!(ChannelKind::for_message(MessageType::Removed), ChannelKind::Control);
    }
}
