//! Pending actions: "I sent request R and wait for matching replies".
//!
//! Each channel keeps a copy-on-write list of subscribed actions. The receive
//! path takes a snapshot per datagram and offers the decoded message to the
//! first pending action whose expectation matches it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::chunk::ChunkKey;
use crate::identity::{FileId, PeerId};
use crate::protocol::{Message, MessageType};

/// Process-unique action handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(u64);

static NEXT_ACTION_ID: AtomicU64 = AtomicU64::new(1);

impl ActionId {
    fn next() -> Self {
        ActionId(NEXT_ACTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Predicate describing a matching reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expectation {
    pub message_type: MessageType,
    pub file_id: FileId,
    pub chunk_no: Option<u32>,
}

impl Expectation {
    /// STORED acknowledgements for a chunk being backed up.
    pub fn stored(key: ChunkKey) -> Self {
        Self {
            message_type: MessageType::Stored,
            file_id: key.file_id,
            chunk_no: Some(key.chunk_no),
        }
    }

    /// CHUNK reply to a GETCHUNK.
    pub fn chunk(key: ChunkKey) -> Self {
        Self {
            message_type: MessageType::Chunk,
            file_id: key.file_id,
            chunk_no: Some(key.chunk_no),
        }
    }

    pub fn matches(&self, msg: &Message) -> bool {
        msg.message_type() == self.message_type
            && msg.file_id() == self.file_id
            && msg.chunk_no() == self.chunk_no
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    Satisfied,
    Expired,
}

/// Result of offering a message to an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Not a match, or the action is no longer pending.
    Ignored,
    /// Counted, but more distinct replies are needed.
    Progress,
    /// This reply completed the action.
    Satisfied,
}

#[derive(Debug, Default)]
struct Replies {
    responders: BTreeSet<PeerId>,
    first_reply: Option<Message>,
}

/// An outstanding request. Satisfied once `required` distinct peers have
/// sent a matching reply.
#[derive(Debug)]
pub struct PendingAction {
    id: ActionId,
    expectation: Expectation,
    required: usize,
    replies: Mutex<Replies>,
    status: watch::Sender<ActionStatus>,
}

impl PendingAction {
    pub fn new(expectation: Expectation, required: usize) -> Arc<Self> {
        let (status, _) = watch::channel(ActionStatus::Pending);
        Arc::new(Self {
            id: ActionId::next(),
            expectation,
            required: required.max(1),
            replies: Mutex::new(Replies::default()),
            status,
        })
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn expectation(&self) -> &Expectation {
        &self.expectation
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn status(&self) -> ActionStatus {
        *self.status.borrow()
    }

    pub fn is_pending(&self) -> bool {
        self.status() == ActionStatus::Pending
    }

    /// Distinct peers that replied so far.
    pub fn responders(&self) -> BTreeSet<PeerId> {
        self.replies.lock().responders.clone()
    }

    /// The first matching reply, e.g. the CHUNK carrying the body.
    pub fn take_reply(&self) -> Option<Message> {
        self.replies.lock().first_reply.take()
    }

    /// Offer a dispatched message. Transitions happen under the replies lock
    /// so a late reply cannot race an expiry into a second completion.
    pub fn offer(&self, msg: &Message) -> Offer {
        if !self.expectation.matches(msg) {
            return Offer::Ignored;
        }
        let mut replies = self.replies.lock();
        if self.status() != ActionStatus::Pending {
            return Offer::Ignored;
        }
        replies.responders.insert(msg.sender());
        if replies.first_reply.is_none() {
            replies.first_reply = Some(msg.clone());
        }
        if replies.responders.len() >= self.required {
            self.status.send_replace(ActionStatus::Satisfied);
            Offer::Satisfied
        } else {
            Offer::Progress
        }
    }

    /// Mark the action failed. Returns false if it had already completed.
    pub fn expire(&self) -> bool {
        let _replies = self.replies.lock();
        if self.status() != ActionStatus::Pending {
            return false;
        }
        self.status.send_replace(ActionStatus::Expired);
        true
    }

    /// Wait until the action leaves `Pending`.
    pub async fn completed(&self) -> ActionStatus {
        let mut rx = self.status.subscribe();
        let result = rx
            .wait_for(|s| *s != ActionStatus::Pending)
            .await
            .map(|s| *s);
        // The sender lives in `self`, so the channel cannot close here.
        result.unwrap_or(ActionStatus::Expired)
    }
}

/// Point-in-time view of a channel's subscriptions.
pub type SubscriptionSnapshot = Arc<Vec<Arc<PendingAction>>>;

/// Live subscription list of one channel. Mutations copy the list when a
/// snapshot is outstanding; snapshots are never modified.
#[derive(Debug, Default)]
pub struct Subscriptions {
    live: RwLock<SubscriptionSnapshot>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, action: Arc<PendingAction>) {
        let mut live = self.live.write();
        Arc::make_mut(&mut *live).push(action);
    }

    /// Returns false if the action was not subscribed.
    pub fn unsubscribe(&self, id: ActionId) -> bool {
        let mut live = self.live.write();
        if !live.iter().any(|a| a.id == id) {
            return false;
        }
        Arc::make_mut(&mut *live).retain(|a| a.id != id);
        true
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        self.live.read().clone()
    }

    pub fn len(&self) -> usize {
        self.live.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Offer `msg` to the first pending action in `snapshot` that expects it.
/// At most one action receives the message.
pub fn offer_to_first(
    snapshot: &[Arc<PendingAction>],
    msg: &Message,
) -> Option<(Arc<PendingAction>, Offer)> {
    snapshot
        .iter()
        .filter(|a| a.expectation.matches(msg) && a.is_pending())
        .find_map(|a| match a.offer(msg) {
            Offer::Ignored => None,
            offer => Some((a.clone(), offer)),
        })
}
