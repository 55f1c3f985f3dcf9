//! Distributed backup protocol core.
//! Host-driven: no sockets or files; the host feeds received messages in and
//! executes the outbound actions the handlers return.

pub mod action;
pub mod chunk;
pub mod dispatch;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod storage;
pub mod wire;

pub use action::{ActionStatus, Expectation, PendingAction, Subscriptions};
pub use chunk::{ChunkKey, ChunkRecordStore, RestoreState};
pub use dispatch::{handle, ChannelKind, DispatchContext, DispatchTask, OutboundAction};
pub use identity::{FileId, PeerId};
pub use protocol::{Message, MessageKind, MessageType, PROTOCOL_VERSION};
pub use retry::RetryPolicy;
pub use storage::{ChunkStorage, MemoryStorage};
pub use wire::{decode_message, encode_message, DecodeError};
