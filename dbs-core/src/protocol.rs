//! Backup protocol: message types, per-type grammar and version.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkKey;
use crate::identity::{FileId, PeerId};

/// Current protocol version. Sent in every header.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0);

/// Largest datagram a channel will send or receive.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Largest chunk this peer cuts a file into; leaves room for the header
/// inside one datagram. Incoming bodies may be larger as long as the whole
/// message fits the datagram.
pub const MAX_CHUNK_SIZE: usize = 64_000;

/// Chunk numbers are at most six decimal digits on the wire.
pub const MAX_CHUNK_NO: u32 = 999_999;

/// Replication degree is a single digit on the wire.
pub const MAX_REPLICATION_DEGREE: u8 = 9;

/// Protocol version as `<digit>.<digit>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    major: u8,
    minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    pub fn major(&self) -> u8 {
        self.major
    }

    pub fn minor(&self) -> u8 {
        self.minor
    }

    /// Parse the wire form. Exactly one digit, a dot, one digit.
    pub fn parse(s: &str) -> Option<Self> {
        match s.as_bytes() {
            [maj, b'.', min] if maj.is_ascii_digit() && min.is_ascii_digit() => {
                Some(Self::new(maj - b'0', min - b'0'))
            }
            _ => None,
        }
    }

    fn is_wire_representable(&self) -> bool {
        self.major <= 9 && self.minor <= 9
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Message type keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Putchunk,
    Stored,
    Getchunk,
    Chunk,
    Delete,
    Removed,
}

impl MessageType {
    pub fn keyword(self) -> &'static str {
        self.grammar().keyword
    }

    pub fn from_keyword(keyword: &str) -> Option<Self> {
        GRAMMAR
            .iter()
            .find(|g| g.keyword == keyword)
            .map(|g| g.message_type)
    }

    pub fn grammar(self) -> &'static Grammar {
        // GRAMMAR is indexed in declaration order.
        &GRAMMAR[self as usize]
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Header layout of one message type: which optional fields follow the file
/// id, and whether a body follows the terminator.
#[derive(Debug)]
pub struct Grammar {
    pub message_type: MessageType,
    pub keyword: &'static str,
    pub chunk_no: bool,
    pub replication_degree: bool,
    pub body: bool,
}

impl Grammar {
    /// Number of space-separated header fields, keyword included.
    pub fn field_count(&self) -> usize {
        4 + usize::from(self.chunk_no) + usize::from(self.replication_degree)
    }
}

/// One entry per message type, in `MessageType` declaration order.
pub static GRAMMAR: [Grammar; 6] = [
    Grammar {
        message_type: MessageType::Putchunk,
        keyword: "PUTCHUNK",
        chunk_no: true,
        replication_degree: true,
        body: true,
    },
    Grammar {
        message_type: MessageType::Stored,
        keyword: "STORED",
        chunk_no: true,
        replication_degree: false,
        body: false,
    },
    Grammar {
        message_type: MessageType::Getchunk,
        keyword: "GETCHUNK",
        chunk_no: true,
        replication_degree: false,
        body: false,
    },
    Grammar {
        message_type: MessageType::Chunk,
        keyword: "CHUNK",
        chunk_no: true,
        replication_degree: false,
        body: true,
    },
    Grammar {
        message_type: MessageType::Delete,
        keyword: "DELETE",
        chunk_no: false,
        replication_degree: false,
        body: false,
    },
    Grammar {
        message_type: MessageType::Removed,
        keyword: "REMOVED",
        chunk_no: true,
        replication_degree: false,
        body: false,
    },
];

/// Type-specific fields. Each variant carries only what its grammar allows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Store a replica of this chunk. Sent on the backup channel.
    Putchunk {
        chunk_no: u32,
        replication_degree: u8,
        data: Vec<u8>,
    },
    /// Acknowledge that the sender holds a replica. Control channel.
    Stored { chunk_no: u32 },
    /// Ask any holder to send the chunk back. Control channel.
    Getchunk { chunk_no: u32 },
    /// Chunk contents in reply to GETCHUNK. Restore channel.
    Chunk { chunk_no: u32, data: Vec<u8> },
    /// Drop every chunk of the file. Control channel.
    Delete,
    /// The sender evicted its replica. Control channel.
    Removed { chunk_no: u32 },
}

impl MessageKind {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageKind::Putchunk { .. } => MessageType::Putchunk,
            MessageKind::Stored { .. } => MessageType::Stored,
            MessageKind::Getchunk { .. } => MessageType::Getchunk,
            MessageKind::Chunk { .. } => MessageType::Chunk,
            MessageKind::Delete => MessageType::Delete,
            MessageKind::Removed { .. } => MessageType::Removed,
        }
    }

    pub fn chunk_no(&self) -> Option<u32> {
        match self {
            MessageKind::Putchunk { chunk_no, .. }
            | MessageKind::Stored { chunk_no }
            | MessageKind::Getchunk { chunk_no }
            | MessageKind::Chunk { chunk_no, .. }
            | MessageKind::Removed { chunk_no } => Some(*chunk_no),
            MessageKind::Delete => None,
        }
    }
}

/// A protocol message. Build with [`Message::new`] / [`Message::from_parts`]
/// (validated) or obtain one from [`crate::wire::decode_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    version: Version,
    sender: PeerId,
    file_id: FileId,
    kind: MessageKind,
}

impl Message {
    /// Build a message from a wire-form file id.
    pub fn new(
        version: Version,
        sender: PeerId,
        file_id: &str,
        kind: MessageKind,
    ) -> Result<Self, ValidationError> {
        let file_id = FileId::parse(file_id)?;
        Self::from_parts(version, sender, file_id, kind)
    }

    /// Build a message, checking every field fits its wire representation.
    pub fn from_parts(
        version: Version,
        sender: PeerId,
        file_id: FileId,
        kind: MessageKind,
    ) -> Result<Self, ValidationError> {
        if !version.is_wire_representable() {
            return Err(ValidationError::Version(version));
        }
        if let Some(chunk_no) = kind.chunk_no() {
            if chunk_no > MAX_CHUNK_NO {
                return Err(ValidationError::ChunkNo(chunk_no));
            }
        }
        match &kind {
            MessageKind::Putchunk {
                replication_degree,
                ..
            } => {
                if *replication_degree == 0 || *replication_degree > MAX_REPLICATION_DEGREE {
                    return Err(ValidationError::ReplicationDegree(*replication_degree));
                }
            }
            _ => {}
        }
        let msg = Self {
            version,
            sender,
            file_id,
            kind,
        };
        if let Some(data) = msg.data() {
            if data.len() > MAX_DATAGRAM_SIZE.saturating_sub(msg.header_len()) {
                return Err(ValidationError::BodyTooLarge(data.len()));
            }
        }
        Ok(msg)
    }

    /// Encoded header length, blank line included.
    pub fn header_len(&self) -> usize {
        let chunk_no = self.chunk_no().map_or(0, |n| 1 + n.to_string().len());
        let degree = match self.kind {
            MessageKind::Putchunk { .. } => 2,
            _ => 0,
        };
        self.message_type().keyword().len()
            + 1
            + self.version.to_string().len()
            + 1
            + self.sender.to_string().len()
            + 1
            + 64
            + chunk_no
            + degree
            + 4
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn sender(&self) -> PeerId {
        self.sender
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn into_kind(self) -> MessageKind {
        self.kind
    }

    pub fn message_type(&self) -> MessageType {
        self.kind.message_type()
    }

    pub fn chunk_no(&self) -> Option<u32> {
        self.kind.chunk_no()
    }

    /// Chunk this message refers to; `None` for whole-file messages.
    pub fn chunk_key(&self) -> Option<ChunkKey> {
        self.chunk_no().map(|n| ChunkKey::new(self.file_id, n))
    }

    /// Body bytes for PUTCHUNK and CHUNK.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.kind {
            MessageKind::Putchunk { data, .. } | MessageKind::Chunk { data, .. } => Some(data),
            _ => None,
        }
    }
}

/// A message value could not be built from the given fields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("file identifier is empty")]
    EmptyFileId,
    #[error("file identifier {0:?} is not 64 lowercase hex characters")]
    InvalidFileId(String),
    #[error("version {0} does not fit <digit>.<digit>")]
    Version(Version),
    #[error("chunk number {0} exceeds 999999")]
    ChunkNo(u32),
    #[error("replication degree {0} outside 1..=9")]
    ReplicationDegree(u8),
    #[error("chunk body of {0} bytes exceeds 64000")]
    BodyTooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

    #[test]
    fn grammar_table_matches_declaration_order() {
        for (i, g) in GRAMMAR.iter().enumerate() {
            assert_eq!(g.message_type as usize, i);
            assert_eq!(MessageType::from_keyword(g.keyword), Some(g.message_type));
        }
        assert_eq!(MessageType::from_keyword("putchunk"), None);
    }

    #[test]
    fn field_counts() {
        assert_eq!(MessageType::Putchunk.grammar().field_count(), 6);
        assert_eq!(MessageType::Stored.grammar().field_count(), 5);
        assert_eq!(MessageType::Delete.grammar().field_count(), 4);
    }

    #[test]
    fn version_parse() {
        assert_eq!(Version::parse("1.0"), Some(PROTOCOL_VERSION));
        assert_eq!(Version::parse("2.1").map(|v| v.to_string()), Some("2.1".into()));
        assert_eq!(Version::parse("10.0"), None);
        assert_eq!(Version::parse("1"), None);
        assert_eq!(Version::parse("a.b"), None);
    }

    #[test]
    fn empty_file_id_is_validation_error() {
        let r = Message::new(PROTOCOL_VERSION, PeerId(1), "", MessageKind::Delete);
        assert_eq!(r, Err(ValidationError::EmptyFileId));
    }

    #[test]
    fn putchunk_degree_bounds() {
        let mk = |d| {
            Message::new(
                PROTOCOL_VERSION,
                PeerId(1),
                FILE,
                MessageKind::Putchunk {
                    chunk_no: 0,
                    replication_degree: d,
                    data: vec![],
                },
            )
        };
        assert!(mk(1).is_ok());
        assert!(mk(9).is_ok());
        assert_eq!(mk(0), Err(ValidationError::ReplicationDegree(0)));
        assert_eq!(mk(10), Err(ValidationError::ReplicationDegree(10)));
    }

    #[test]
    fn chunk_no_and_body_limits() {
        let too_far = Message::new(
            PROTOCOL_VERSION,
            PeerId(1),
            FILE,
            MessageKind::Getchunk {
                chunk_no: MAX_CHUNK_NO + 1,
            },
        );
        assert!(matches!(too_far, Err(ValidationError::ChunkNo(_))));

        let too_big = Message::new(
            PROTOCOL_VERSION,
            PeerId(1),
            FILE,
            MessageKind::Chunk {
                chunk_no: 0,
                data: vec![0; MAX_DATAGRAM_SIZE],
            },
        );
        assert!(matches!(too_big, Err(ValidationError::BodyTooLarge(_))));
    }

    #[test]
    fn accessors() {
        let m = Message::new(
            PROTOCOL_VERSION,
            PeerId(7),
            FILE,
            MessageKind::Chunk {
                chunk_no: 3,
                data: b"abc".to_vec(),
            },
        )
        .unwrap();
        assert_eq!(m.message_type(), MessageType::Chunk);
        assert_eq!(m.chunk_no(), Some(3));
        assert_eq!(m.data(), Some(&b"abc"[..]));
        assert_eq!(m.chunk_key().map(|k| k.chunk_no), Some(3));
        assert_eq!(m.sender(), PeerId(7));
    }
}
