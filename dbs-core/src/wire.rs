//! Framing: one ASCII header line, a blank line, then the raw body.
//!
//! ```text
//! <TYPE> <VERSION> <SENDER_ID> <FILE_ID> [<CHUNK_NO>] [<REP_DEGREE>] CRLF CRLF [<BODY>]
//! ```
//!
//! The body is not length-prefixed: it runs to the end of the datagram.

use crate::identity::{FileId, PeerId};
use crate::protocol::{
    Message, MessageKind, MessageType, Version, MAX_DATAGRAM_SIZE, MAX_REPLICATION_DEGREE,
};

const CRLF: &str = "\r\n";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const MAX_CHUNK_NO_DIGITS: usize = 6;

/// Encode a message: header line, terminator, body. Never fails for a
/// validated `Message`.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut header = format!(
        "{} {} {} {}",
        msg.message_type().keyword(),
        msg.version(),
        msg.sender(),
        msg.file_id()
    );
    if let Some(chunk_no) = msg.chunk_no() {
        header.push(' ');
        header.push_str(&chunk_no.to_string());
    }
    if let MessageKind::Putchunk {
        replication_degree, ..
    } = msg.kind()
    {
        header.push(' ');
        header.push_str(&replication_degree.to_string());
    }
    header.push_str(CRLF);
    header.push_str(CRLF);

    let body = msg.data().unwrap_or_default();
    let mut out = Vec::with_capacity(header.len() + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    out
}

/// Decode one datagram. `bytes` must be exactly the received datagram, since
/// the body extends to its end.
pub fn decode_message(bytes: &[u8]) -> Result<Message, DecodeError> {
    let header_end = find_terminator(bytes).ok_or(MalformedReason::MissingTerminator)?;
    let header = &bytes[..header_end];
    if !header.is_ascii() {
        return Err(MalformedReason::NonAscii.into());
    }
    // ASCII is valid UTF-8.
    let header = std::str::from_utf8(header).map_err(|_| MalformedReason::NonAscii)?;
    // Extra header lines are tolerated and ignored.
    let first_line = header.split(CRLF).next().unwrap_or_default();
    let fields: Vec<&str> = first_line.split_ascii_whitespace().collect();

    let keyword = *fields.first().ok_or(MalformedReason::Empty)?;
    let message_type = MessageType::from_keyword(keyword)
        .ok_or_else(|| DecodeError::UnknownMessageType(keyword.to_string()))?;
    let grammar = message_type.grammar();
    if fields.len() != grammar.field_count() {
        return Err(MalformedReason::FieldCount {
            message_type,
            expected: grammar.field_count(),
            found: fields.len(),
        }
        .into());
    }

    let version =
        Version::parse(fields[1]).ok_or_else(|| MalformedReason::Version(fields[1].into()))?;
    let sender = parse_sender(fields[2])?;
    let file_id =
        FileId::parse(fields[3]).map_err(|_| MalformedReason::FileId(fields[3].into()))?;
    let chunk_no = if grammar.chunk_no {
        Some(parse_chunk_no(fields[4])?)
    } else {
        None
    };
    let replication_degree = if grammar.replication_degree {
        Some(parse_replication_degree(fields[5])?)
    } else {
        None
    };

    let body = &bytes[header_end + HEADER_TERMINATOR.len()..];
    if !grammar.body && !body.is_empty() {
        return Err(MalformedReason::UnexpectedBody(body.len()).into());
    }
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(MalformedReason::TooLarge(bytes.len()).into());
    }

    let kind = match (message_type, chunk_no, replication_degree) {
        (MessageType::Putchunk, Some(chunk_no), Some(replication_degree)) => {
            MessageKind::Putchunk {
                chunk_no,
                replication_degree,
                data: body.to_vec(),
            }
        }
        (MessageType::Stored, Some(chunk_no), None) => MessageKind::Stored { chunk_no },
        (MessageType::Getchunk, Some(chunk_no), None) => MessageKind::Getchunk { chunk_no },
        (MessageType::Chunk, Some(chunk_no), None) => MessageKind::Chunk {
            chunk_no,
            data: body.to_vec(),
        },
        (MessageType::Delete, None, None) => MessageKind::Delete,
        (MessageType::Removed, Some(chunk_no), None) => MessageKind::Removed { chunk_no },
        _ => {
            return Err(MalformedReason::FieldCount {
                message_type,
                expected: grammar.field_count(),
                found: fields.len(),
            }
            .into())
        }
    };
    Message::from_parts(version, sender, file_id, kind)
        .map_err(|e| MalformedReason::Invalid(e.to_string()).into())
}

fn find_terminator(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_sender(s: &str) -> Result<PeerId, MalformedReason> {
    if !all_digits(s) {
        return Err(MalformedReason::SenderId(s.into()));
    }
    s.parse::<u32>()
        .map(PeerId)
        .map_err(|_| MalformedReason::SenderId(s.into()))
}

fn parse_chunk_no(s: &str) -> Result<u32, MalformedReason> {
    if !all_digits(s) || s.len() > MAX_CHUNK_NO_DIGITS {
        return Err(MalformedReason::ChunkNo(s.into()));
    }
    s.parse::<u32>()
        .map_err(|_| MalformedReason::ChunkNo(s.into()))
}

fn parse_replication_degree(s: &str) -> Result<u8, MalformedReason> {
    match s.as_bytes() {
        [d] if d.is_ascii_digit() && (1..=MAX_REPLICATION_DEGREE).contains(&(d - b'0')) => {
            Ok(d - b'0')
        }
        _ => Err(MalformedReason::ReplicationDegree(s.into())),
    }
}

/// Error decoding a datagram into a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(#[from] MalformedReason),
    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),
}

/// Why a datagram did not match its type's grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedReason {
    #[error("no CRLF CRLF header terminator")]
    MissingTerminator,
    #[error("header is not ASCII")]
    NonAscii,
    #[error("empty header")]
    Empty,
    #[error("{message_type} expects {expected} fields, found {found}")]
    FieldCount {
        message_type: MessageType,
        expected: usize,
        found: usize,
    },
    #[error("bad version {0:?}")]
    Version(String),
    #[error("bad sender id {0:?}")]
    SenderId(String),
    #[error("bad file id {0:?}")]
    FileId(String),
    #[error("bad chunk number {0:?}")]
    ChunkNo(String),
    #[error("bad replication degree {0:?}")]
    ReplicationDegree(String),
    #[error("{0} body bytes on a message type without body")]
    UnexpectedBody(usize),
    #[error("{0} bytes do not fit one datagram")]
    TooLarge(usize),
    #[error("{0}")]
    Invalid(String),
}
