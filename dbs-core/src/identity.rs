//! Identifiers: peer id and content-derived file id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::protocol::ValidationError;

/// Peer identifier. Unique within a backup group, chosen at launch.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Length of a file id on the wire (hex characters).
pub const FILE_ID_HEX_LEN: usize = 64;

/// File identifier: SHA-256 digest naming a file across the group.
/// Always rendered as 64 lowercase hex characters.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FileId([u8; 32]);

impl FileId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        FileId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse the wire form. Only lowercase hex is accepted; uppercase would
    /// produce a second spelling of the same id.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        if s.is_empty() {
            return Err(ValidationError::EmptyFileId);
        }
        if s.len() != FILE_ID_HEX_LEN
            || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(ValidationError::InvalidFileId(s.to_string()));
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)
            .map_err(|_| ValidationError::InvalidFileId(s.to_string()))?;
        Ok(FileId(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Derive the id of a local file from its path and metadata, so that a
    /// modified file gets a new id.
    pub fn derive(path: &str, size: u64, modified_millis: u128) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        hasher.update(b":");
        hasher.update(size.to_le_bytes());
        hasher.update(b":");
        hasher.update(modified_millis.to_le_bytes());
        FileId(hasher.finalize().into())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", &self.to_hex()[..12])
    }
}

impl FromStr for FileId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileId::parse(s)
    }
}

impl Serialize for FileId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for FileId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        FileId::parse(&s).map_err(serde::de::Error::custom)
    }
}
