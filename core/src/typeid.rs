//! Prefixed, URL-safe identifiers: `<prefix>_<26-char-base32>`.
//!
//! Each entity kind in the data model gets its own prefix so that a raw
//! id string is self-describing and cross-entity mix-ups fail to parse
//! rather than silently pointing at the wrong table.

use rand::RngCore;
use std::fmt;
use thiserror::Error;

const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const PAYLOAD_BYTES: usize = 16;
const ENCODED_LEN: usize = 26;

pub const PREFIX_NODE: &str = "node";
pub const PREFIX_EDGE: &str = "edge";
pub const PREFIX_NODE_METADATA: &str = "nmeta";
pub const PREFIX_NODE_EMBEDDING: &str = "nemb";
pub const PREFIX_EDGE_EMBEDDING: &str = "eemb";
pub const PREFIX_SOURCE: &str = "src";
pub const PREFIX_ALIAS: &str = "alias";
pub const PREFIX_SOURCE_LINK: &str = "sln";
pub const PREFIX_USER_PROFILE: &str = "upf";
pub const PREFIX_MESSAGE: &str = "msg";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeIdError {
    #[error("type id missing prefix separator: {0}")]
    MissingSeparator(String),
    #[error("type id prefix mismatch: expected {expected}, got {actual}")]
    PrefixMismatch { expected: String, actual: String },
    #[error("type id payload has wrong length: expected {expected} chars, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("type id payload contains an invalid base32 character: {0}")]
    InvalidCharacter(char),
}

/// A prefixed identifier, e.g. `node_0123456789ABCDEFGHJKMNPQR`.
///
/// Stored as a plain `String` so it can flow unmodified through both the
/// rkyv-archived graph state and serde-encoded job payloads / API bodies.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(PartialEq, Eq, Hash, Debug))]
#[serde(transparent)]
pub struct TypeId(String);

impl TypeId {
    /// Mints a new random id with the given prefix.
    pub fn generate(prefix: &str) -> Self {
        let mut payload = [0u8; PAYLOAD_BYTES];
        rand::thread_rng().fill_bytes(&mut payload);
        Self(format!("{prefix}_{}", encode_base32(&payload)))
    }

    /// Parses a string, requiring it to carry `expected_prefix`.
    pub fn parse(expected_prefix: &str, raw: &str) -> Result<Self, TypeIdError> {
        let (prefix, payload) = raw
            .split_once('_')
            .ok_or_else(|| TypeIdError::MissingSeparator(raw.to_string()))?;

        if prefix != expected_prefix {
            return Err(TypeIdError::PrefixMismatch {
                expected: expected_prefix.to_string(),
                actual: prefix.to_string(),
            });
        }

        if payload.len() != ENCODED_LEN {
            return Err(TypeIdError::WrongLength {
                expected: ENCODED_LEN,
                actual: payload.len(),
            });
        }

        for c in payload.chars() {
            if base32_value(c).is_none() {
                return Err(TypeIdError::InvalidCharacter(c));
            }
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn prefix(&self) -> &str {
        self.0.split_once('_').map(|(p, _)| p).unwrap_or(&self.0)
    }

    pub fn node() -> Self {
        Self::generate(PREFIX_NODE)
    }

    pub fn edge() -> Self {
        Self::generate(PREFIX_EDGE)
    }

    pub fn node_metadata() -> Self {
        Self::generate(PREFIX_NODE_METADATA)
    }

    pub fn node_embedding() -> Self {
        Self::generate(PREFIX_NODE_EMBEDDING)
    }

    pub fn edge_embedding() -> Self {
        Self::generate(PREFIX_EDGE_EMBEDDING)
    }

    pub fn source() -> Self {
        Self::generate(PREFIX_SOURCE)
    }

    pub fn alias() -> Self {
        Self::generate(PREFIX_ALIAS)
    }

    pub fn source_link() -> Self {
        Self::generate(PREFIX_SOURCE_LINK)
    }

    pub fn user_profile() -> Self {
        Self::generate(PREFIX_USER_PROFILE)
    }

    pub fn message() -> Self {
        Self::generate(PREFIX_MESSAGE)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TypeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn base32_value(c: char) -> Option<u8> {
    CROCKFORD_ALPHABET
        .iter()
        .position(|&b| b as char == c)
        .map(|i| i as u8)
}

fn encode_base32(bytes: &[u8]) -> String {
    let total_bits = bytes.len() * 8;
    let total_chars = (total_bits + 4) / 5;

    let mut out = String::with_capacity(total_chars);
    let mut buffer: u32 = 0;
    let mut bits_in_buffer = 0u32;
    let mut byte_idx = 0;

    for _ in 0..total_chars {
        while bits_in_buffer < 5 && byte_idx < bytes.len() {
            buffer = (buffer << 8) | bytes[byte_idx] as u32;
            bits_in_buffer += 8;
            byte_idx += 1;
        }
        if bits_in_buffer < 5 {
            buffer <<= 5 - bits_in_buffer;
            bits_in_buffer = 5;
        }
        bits_in_buffer -= 5;
        let index = (buffer >> bits_in_buffer) & 0x1F;
        out.push(CROCKFORD_ALPHABET[index as usize] as char);
    }

    out
}
