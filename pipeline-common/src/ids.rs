//! # Ids
//!
//! Content-derived identifiers for every entity the pipeline persists.
//!
//! An identifier is the first 16 hex characters of a SHA-256 digest computed over:
//!
//! 1. The per-kind key, e.g. `copilot/message/v1`.
//! 2. Each input, in the order documented on the helper for that kind, encoded as a one
//!    byte type tag, the input length as a big-endian u64, and the input bytes.
//!
//! The length prefix keeps `("ab", "c")` and `("a", "bc")` apart. Reordering inputs or
//! changing the encoding changes every identifier already stored, so doing so requires
//! bumping the version in the per-kind key and migrating the affected collections.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const ID_LENGTH: usize = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier must be 16 characters long, got {0}")]
    InvalidLength(usize),
    #[error("identifier must be lowercase hex: {0}")]
    InvalidCharacter(String),
}

/// The identifier of a persisted entity. Only ever built by the derive functions below
/// or by parsing an identifier that was derived earlier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(String);

impl DocumentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DocumentId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ID_LENGTH {
            return Err(IdError::InvalidLength(s.len()));
        }

        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(IdError::InvalidCharacter(s.to_owned()));
        }

        Ok(DocumentId(s.to_owned()))
    }
}

impl TryFrom<String> for DocumentId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The kinds of entity the pipeline stores, one collection each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Archive,
    Message,
    Chunk,
    Thread,
    Summary,
    Report,
    /// Dedup index entries, keyed by content hash.
    Checksum,
}

impl EntityKind {
    /// Versioned key mixed into every digest of this kind.
    fn key(&self) -> &'static str {
        match self {
            EntityKind::Archive => "copilot/archive/v1",
            EntityKind::Message => "copilot/message/v1",
            EntityKind::Chunk => "copilot/chunk/v1",
            EntityKind::Thread => "copilot/thread/v1",
            EntityKind::Summary => "copilot/summary/v1",
            EntityKind::Report => "copilot/report/v1",
            EntityKind::Checksum => "copilot/checksum/v1",
        }
    }

    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Archive => "archives",
            EntityKind::Message => "messages",
            EntityKind::Chunk => "chunks",
            EntityKind::Thread => "threads",
            EntityKind::Summary => "summaries",
            EntityKind::Report => "reports",
            EntityKind::Checksum => "checksums",
        }
    }
}

/// A single typed input to an identifier digest.
#[derive(Clone, Copy, Debug)]
pub enum IdInput<'a> {
    Bytes(&'a [u8]),
    Text(&'a str),
    Int(u64),
}

impl IdInput<'_> {
    fn tag(&self) -> u8 {
        match self {
            IdInput::Bytes(_) => b'b',
            IdInput::Text(_) => b's',
            IdInput::Int(_) => b'i',
        }
    }
}

/// Derive the identifier for an entity of `kind` from its inputs.
pub fn derive(kind: EntityKind, inputs: &[IdInput<'_>]) -> DocumentId {
    let mut hasher = Sha256::new();
    hasher.update(kind.key().as_bytes());

    for input in inputs {
        hasher.update([input.tag()]);
        match input {
            IdInput::Bytes(bytes) => update_prefixed(&mut hasher, bytes),
            IdInput::Text(text) => update_prefixed(&mut hasher, text.as_bytes()),
            IdInput::Int(value) => update_prefixed(&mut hasher, &value.to_be_bytes()),
        }
    }

    let digest = hex::encode(hasher.finalize());
    DocumentId(digest[..ID_LENGTH].to_owned())
}

fn update_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Full SHA-256 of some content, as lowercase hex. Used as the dedup index key.
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Inputs: raw archive bytes.
pub fn archive_id(content: &[u8]) -> DocumentId {
    derive(EntityKind::Archive, &[IdInput::Bytes(content)])
}

/// Inputs: parent archive id, Message-ID header, date, sender, subject.
pub fn message_id(
    archive_id: &DocumentId,
    message_id_header: &str,
    date: &str,
    sender: &str,
    subject: &str,
) -> DocumentId {
    derive(
        EntityKind::Message,
        &[
            IdInput::Text(archive_id.as_str()),
            IdInput::Text(message_id_header),
            IdInput::Text(date),
            IdInput::Text(sender),
            IdInput::Text(subject),
        ],
    )
}

/// Inputs: parent message id, chunk index.
pub fn chunk_id(message_id: &DocumentId, index: u64) -> DocumentId {
    derive(
        EntityKind::Chunk,
        &[IdInput::Text(message_id.as_str()), IdInput::Int(index)],
    )
}

/// Inputs: Message-ID header of the thread's root message.
pub fn thread_id(root_message_id_header: &str) -> DocumentId {
    derive(EntityKind::Thread, &[IdInput::Text(root_message_id_header)])
}

/// Inputs: thread id, summary content, generation timestamp (RFC 3339, microseconds).
pub fn summary_id(thread_id: &DocumentId, content: &str, generated_at: DateTime<Utc>) -> DocumentId {
    let generated_at = generated_at.to_rfc3339_opts(SecondsFormat::Micros, true);
    derive(
        EntityKind::Summary,
        &[
            IdInput::Text(thread_id.as_str()),
            IdInput::Text(content),
            IdInput::Text(&generated_at),
        ],
    )
}

/// Inputs: summary id, thread id.
pub fn report_id(summary_id: &DocumentId, thread_id: &DocumentId) -> DocumentId {
    derive(
        EntityKind::Report,
        &[
            IdInput::Text(summary_id.as_str()),
            IdInput::Text(thread_id.as_str()),
        ],
    )
}

/// Inputs: content hash as produced by `content_hash`.
pub fn checksum_id(hash: &str) -> DocumentId {
    derive(EntityKind::Checksum, &[IdInput::Text(hash)])
}
