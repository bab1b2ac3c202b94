//! Local Message Cache: last materialized message list per conversation.
//!
//! The cache is an acceleration path, never a source of correctness. Each
//! entry is the whole ordered list, overwritten wholesale, wrapped in a
//! versioned and checksummed envelope.

mod file;
mod memory;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite;

pub use self::file::FileMessageCache;
pub use self::memory::MemoryMessageCache;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::sqlite::SqliteMessageCache;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ConversationId, Message};

const CURRENT_SCHEMA_VERSION: u32 = 1;
pub const MAX_SNAPSHOT_BYTES: usize = 64 * 1024 * 1024;
const SNAPSHOT_MAGIC: &[u8; 4] = b"MSGC";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupted snapshot: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("snapshot too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },

    #[error("snapshot belongs to {found}, expected {expected}")]
    ConversationMismatch { expected: String, found: String },

    #[error("lock acquisition failed")]
    LockFailed,

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<ciborium::de::Error<std::io::Error>> for CacheError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for CacheError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(e: tokio::task::JoinError) -> Self {
        CacheError::Task(e.to_string())
    }
}

/// Durable key-value slot per conversation holding the serialized ordered list.
#[async_trait::async_trait]
pub trait MessageCache: Send + Sync {
    /// `None` when nothing has been cached for the conversation yet.
    async fn read(&self, conversation: &ConversationId) -> Result<Option<Vec<Message>>, CacheError>;

    async fn write(&self, conversation: &ConversationId, messages: &[Message]) -> Result<(), CacheError>;
}

#[derive(Serialize, Deserialize, Debug)]
struct SnapshotEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    conversation: String,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug)]
struct SnapshotPayload {
    messages: Vec<Message>,
}

pub fn encode_snapshot(conversation: &ConversationId, messages: &[Message]) -> Result<Vec<u8>, CacheError> {
    let payload = SnapshotPayload {
        messages: messages.to_vec(),
    };

    let mut payload_bytes = Vec::new();
    ciborium::into_writer(&payload, &mut payload_bytes)?;

    let checksum = blake3::hash(&payload_bytes);

    let envelope = SnapshotEnvelope {
        magic: *SNAPSHOT_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        conversation: conversation.as_str().to_string(),
        checksum: *checksum.as_bytes(),
        payload: payload_bytes,
    };

    let mut envelope_bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut envelope_bytes)?;

    if envelope_bytes.len() > MAX_SNAPSHOT_BYTES {
        return Err(CacheError::TooLarge {
            size: envelope_bytes.len(),
            max: MAX_SNAPSHOT_BYTES,
        });
    }

    Ok(envelope_bytes)
}

pub fn decode_snapshot(conversation: &ConversationId, bytes: &[u8]) -> Result<Vec<Message>, CacheError> {
    if bytes.is_empty() {
        return Err(CacheError::Corrupted {
            reason: "empty snapshot",
        });
    }

    if bytes.len() > MAX_SNAPSHOT_BYTES {
        return Err(CacheError::TooLarge {
            size: bytes.len(),
            max: MAX_SNAPSHOT_BYTES,
        });
    }

    let envelope: SnapshotEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *SNAPSHOT_MAGIC {
        return Err(CacheError::Corrupted {
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(CacheError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    if envelope.conversation != conversation.as_str() {
        return Err(CacheError::ConversationMismatch {
            expected: conversation.as_str().to_string(),
            found: envelope.conversation,
        });
    }

    let actual_checksum = blake3::hash(&envelope.payload);
    if actual_checksum.as_bytes() != &envelope.checksum {
        return Err(CacheError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual_checksum.as_bytes()),
        });
    }

    let payload: SnapshotPayload = ciborium::from_reader(&envelope.payload[..])?;
    Ok(payload.messages)
}
