use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::MediaUrl;

pub const MAX_KEY_LENGTH: usize = 1024;

/// Object key inside the blob store, e.g. `images/1700000000000_k3x9qa.jpg`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobKey(String);

impl BlobKey {
    pub fn new(key: impl Into<String>) -> Result<Self, BlobError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(key: &str) -> Result<(), BlobError> {
        let reason = if key.trim().is_empty() {
            "key cannot be empty"
        } else if key.len() > MAX_KEY_LENGTH {
            "key too long"
        } else if key.contains("..") {
            "key cannot contain path traversal sequences"
        } else if key.starts_with('/') || key.starts_with('\\') {
            "key cannot start with path separator"
        } else if key.chars().any(char::is_control) {
            "key contains control characters"
        } else {
            return Ok(());
        };

        Err(BlobError::InvalidKey {
            key: key.chars().take(64).collect(),
            reason: reason.to_string(),
        })
    }
}

impl std::fmt::Display for BlobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failure reported by the blob store, keeping the sub-reason when it gives one.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum BlobError {
    #[error("storage access denied: {0}")]
    Unauthorized(String),

    #[error("storage not configured: {0}")]
    Unconfigured(String),

    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage upload failed: {0}")]
    Unknown(String),
}

impl BlobError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "storage/unauthorized",
            Self::Unconfigured(_) => "storage/no-default-bucket",
            Self::NotFound { .. } => "storage/object-not-found",
            Self::InvalidKey { .. } => "storage/invalid-key",
            Self::Transport(_) => "storage/retry-limit-exceeded",
            Self::Unknown(_) => "storage/unknown",
        }
    }
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the full payload in one atomic put. No chunking, no resume.
    async fn put(&self, key: &BlobKey, bytes: Bytes, content_type: &str) -> Result<(), BlobError>;

    /// Stable, publicly fetchable URL for an uploaded object.
    async fn resolve_url(&self, key: &BlobKey) -> Result<MediaUrl, BlobError>;
}
