//! Chat synchronization core: keeps one conversation's message list in step
//! with a remote feed, a local cache and the network state.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod cache;
pub mod capabilities;
pub mod config;
pub mod coordinator;
pub mod event;
pub mod media;
pub mod memory;
pub mod model;

use thiserror::Error;

use crate::cache::CacheError;
use crate::capabilities::{BlobError, FeedError};
use crate::media::UploadError;
use crate::model::{ConversationId, ModelError};

pub use crate::config::{SyncConfig, MAX_MEDIA_BYTES};
pub use crate::coordinator::{SyncCoordinator, SyncDeps, SyncHandle, SyncMode};
pub use crate::media::{AudioRecorder, RecorderError, RecorderOutcome, RecorderState};

/// Every failure the core reports to its caller.
///
/// All variants except `CacheUnavailable` are surfaced verbatim for user
/// notification; none are retried by the core.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("operation requires connectivity")]
    Offline,

    #[error("media is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("media payload is empty")]
    EmptyMedia,

    #[error("invalid message: {0}")]
    InvalidDraft(#[from] ModelError),

    #[error("message write failed: {0}")]
    RemoteWriteFailed(FeedError),

    #[error("media upload failed: {0}")]
    RemoteUploadFailed(BlobError),

    #[error("local cache unavailable: {0}")]
    CacheUnavailable(#[from] CacheError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("coordinator for {0} is shut down")]
    Closed(ConversationId),
}

impl SyncError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Offline => "OFFLINE",
            Self::TooLarge { .. } => "TOO_LARGE",
            Self::EmptyMedia => "EMPTY_MEDIA",
            Self::InvalidDraft(_) => "INVALID_DRAFT",
            Self::RemoteWriteFailed(_) => "REMOTE_WRITE_FAILED",
            Self::RemoteUploadFailed(_) => "REMOTE_UPLOAD_FAILED",
            Self::CacheUnavailable(_) => "CACHE_UNAVAILABLE",
            Self::Config(_) => "CONFIG",
            Self::Closed(_) => "CLOSED",
        }
    }

    /// Cache failures are absorbed and logged, never shown.
    #[must_use]
    pub const fn is_user_facing(&self) -> bool {
        !matches!(self, Self::CacheUnavailable(_))
    }
}

impl From<UploadError> for SyncError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::Offline => SyncError::Offline,
            UploadError::TooLarge { size, max } => SyncError::TooLarge { size, max },
            UploadError::EmptyPayload => SyncError::EmptyMedia,
            UploadError::Rejected(e) => SyncError::RemoteUploadFailed(e),
        }
    }
}

impl From<BlobError> for SyncError {
    fn from(e: BlobError) -> Self {
        SyncError::RemoteUploadFailed(e)
    }
}

impl From<FeedError> for SyncError {
    fn from(e: FeedError) -> Self {
        SyncError::RemoteWriteFailed(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_errors_map_to_taxonomy() {
        assert!(matches!(SyncError::from(UploadError::Offline), SyncError::Offline));
        assert!(matches!(
            SyncError::from(UploadError::TooLarge { size: 2, max: 1 }),
            SyncError::TooLarge { size: 2, max: 1 }
        ));
        assert!(matches!(SyncError::from(UploadError::EmptyPayload), SyncError::EmptyMedia));

        let rejected = SyncError::from(UploadError::Rejected(BlobError::Unauthorized("denied".into())));
        match rejected {
            SyncError::RemoteUploadFailed(e) => assert_eq!(e.code(), "storage/unauthorized"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_only_cache_errors_are_hidden() {
        let hidden = SyncError::from(CacheError::LockFailed);
        assert_eq!(hidden.code(), "CACHE_UNAVAILABLE");
        assert!(!hidden.is_user_facing());

        assert!(SyncError::Offline.is_user_facing());
        assert!(SyncError::RemoteWriteFailed(FeedError::Closed).is_user_facing());
        assert!(SyncError::Closed(ConversationId::new("room")).is_user_facing());
    }
}
