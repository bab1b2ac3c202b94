use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use super::SubscriptionGuard;
use crate::model::{Confirmation, ConversationId, MessageDraft, Snapshot};

pub type SnapshotReceiver = mpsc::UnboundedReceiver<Snapshot>;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum FeedError {
    #[error("feed rejected write: {reason}")]
    Rejected { reason: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("feed unavailable: {0}")]
    Unavailable(String),

    #[error("subscription closed by remote")]
    Closed,
}

impl FeedError {
    /// Whether a caller could reasonably try again. The core itself never retries.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::Unavailable(_) | FeedError::Closed)
    }
}

/// Push stream of full ordered snapshots for one conversation.
///
/// Every subscription must start with a replay of the complete current set;
/// no cursor or resumption token exists.
#[derive(Debug)]
pub struct FeedSubscription {
    snapshots: SnapshotReceiver,
    guard: SubscriptionGuard,
}

impl FeedSubscription {
    #[must_use]
    pub fn new(snapshots: SnapshotReceiver, guard: SubscriptionGuard) -> Self {
        Self { snapshots, guard }
    }

    /// Split so the stream can be drained elsewhere while the owner keeps the
    /// ability to unsubscribe synchronously.
    #[must_use]
    pub fn into_parts(self) -> (SnapshotReceiver, SubscriptionGuard) {
        (self.snapshots, self.guard)
    }
}

#[async_trait::async_trait]
pub trait RemoteFeed: Send + Sync {
    async fn subscribe(&self, conversation: &ConversationId)
        -> Result<FeedSubscription, FeedError>;

    async fn write(
        &self,
        conversation: &ConversationId,
        draft: MessageDraft,
    ) -> Result<Confirmation, FeedError>;
}
