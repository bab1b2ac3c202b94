use bytes::Bytes;
use tokio::sync::oneshot;

use crate::media::UploadedMedia;
use crate::model::{Confirmation, MediaKind, MessageDraft, Snapshot};
use crate::SyncError;

pub type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

/// Everything the coordinator reacts to. Producers on any task post these into
/// the coordinator's mailbox; they are applied one at a time, in order.
#[derive(Debug)]
pub enum Event {
    // Connectivity
    ConnectivityChanged {
        online: bool,
    },

    // Feed
    SnapshotDelivered {
        generation: u64,
        snapshot: Snapshot,
    },
    FeedClosed {
        generation: u64,
    },
    /// Backoff elapsed after a feed loss or a refused subscription.
    ResubscribeDue,

    // Presentation
    Send {
        draft: MessageDraft,
        reply: Reply<Confirmation>,
    },
    Upload {
        kind: MediaKind,
        bytes: Bytes,
        reply: Reply<UploadedMedia>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ConnectivityChanged { .. } => "connectivity_changed",
            Self::SnapshotDelivered { .. } => "snapshot_delivered",
            Self::FeedClosed { .. } => "feed_closed",
            Self::ResubscribeDue => "resubscribe_due",
            Self::Send { .. } => "send",
            Self::Upload { .. } => "upload",
            Self::Flush { .. } => "flush",
            Self::Shutdown { .. } => "shutdown",
        }
    }

    /// Events raised by the presentation layer rather than a collaborator.
    #[must_use]
    pub const fn is_user_initiated(&self) -> bool {
        matches!(self, Self::Send { .. } | Self::Upload { .. })
    }
}
