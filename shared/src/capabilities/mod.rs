//! Contracts for the collaborators the sync core talks to but does not own.
//!
//! Each collaborator is a trait the shell implements (or picks from
//! [`crate::memory`]). The core only ever sees these traits, injected at
//! conversation construction time.

mod blob;
mod connectivity;
mod feed;
mod microphone;

pub use self::blob::{BlobError, BlobKey, BlobStore};
pub use self::connectivity::{ConnectivityMonitor, StatusCallback};
pub use self::feed::{FeedError, FeedSubscription, RemoteFeed, SnapshotReceiver};
pub use self::microphone::{Microphone, MicrophoneError};

use std::fmt;

/// Unsubscribe handle returned by push-style collaborators.
///
/// The cancel hook runs exactly once: on [`SubscriptionGuard::cancel`] or on drop.
pub struct SubscriptionGuard {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionGuard {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A guard with nothing to release.
    #[must_use]
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
