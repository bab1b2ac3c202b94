use std::sync::Arc;

use super::SubscriptionGuard;

pub type StatusCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Online/offline signal source.
///
/// `subscribe` must deliver the current status to the callback on attach and
/// every change afterwards. Duplicate signals are allowed; consumers are
/// idempotent.
pub trait ConnectivityMonitor: Send + Sync {
    fn status(&self) -> bool;

    fn subscribe(&self, callback: StatusCallback) -> SubscriptionGuard;
}
