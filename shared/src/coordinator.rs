//! Sync Coordinator.
//!
//! One coordinator per conversation owns the authoritative message list. It
//! runs as a single task draining a mailbox of [`Event`]s, so connectivity
//! callbacks, feed pushes and presentation calls never touch the list
//! concurrently.
//!
//! Two steady states:
//! - `Live`: subscribed to the remote feed. Every snapshot replaces the list
//!   and is written through to the cache in the background.
//! - `Cached`: no subscription. The list is frozen until the next transition
//!   to `Live`. The cache is only read on cold start or when no live snapshot
//!   has been applied yet, so a failed write-through never rolls it back.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::cache::MessageCache;
use crate::capabilities::{BlobStore, ConnectivityMonitor, RemoteFeed, SnapshotReceiver, SubscriptionGuard};
use crate::config::SyncConfig;
use crate::event::Event;
use crate::media::{MediaPipeline, UploadedMedia};
use crate::model::{
    Attachment, Confirmation, ConversationId, LocationRef, MediaKind, MediaUrl, MessageBody, MessageDraft,
    MessageList, Sender, Snapshot,
};
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Live,
    Cached,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => f.write_str("live"),
            Self::Cached => f.write_str("cached"),
        }
    }
}

/// Collaborators injected at conversation construction time.
#[derive(Clone)]
pub struct SyncDeps {
    pub feed: Arc<dyn RemoteFeed>,
    pub blobs: Arc<dyn BlobStore>,
    pub cache: Arc<dyn MessageCache>,
    pub connectivity: Arc<dyn ConnectivityMonitor>,
}

pub struct SyncCoordinator;

impl SyncCoordinator {
    /// Start a coordinator for `conversation` on the current tokio runtime.
    ///
    /// The coordinator starts `Cached`, loads the cache, then attaches to the
    /// connectivity monitor.
    pub fn spawn(conversation: ConversationId, deps: SyncDeps, config: SyncConfig) -> Result<SyncHandle, SyncError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| SyncError::Config(e.to_string()))?;

        let (mailbox, inbox) = mpsc::unbounded_channel();
        let (messages_tx, messages_rx) = watch::channel(MessageList::default());
        let (mode_tx, mode_rx) = watch::channel(SyncMode::Cached);
        let config = Arc::new(config);

        let actor = Actor {
            conversation: conversation.clone(),
            pipeline: MediaPipeline::new(Arc::clone(&deps.blobs), config.max_media_bytes),
            config: Arc::clone(&config),
            deps,
            mailbox: mailbox.clone(),
            online: false,
            live: None,
            next_generation: 0,
            connectivity: None,
            list: MessageList::default(),
            has_live_list: false,
            resubscribe_attempts: 0,
            resubscribe_pending: false,
            messages_tx,
            mode_tx,
            pending_write: None,
        };

        runtime.spawn(actor.run(inbox));
        info!(conversation = %conversation, "sync coordinator started");

        Ok(SyncHandle {
            inner: Arc::new(HandleInner {
                conversation,
                config,
                mailbox,
                messages: messages_rx,
                mode: mode_rx,
            }),
        })
    }
}

// --- Presentation boundary ---

/// Cloneable handle to a running coordinator. Dropping the last clone shuts
/// the coordinator down.
#[derive(Clone)]
pub struct SyncHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    conversation: ConversationId,
    config: Arc<SyncConfig>,
    mailbox: mpsc::UnboundedSender<Event>,
    messages: watch::Receiver<MessageList>,
    mode: watch::Receiver<SyncMode>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let _ = self.mailbox.send(Event::Shutdown { reply: None });
    }
}

impl fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncHandle")
            .field("conversation", &self.inner.conversation)
            .field("mode", &*self.inner.mode.borrow())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SyncHandle {
    #[must_use]
    pub fn conversation(&self) -> &ConversationId {
        &self.inner.conversation
    }

    /// The ordered list as last materialized, newest first.
    #[must_use]
    pub fn current_messages(&self) -> MessageList {
        self.inner.messages.borrow().clone()
    }

    #[must_use]
    pub fn mode(&self) -> SyncMode {
        *self.inner.mode.borrow()
    }

    /// Receiver that wakes on every list replacement.
    #[must_use]
    pub fn watch_messages(&self) -> watch::Receiver<MessageList> {
        self.inner.messages.clone()
    }

    #[must_use]
    pub fn watch_mode(&self) -> watch::Receiver<SyncMode> {
        self.inner.mode.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.mailbox.is_closed()
    }

    /// Write a draft to the remote feed. Rejected with `Offline` unless `Live`.
    ///
    /// The list is not touched: the message becomes visible only when the
    /// feed pushes it back.
    pub async fn send(&self, draft: MessageDraft) -> Result<Confirmation, SyncError> {
        self.request(|reply| Event::Send { draft, reply }).await
    }

    /// Upload captured media and return its remote URL.
    pub async fn upload_media(&self, kind: MediaKind, bytes: Bytes) -> Result<MediaUrl, SyncError> {
        let uploaded: UploadedMedia = self.request(|reply| Event::Upload { kind, bytes, reply }).await?;
        Ok(uploaded.url)
    }

    /// Upload, then send a message whose only media reference is the uploaded URL.
    pub async fn share_media(&self, sender: Sender, kind: MediaKind, bytes: Bytes) -> Result<Confirmation, SyncError> {
        let url = self.upload_media(kind, bytes).await?;
        let caption = match kind {
            MediaKind::Image => &self.inner.config.image_caption,
            MediaKind::Audio => &self.inner.config.audio_caption,
        };
        let body = MessageBody::with_attachment(caption.clone(), Attachment::media(kind, url));
        self.send(MessageDraft::new(sender, body)).await
    }

    pub async fn share_location(&self, sender: Sender, location: LocationRef) -> Result<Confirmation, SyncError> {
        let body = MessageBody::with_attachment(
            self.inner.config.location_caption.clone(),
            Attachment::Location(location),
        );
        self.send(MessageDraft::new(sender, body)).await
    }

    /// Resolves once every earlier event is applied and the latest cache
    /// write has finished.
    pub async fn flush(&self) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .mailbox
            .send(Event::Flush { reply })
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    /// Unsubscribe, detach from connectivity and stop. Idempotent.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        if self.inner.mailbox.send(Event::Shutdown { reply: Some(reply) }).is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    async fn request<T>(
        &self,
        event: impl FnOnce(oneshot::Sender<Result<T, SyncError>>) -> Event,
    ) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.inner.mailbox.send(event(reply)).map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    fn closed(&self) -> SyncError {
        SyncError::Closed(self.inner.conversation.clone())
    }
}

// --- Actor ---

struct LiveSession {
    generation: u64,
    guard: SubscriptionGuard,
    forwarder: JoinHandle<()>,
}

struct Actor {
    conversation: ConversationId,
    deps: SyncDeps,
    pipeline: MediaPipeline,
    config: Arc<SyncConfig>,
    mailbox: mpsc::UnboundedSender<Event>,
    /// Last connectivity signal.
    online: bool,
    live: Option<LiveSession>,
    next_generation: u64,
    connectivity: Option<SubscriptionGuard>,
    list: MessageList,
    /// Set once a live snapshot has been applied.
    has_live_list: bool,
    resubscribe_attempts: u32,
    resubscribe_pending: bool,
    messages_tx: watch::Sender<MessageList>,
    mode_tx: watch::Sender<SyncMode>,
    pending_write: Option<JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Event>) {
        self.load_cache().await;
        self.attach_connectivity().await;

        while let Some(event) = inbox.recv().await {
            debug!(
                conversation = %self.conversation,
                event = event.name(),
                user_initiated = event.is_user_initiated(),
                "processing event"
            );

            if let Event::Shutdown { reply } = event {
                inbox.close();
                self.shutdown().await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                break;
            }

            self.update(event).await;
        }

        info!(conversation = %self.conversation, "sync coordinator stopped");
    }

    async fn update(&mut self, event: Event) {
        match event {
            Event::ConnectivityChanged { online } => self.on_connectivity(online).await,

            Event::SnapshotDelivered { generation, snapshot } => {
                if self.is_current(generation) {
                    self.apply_snapshot(snapshot);
                } else {
                    debug!(conversation = %self.conversation, generation, "dropping stale snapshot");
                }
            }

            Event::FeedClosed { generation } => {
                if self.is_current(generation) {
                    warn!(conversation = %self.conversation, generation, "feed ended while live");
                    self.enter_cached().await;
                    self.schedule_resubscribe();
                }
            }

            Event::ResubscribeDue => {
                self.resubscribe_pending = false;
                if self.online && self.live.is_none() {
                    self.enter_live().await;
                }
            }

            Event::Send { draft, reply } => {
                let result = self.send(draft).await;
                let _ = reply.send(result);
            }

            Event::Upload { kind, bytes, reply } => {
                let result = self
                    .pipeline
                    .upload(self.live.is_some(), kind, bytes)
                    .await
                    .map_err(SyncError::from);
                let _ = reply.send(result);
            }

            Event::Flush { reply } => {
                self.settle_cache_writes().await;
                let _ = reply.send(());
            }

            Event::Shutdown { .. } => {}
        }
    }

    fn mode(&self) -> SyncMode {
        if self.live.is_some() {
            SyncMode::Live
        } else {
            SyncMode::Cached
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.live.as_ref().is_some_and(|session| session.generation == generation)
    }

    async fn attach_connectivity(&mut self) {
        let mailbox = self.mailbox.clone();
        let guard = self
            .deps
            .connectivity
            .subscribe(Arc::new(move |online| {
                let _ = mailbox.send(Event::ConnectivityChanged { online });
            }));
        self.connectivity = Some(guard);

        let online = self.deps.connectivity.status();
        self.on_connectivity(online).await;
    }

    /// Idempotent: repeating the current state does nothing.
    async fn on_connectivity(&mut self, online: bool) {
        self.online = online;

        match (online, self.mode()) {
            (true, SyncMode::Cached) => self.enter_live().await,
            (false, SyncMode::Live) => self.enter_cached().await,
            _ => {}
        }
    }

    #[instrument(skip(self), fields(conversation = %self.conversation))]
    async fn enter_live(&mut self) {
        let subscription = match self.deps.feed.subscribe(&self.conversation).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(error = %e, "subscribe failed, staying cached");
                self.schedule_resubscribe();
                return;
            }
        };

        self.resubscribe_attempts = 0;

        let generation = self.next_generation;
        self.next_generation += 1;

        let (snapshots, guard) = subscription.into_parts();
        let forwarder = tokio::spawn(forward_snapshots(generation, snapshots, self.mailbox.clone()));

        self.live = Some(LiveSession {
            generation,
            guard,
            forwarder,
        });
        self.publish_mode();
        info!(generation, "live");
    }

    #[instrument(skip(self), fields(conversation = %self.conversation))]
    async fn enter_cached(&mut self) {
        self.teardown_live();
        self.publish_mode();
        if !self.has_live_list {
            self.load_cache().await;
        }
        info!(messages = self.list.len(), "cached");
    }

    /// Retry `Live` after a backoff while the network still reports online.
    /// Connectivity only signals changes, so nothing else would bring a
    /// dropped feed back.
    fn schedule_resubscribe(&mut self) {
        if !self.online || self.resubscribe_pending {
            return;
        }
        let delay_ms = self.config.resubscribe_delay_ms(self.resubscribe_attempts);
        self.resubscribe_attempts = self.resubscribe_attempts.saturating_add(1);
        self.resubscribe_pending = true;

        debug!(conversation = %self.conversation, delay_ms, "resubscribe scheduled");
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = mailbox.send(Event::ResubscribeDue);
        });
    }

    /// Unsubscribe before anything else reads or writes the list.
    fn teardown_live(&mut self) {
        if let Some(session) = self.live.take() {
            session.guard.cancel();
            session.forwarder.abort();
            debug!(conversation = %self.conversation, generation = session.generation, "feed subscription released");
        }
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot) {
        let list: MessageList = Arc::new(snapshot.into_messages());
        debug!(conversation = %self.conversation, messages = list.len(), "snapshot applied");
        self.has_live_list = true;
        self.publish_list(Arc::clone(&list));
        self.schedule_cache_write(list);
    }

    /// Fire-and-forget write-through. Writes are chained so they land in order.
    fn schedule_cache_write(&mut self, list: MessageList) {
        let previous = self.pending_write.take();
        let cache = Arc::clone(&self.deps.cache);
        let conversation = self.conversation.clone();

        self.pending_write = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if let Err(e) = cache.write(&conversation, &list).await {
                warn!(conversation = %conversation, error = %SyncError::from(e), "cache write failed");
            }
        }));
    }

    async fn settle_cache_writes(&mut self) {
        if let Some(pending) = self.pending_write.take() {
            let _ = pending.await;
        }
    }

    /// A missing or unreadable cache keeps whatever list is already shown,
    /// which is empty on cold start.
    async fn load_cache(&mut self) {
        self.settle_cache_writes().await;

        match self.deps.cache.read(&self.conversation).await {
            Ok(Some(messages)) => {
                debug!(conversation = %self.conversation, messages = messages.len(), "loaded cached list");
                self.publish_list(Arc::new(messages));
            }
            Ok(None) => {
                debug!(conversation = %self.conversation, "no cached list");
            }
            Err(e) => {
                warn!(conversation = %self.conversation, error = %SyncError::from(e), "cache read failed");
            }
        }
    }

    async fn send(&mut self, draft: MessageDraft) -> Result<Confirmation, SyncError> {
        if self.live.is_none() {
            info!(conversation = %self.conversation, "send rejected while offline");
            return Err(SyncError::Offline);
        }

        draft.body.validate()?;

        let local_id = draft.local_id.clone();
        match self.deps.feed.write(&self.conversation, draft).await {
            Ok(confirmation) => {
                debug!(conversation = %self.conversation, local_id = %local_id, id = %confirmation.id, "draft accepted");
                Ok(confirmation)
            }
            Err(e) => {
                warn!(conversation = %self.conversation, local_id = %local_id, error = %e, "feed write failed");
                Err(SyncError::RemoteWriteFailed(e))
            }
        }
    }

    async fn shutdown(&mut self) {
        self.teardown_live();
        if let Some(guard) = self.connectivity.take() {
            guard.cancel();
        }
        self.publish_mode();
        self.settle_cache_writes().await;
    }

    fn publish_list(&mut self, list: MessageList) {
        self.list = Arc::clone(&list);
        self.messages_tx.send_replace(list);
    }

    fn publish_mode(&self) {
        let mode = self.mode();
        self.mode_tx.send_if_modified(|current| {
            if *current == mode {
                false
            } else {
                *current = mode;
                true
            }
        });
    }
}

async fn forward_snapshots(generation: u64, mut snapshots: SnapshotReceiver, mailbox: mpsc::UnboundedSender<Event>) {
    while let Some(snapshot) = snapshots.recv().await {
        if mailbox.send(Event::SnapshotDelivered { generation, snapshot }).is_err() {
            return;
        }
    }
    let _ = mailbox.send(Event::FeedClosed { generation });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryMessageCache;
    use crate::memory::{InMemoryBlobStore, InMemoryFeed, ManualConnectivity};
    use crate::model::{Message, MessageId, UnixTimeMs};
    use std::time::Duration;

    struct Harness {
        feed: Arc<InMemoryFeed>,
        cache: Arc<MemoryMessageCache>,
        connectivity: Arc<ManualConnectivity>,
        handle: SyncHandle,
    }

    fn room() -> ConversationId {
        ConversationId::new("room")
    }

    fn message(id: &str, ts: u64) -> Message {
        Message {
            id: MessageId::new(id),
            created_at: UnixTimeMs(ts),
            sender: Sender::new("u1", "Ada"),
            body: MessageBody::text(format!("message {id}")),
        }
    }

    fn start(online: bool) -> Harness {
        let feed = Arc::new(InMemoryFeed::new());
        let cache = Arc::new(MemoryMessageCache::default());
        let connectivity = Arc::new(ManualConnectivity::new(online));
        let deps = SyncDeps {
            feed: feed.clone(),
            blobs: Arc::new(InMemoryBlobStore::default()),
            cache: cache.clone(),
            connectivity: connectivity.clone(),
        };
        let handle = SyncCoordinator::spawn(room(), deps, SyncConfig::default()).unwrap();
        Harness {
            feed,
            cache,
            connectivity,
            handle,
        }
    }

    async fn wait_for_mode(handle: &SyncHandle, mode: SyncMode) {
        let mut rx = handle.watch_mode();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|m| *m == mode))
            .await
            .expect("timed out waiting for mode")
            .unwrap();
    }

    async fn wait_for_len(handle: &SyncHandle, len: usize) {
        let mut rx = handle.watch_messages();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|list| list.len() == len))
            .await
            .expect("timed out waiting for messages")
            .unwrap();
    }

    #[tokio::test]
    async fn test_starts_live_when_online() {
        let h = start(true);
        wait_for_mode(&h.handle, SyncMode::Live).await;
        assert_eq!(h.feed.subscriber_count(&room()), 1);
    }

    #[tokio::test]
    async fn test_cold_start_offline_reads_cache() {
        let feed = Arc::new(InMemoryFeed::new());
        let cache = Arc::new(MemoryMessageCache::default());
        cache.write(&room(), &[message("1", 1)]).await.unwrap();

        let deps = SyncDeps {
            feed: feed.clone(),
            blobs: Arc::new(InMemoryBlobStore::default()),
            cache,
            connectivity: Arc::new(ManualConnectivity::new(false)),
        };
        let handle = SyncCoordinator::spawn(room(), deps, SyncConfig::default()).unwrap();
        handle.flush().await.unwrap();

        assert_eq!(handle.mode(), SyncMode::Cached);
        assert_eq!(*handle.current_messages(), vec![message("1", 1)]);
        assert_eq!(feed.subscriber_count(&room()), 0);
    }

    #[tokio::test]
    async fn test_snapshot_written_through_to_cache() {
        let h = start(true);
        wait_for_mode(&h.handle, SyncMode::Live).await;

        h.feed.seed(&room(), vec![message("2", 2), message("1", 1)]);
        wait_for_len(&h.handle, 2).await;
        h.handle.flush().await.unwrap();

        let cached = h.cache.read(&room()).await.unwrap().unwrap();
        assert_eq!(cached, vec![message("2", 2), message("1", 1)]);
    }

    #[tokio::test]
    async fn test_repeated_online_signal_is_noop() {
        let h = start(true);
        wait_for_mode(&h.handle, SyncMode::Live).await;

        h.connectivity.set_online(true);
        h.connectivity.set_online(true);
        h.handle.flush().await.unwrap();

        assert_eq!(h.feed.subscribe_count(&room()), 1);
        assert_eq!(h.feed.subscriber_count(&room()), 1);
    }

    #[tokio::test]
    async fn test_failed_subscribe_stays_cached_and_retries_on_next_signal() {
        let h = start(false);
        h.handle.flush().await.unwrap();

        h.feed.set_fail_subscribe(true);
        h.connectivity.set_online(true);
        h.handle.flush().await.unwrap();
        assert_eq!(h.handle.mode(), SyncMode::Cached);

        h.feed.set_fail_subscribe(false);
        h.connectivity.set_online(true);
        wait_for_mode(&h.handle, SyncMode::Live).await;
    }

    #[tokio::test]
    async fn test_feed_close_falls_back_to_cached() {
        let h = start(true);
        wait_for_mode(&h.handle, SyncMode::Live).await;

        h.feed.close_subscribers(&room());
        wait_for_mode(&h.handle, SyncMode::Cached).await;
        assert_eq!(h.feed.subscriber_count(&room()), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let h = start(true);
        wait_for_mode(&h.handle, SyncMode::Live).await;

        h.handle.shutdown().await.unwrap();

        assert!(h.handle.is_closed());
        assert_eq!(h.feed.subscriber_count(&room()), 0);
        assert_eq!(h.connectivity.listener_count(), 0);
        assert!(matches!(h.handle.flush().await, Err(SyncError::Closed(_))));
        assert!(h.handle.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_dropping_last_handle_shuts_down() {
        let h = start(true);
        wait_for_mode(&h.handle, SyncMode::Live).await;

        let clone = h.handle.clone();
        drop(h.handle);
        clone.flush().await.unwrap();
        assert_eq!(h.feed.subscriber_count(&room()), 1);

        drop(clone);
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.feed.subscriber_count(&room()) > 0 || h.connectivity.listener_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("coordinator did not shut down");
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let deps = SyncDeps {
            feed: Arc::new(InMemoryFeed::new()),
            blobs: Arc::new(InMemoryBlobStore::default()),
            cache: Arc::new(MemoryMessageCache::default()),
            connectivity: Arc::new(ManualConnectivity::new(true)),
        };
        let config = SyncConfig {
            max_media_bytes: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(
            SyncCoordinator::spawn(room(), deps, config),
            Err(SyncError::Config(_))
        ));
    }
}
