//! In-process collaborators.
//!
//! Usable for embedding the core without a backend and for tests. Each one
//! exposes failure switches in the style of a failable storage wrapper.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::capabilities::{
    BlobError, BlobKey, BlobStore, ConnectivityMonitor, FeedError, FeedSubscription, Microphone, MicrophoneError,
    RemoteFeed, StatusCallback, SubscriptionGuard,
};
use crate::model::{Confirmation, ConversationId, MediaUrl, Message, MessageDraft, MessageId, Snapshot, UnixTimeMs};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// --- Remote feed ---

#[derive(Default)]
struct Room {
    /// Newest first.
    messages: Vec<Message>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Snapshot>>,
    subscribe_count: usize,
}

impl Room {
    fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.messages.clone())
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot();
        self.subscribers
            .retain(|_, tx| tx.send(snapshot.clone()).is_ok());
    }
}

/// Feed that replays the full ordered set on every subscribe and pushes a new
/// full snapshot after every write.
pub struct InMemoryFeed {
    rooms: Arc<Mutex<HashMap<ConversationId, Room>>>,
    next_subscriber: AtomicU64,
    next_message: AtomicU64,
    last_timestamp: AtomicU64,
    fail_subscribe: AtomicBool,
    fail_writes: Mutex<Option<FeedError>>,
}

impl InMemoryFeed {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: AtomicU64::new(0),
            next_message: AtomicU64::new(1),
            last_timestamp: AtomicU64::new(0),
            fail_subscribe: AtomicBool::new(false),
            fail_writes: Mutex::new(None),
        }
    }

    /// Replace a conversation's contents, as if written by other participants.
    /// `messages` must already be newest first.
    pub fn seed(&self, conversation: &ConversationId, messages: Vec<Message>) {
        let mut rooms = lock(&self.rooms);
        let room = rooms.entry(conversation.clone()).or_default();
        room.messages = messages;
        room.publish();
    }

    #[must_use]
    pub fn messages(&self, conversation: &ConversationId) -> Vec<Message> {
        lock(&self.rooms)
            .get(conversation)
            .map(|room| room.messages.clone())
            .unwrap_or_default()
    }

    /// Active subscriptions.
    #[must_use]
    pub fn subscriber_count(&self, conversation: &ConversationId) -> usize {
        lock(&self.rooms)
            .get(conversation)
            .map_or(0, |room| room.subscribers.len())
    }

    /// Successful subscribe calls over the feed's lifetime.
    #[must_use]
    pub fn subscribe_count(&self, conversation: &ConversationId) -> usize {
        lock(&self.rooms)
            .get(conversation)
            .map_or(0, |room| room.subscribe_count)
    }

    /// End every open stream for the conversation from the remote side.
    pub fn close_subscribers(&self, conversation: &ConversationId) {
        if let Some(room) = lock(&self.rooms).get_mut(conversation) {
            room.subscribers.clear();
        }
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes_with(&self, error: Option<FeedError>) {
        *lock(&self.fail_writes) = error;
    }

    /// Server clock: wall time, forced strictly increasing.
    fn next_timestamp(&self) -> UnixTimeMs {
        let now = UnixTimeMs::now().as_millis();
        let mut prev = self.last_timestamp.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev.saturating_add(1));
            match self
                .last_timestamp
                .compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return UnixTimeMs(next),
                Err(actual) => prev = actual,
            }
        }
    }
}

impl Default for InMemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RemoteFeed for InMemoryFeed {
    async fn subscribe(&self, conversation: &ConversationId) -> Result<FeedSubscription, FeedError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(FeedError::Unavailable("injected subscribe failure".into()));
        }

        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut rooms = lock(&self.rooms);
            let room = rooms.entry(conversation.clone()).or_default();
            let _ = tx.send(room.snapshot());
            room.subscribers.insert(id, tx);
            room.subscribe_count += 1;
        }

        debug!(conversation = %conversation, subscriber = id, "feed subscriber attached");

        let rooms = Arc::clone(&self.rooms);
        let conversation = conversation.clone();
        let guard = SubscriptionGuard::new(move || {
            if let Some(room) = lock(&rooms).get_mut(&conversation) {
                room.subscribers.remove(&id);
            }
        });

        Ok(FeedSubscription::new(rx, guard))
    }

    async fn write(&self, conversation: &ConversationId, draft: MessageDraft) -> Result<Confirmation, FeedError> {
        if let Some(error) = lock(&self.fail_writes).clone() {
            return Err(error);
        }

        let confirmation = Confirmation {
            id: MessageId::new(self.next_message.fetch_add(1, Ordering::SeqCst).to_string()),
            created_at: self.next_timestamp(),
            local_id: draft.local_id.clone(),
        };

        let mut rooms = lock(&self.rooms);
        let room = rooms.entry(conversation.clone()).or_default();
        room.messages.insert(0, draft.confirm(&confirmation));
        room.publish();

        Ok(confirmation)
    }
}

// --- Blob store ---

pub struct InMemoryBlobStore {
    /// Always ends with `/`.
    base_url: String,
    objects: Mutex<HashMap<BlobKey, (Bytes, String)>>,
    puts: AtomicUsize,
    fail_puts: Mutex<Option<BlobError>>,
    fail_resolve: Mutex<Option<BlobError>>,
}

impl InMemoryBlobStore {
    pub const DEFAULT_BASE_URL: &'static str = "https://blobs.invalid/";

    /// `base_url` must be an absolute http(s) URL; objects resolve beneath it.
    pub fn new(base_url: &str) -> Result<Self, BlobError> {
        let parsed = Url::parse(base_url).map_err(|e| BlobError::Unconfigured(e.to_string()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(BlobError::Unconfigured(format!("unsupported scheme '{}'", parsed.scheme())));
        }

        let mut base_url = parsed.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self::with_base(base_url))
    }

    fn with_base(base_url: String) -> Self {
        Self {
            base_url,
            objects: Mutex::new(HashMap::new()),
            puts: AtomicUsize::new(0),
            fail_puts: Mutex::new(None),
            fail_resolve: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn get(&self, key: &BlobKey) -> Option<Bytes> {
        lock(&self.objects).get(key).map(|(bytes, _)| bytes.clone())
    }

    #[must_use]
    pub fn content_type(&self, key: &BlobKey) -> Option<String> {
        lock(&self.objects).get(key).map(|(_, ct)| ct.clone())
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }

    /// Put attempts, including failed ones.
    #[must_use]
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn fail_puts_with(&self, error: Option<BlobError>) {
        *lock(&self.fail_puts) = error;
    }

    pub fn fail_resolve_with(&self, error: Option<BlobError>) {
        *lock(&self.fail_resolve) = error;
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::with_base(Self::DEFAULT_BASE_URL.to_string())
    }
}

#[async_trait::async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &BlobKey, bytes: Bytes, content_type: &str) -> Result<(), BlobError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.fail_puts).clone() {
            return Err(error);
        }
        lock(&self.objects).insert(key.clone(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn resolve_url(&self, key: &BlobKey) -> Result<MediaUrl, BlobError> {
        if let Some(error) = lock(&self.fail_resolve).clone() {
            return Err(error);
        }
        if !lock(&self.objects).contains_key(key) {
            return Err(BlobError::NotFound {
                key: key.to_string(),
            });
        }

        MediaUrl::new(format!("{}{key}", self.base_url)).map_err(|e| BlobError::Unknown(e.to_string()))
    }
}

// --- Connectivity ---

/// Connectivity driven by hand. Callbacks run on the caller of `set_online`.
pub struct ManualConnectivity {
    state: Arc<Mutex<ConnectivityState>>,
}

struct ConnectivityState {
    online: bool,
    next_id: u64,
    listeners: HashMap<u64, StatusCallback>,
}

impl ManualConnectivity {
    #[must_use]
    pub fn new(online: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectivityState {
                online,
                next_id: 0,
                listeners: HashMap::new(),
            })),
        }
    }

    /// Record the new status and notify every listener, even if unchanged.
    pub fn set_online(&self, online: bool) {
        let listeners: Vec<StatusCallback> = {
            let mut state = lock(&self.state);
            state.online = online;
            state.listeners.values().cloned().collect()
        };

        for listener in listeners {
            listener(online);
        }
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        lock(&self.state).listeners.len()
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn status(&self) -> bool {
        lock(&self.state).online
    }

    fn subscribe(&self, callback: StatusCallback) -> SubscriptionGuard {
        let (id, online) = {
            let mut state = lock(&self.state);
            let id = state.next_id;
            state.next_id += 1;
            state.listeners.insert(id, Arc::clone(&callback));
            (id, state.online)
        };

        callback(online);

        let state = Arc::clone(&self.state);
        SubscriptionGuard::new(move || {
            lock(&state).listeners.remove(&id);
        })
    }
}

// --- Microphone ---

/// Microphone that returns pre-recorded clips in order.
pub struct ScriptedMicrophone {
    permission: AtomicBool,
    recording: AtomicBool,
    clips: Mutex<VecDeque<Bytes>>,
    starts: AtomicUsize,
}

impl ScriptedMicrophone {
    #[must_use]
    pub fn new(permission: bool) -> Self {
        Self {
            permission: AtomicBool::new(permission),
            recording: AtomicBool::new(false),
            clips: Mutex::new(VecDeque::new()),
            starts: AtomicUsize::new(0),
        }
    }

    pub fn push_clip(&self, clip: Bytes) {
        lock(&self.clips).push_back(clip);
    }

    pub fn set_permission(&self, granted: bool) {
        self.permission.store(granted, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Microphone for ScriptedMicrophone {
    async fn request_permission(&self) -> bool {
        self.permission.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<(), MicrophoneError> {
        if !self.permission.load(Ordering::SeqCst) {
            return Err(MicrophoneError::PermissionDenied);
        }
        if self.recording.swap(true, Ordering::SeqCst) {
            return Err(MicrophoneError::Device("already recording".into()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<Bytes, MicrophoneError> {
        if !self.recording.swap(false, Ordering::SeqCst) {
            return Err(MicrophoneError::NotRecording);
        }
        lock(&self.clips)
            .pop_front()
            .ok_or_else(|| MicrophoneError::Device("no clip scripted".into()))
    }
}
