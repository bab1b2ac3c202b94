use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};

use lru::LruCache;
use tokio::sync::Mutex;

use super::{decode_snapshot, encode_snapshot, CacheError, MessageCache};
use crate::model::{ConversationId, Message};

/// Process-local cache bounded by conversation count. Least recently used
/// conversations are evicted first.
///
/// Entries are kept in their serialized envelope form, so reads exercise the
/// same decoding path as the durable backends.
pub struct MemoryMessageCache {
    entries: Mutex<LruCache<ConversationId, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryMessageCache {
    pub const DEFAULT_CAPACITY: usize = 64;

    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make subsequent reads fail, as a lost or unreadable store would.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

impl Default for MemoryMessageCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[async_trait::async_trait]
impl MessageCache for MemoryMessageCache {
    async fn read(&self, conversation: &ConversationId) -> Result<Option<Vec<Message>>, CacheError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::Storage("injected read failure".into()));
        }

        let mut entries = self.entries.lock().await;
        match entries.get(conversation) {
            Some(bytes) => decode_snapshot(conversation, bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn write(&self, conversation: &ConversationId, messages: &[Message]) -> Result<(), CacheError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Storage("injected write failure".into()));
        }

        let bytes = encode_snapshot(conversation, messages)?;
        self.entries.lock().await.put(conversation.clone(), bytes);
        Ok(())
    }
}
