use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{decode_snapshot, encode_snapshot, CacheError, MessageCache};
use crate::model::{ConversationId, Message};

/// One snapshot file per conversation under a cache directory.
///
/// Writes go to a temp file, are synced, then renamed over the previous
/// snapshot, so a crash leaves either the old or the new list on disk.
#[derive(Debug, Clone)]
pub struct FileMessageCache {
    dir: PathBuf,
}

impl FileMessageCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Conversation ids are opaque, so the file name is derived from a digest.
    #[must_use]
    pub fn path_for(&self, conversation: &ConversationId) -> PathBuf {
        let digest = blake3::hash(conversation.as_str().as_bytes());
        self.dir
            .join(format!("conversation_{}.snapshot", &digest.to_hex()[..32]))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let tmp_path = path.with_extension("tmp");

    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

fn read_snapshot(path: &Path, conversation: &ConversationId) -> Result<Option<Vec<Message>>, CacheError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    decode_snapshot(conversation, &bytes).map(Some)
}

#[async_trait::async_trait]
impl MessageCache for FileMessageCache {
    async fn read(&self, conversation: &ConversationId) -> Result<Option<Vec<Message>>, CacheError> {
        let path = self.path_for(conversation);
        let conversation = conversation.clone();
        tokio::task::spawn_blocking(move || read_snapshot(&path, &conversation)).await?
    }

    async fn write(&self, conversation: &ConversationId, messages: &[Message]) -> Result<(), CacheError> {
        let bytes = encode_snapshot(conversation, messages)?;
        let path = self.path_for(conversation);
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes)).await?
    }
}
