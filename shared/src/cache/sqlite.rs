use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use super::{decode_snapshot, encode_snapshot, CacheError, MessageCache};
use crate::model::{ConversationId, Message, UnixTimeMs};

/// SQLite-backed cache, one row per conversation.
#[derive(Clone)]
pub struct SqliteMessageCache {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMessageCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let conn = Connection::open(path).map_err(storage_error)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory().map_err(storage_error)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS message_snapshots (
                conversation_id TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                message_count INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            ",
        )
        .map_err(storage_error)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Number of messages in the stored snapshot, without decoding it.
    pub async fn message_count(&self, conversation: &ConversationId) -> Result<Option<u64>, CacheError> {
        let conn = Arc::clone(&self.conn);
        let conversation = conversation.clone();

        tokio::task::spawn_blocking(move || -> Result<Option<u64>, CacheError> {
            let conn = conn.lock().map_err(|_| CacheError::LockFailed)?;
            let count: Option<i64> = conn
                .query_row(
                    "SELECT message_count FROM message_snapshots WHERE conversation_id = ?1",
                    params![conversation.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_error)?;
            Ok(count.map(|c| u64::try_from(c).unwrap_or(0)))
        })
        .await?
    }
}

fn storage_error(e: rusqlite::Error) -> CacheError {
    CacheError::Storage(e.to_string())
}

#[async_trait::async_trait]
impl MessageCache for SqliteMessageCache {
    async fn read(&self, conversation: &ConversationId) -> Result<Option<Vec<Message>>, CacheError> {
        let conn = Arc::clone(&self.conn);
        let conversation = conversation.clone();

        tokio::task::spawn_blocking(move || -> Result<Option<Vec<Message>>, CacheError> {
            let data: Option<Vec<u8>> = {
                let conn = conn.lock().map_err(|_| CacheError::LockFailed)?;
                conn.query_row(
                    "SELECT data FROM message_snapshots WHERE conversation_id = ?1",
                    params![conversation.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage_error)?
            };

            data.map(|bytes| decode_snapshot(&conversation, &bytes))
                .transpose()
        })
        .await?
    }

    async fn write(&self, conversation: &ConversationId, messages: &[Message]) -> Result<(), CacheError> {
        let data = encode_snapshot(conversation, messages)?;
        let count = i64::try_from(messages.len()).unwrap_or(i64::MAX);
        let updated_at = i64::try_from(UnixTimeMs::now().as_millis()).unwrap_or(i64::MAX);
        let conn = Arc::clone(&self.conn);
        let conversation = conversation.clone();

        tokio::task::spawn_blocking(move || -> Result<(), CacheError> {
            let conn = conn.lock().map_err(|_| CacheError::LockFailed)?;
            conn.execute(
                r"
                INSERT INTO message_snapshots (conversation_id, data, message_count, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(conversation_id) DO UPDATE SET
                    data = excluded.data,
                    message_count = excluded.message_count,
                    updated_at = excluded.updated_at
                ",
                params![conversation.as_str(), data, count, updated_at],
            )
            .map_err(storage_error)?;
            Ok(())
        })
        .await?
    }
}
