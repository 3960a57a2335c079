//! SQLite message store.
//!
//! rusqlite is synchronous, so every call runs on the blocking pool. One
//! connection behind a mutex is plenty for a chat log.

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::{MessageStore, StoreError};
use crate::message::{format_timestamp, parse_timestamp, ChatMessage, RecordId, StoredMessage};
use crate::supervisor::BACKEND_TIMEOUT;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    username  TEXT NOT NULL,
    message   TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages (timestamp);
";

const SELECT_RECENT: &str = "
SELECT id, username, message, timestamp FROM (
    SELECT id, username, message, timestamp FROM messages
    ORDER BY timestamp DESC, id DESC
    LIMIT ?1
)
ORDER BY timestamp ASC, id ASC
";

const SELECT_LATEST: &str = "
SELECT id, username, message, timestamp FROM messages
ORDER BY timestamp DESC, id DESC
LIMIT ?1
";

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A message store backed by a SQLite database file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and bootstrap the schema.
    ///
    /// `:memory:` opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn = if open_path.as_os_str() == ":memory:" {
                Connection::open_in_memory()?
            } else {
                Connection::open_with_flags(
                    &open_path,
                    OpenFlags::SQLITE_OPEN_READ_WRITE
                        | OpenFlags::SQLITE_OPEN_CREATE
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?
            };
            conn.busy_timeout(BACKEND_TIMEOUT)?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))??;

        debug!(path = %path.display(), "Opened SQLite store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Path the store was opened with.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Internal("connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?
    }
}

fn query_messages(conn: &Connection, sql: &str, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut messages = Vec::new();
    for row in rows {
        let (id, username, body, timestamp) = row?;
        match parse_timestamp(&timestamp) {
            Some(timestamp) => messages.push(StoredMessage {
                id: RecordId(id),
                message: ChatMessage::new(username, body, timestamp),
            }),
            None => warn!(id, timestamp = %timestamp, "Skipping row with unreadable timestamp"),
        }
    }
    Ok(messages)
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    async fn append(&self, message: &ChatMessage) -> Result<RecordId, StoreError> {
        let username = message.username.clone();
        let body = message.body.clone();
        let timestamp = format_timestamp(&message.timestamp);

        self.run(move |conn| {
            conn.execute(
                "INSERT INTO messages (username, message, timestamp) VALUES (?1, ?2, ?3)",
                params![username, body, timestamp],
            )?;
            Ok(RecordId(conn.last_insert_rowid()))
        })
        .await
    }

    async fn recent_ordered(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        self.run(move |conn| query_messages(conn, SELECT_RECENT, limit))
            .await
    }

    async fn latest(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        self.run(move |conn| query_messages(conn, SELECT_LATEST, limit))
            .await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.run(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
        .await
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
