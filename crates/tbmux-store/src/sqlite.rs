//! SQLite persistence for the update log, message cache and consumer cursors.

use crate::{StoreResult, StoredUpdate, UpdateOrigin};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Durable store backing the proxy: an append-only update log, the latest
/// known payload per message, and one cursor per downstream consumer.
///
/// Every operation opens its own connection, so the store can be shared
/// freely across tasks. Writers serialise on SQLite's own locking; the
/// `AUTOINCREMENT` primary key of the log is the only cross-transaction
/// ordering requirement.
#[derive(Debug)]
pub struct UpdateStore {
    db_path: PathBuf,
    notify: Notify,
}

impl UpdateStore {
    /// Opens the store at `path`, creating the file and schema if needed.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self {
            db_path,
            notify: Notify::new(),
        };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS updates (
                local_id INTEGER PRIMARY KEY AUTOINCREMENT,
                origin TEXT NOT NULL,
                upstream_update_id INTEGER NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                chat_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (chat_id, message_id)
            );

            CREATE TABLE IF NOT EXISTS cursors (
                consumer_id TEXT PRIMARY KEY,
                next_local_id INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Opens a transaction. Inserts made through it commit or fail together;
    /// dropping the transaction without [`UpdateTx::commit`] rolls it back.
    pub fn begin(&self) -> StoreResult<UpdateTx> {
        let connection = self.open_connection()?;
        connection.execute_batch("BEGIN IMMEDIATE")?;
        Ok(UpdateTx { connection })
    }

    /// Wakes every consumer parked in [`UpdateStore::fetch_updates`].
    ///
    /// Level-triggered: woken consumers re-query the log themselves, so a
    /// single call may surface any number of new updates and redundant calls
    /// are harmless.
    pub fn notify_updates(&self) {
        self.notify.notify_waiters();
    }

    /// Returns updates at or past `consumer_id`'s cursor, oldest first, up to
    /// `limit`. When none are pending, blocks up to `timeout` waiting for a
    /// [`UpdateStore::notify_updates`] wake, and returns an empty batch at
    /// deadline expiry. Dropping the future cancels the wait.
    pub async fn fetch_updates(
        &self,
        consumer_id: &str,
        limit: usize,
        timeout: Duration,
    ) -> StoreResult<Vec<StoredUpdate>> {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.query_pending(consumer_id, limit)?;
            if !pending.is_empty() {
                return Ok(pending);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let remaining = deadline.saturating_duration_since(now);
            if tokio::time::timeout(remaining, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    fn query_pending(&self, consumer_id: &str, limit: usize) -> StoreResult<Vec<StoredUpdate>> {
        let connection = self.open_connection()?;
        let cursor = Self::cursor_position(&connection, consumer_id)?;

        let mut statement = connection.prepare(
            r#"
            SELECT local_id, kind, payload FROM updates
            WHERE local_id >= ?1
            ORDER BY local_id ASC
            LIMIT ?2
            "#,
        )?;
        let mut rows = statement.query(params![cursor as i64, limit.max(1) as i64])?;

        let mut updates = Vec::new();
        while let Some(row) = rows.next()? {
            let local_id: i64 = row.get(0)?;
            let payload: String = row.get(2)?;
            updates.push(StoredUpdate {
                local_id: local_id as u64,
                kind: row.get(1)?,
                payload: serde_json::from_str(&payload)?,
            });
        }
        Ok(updates)
    }

    /// Current cursor for `consumer_id`; 0 when it has never been advanced.
    pub fn cursor(&self, consumer_id: &str) -> StoreResult<u64> {
        let connection = self.open_connection()?;
        Self::cursor_position(&connection, consumer_id)
    }

    fn cursor_position(connection: &Connection, consumer_id: &str) -> StoreResult<u64> {
        let next: Option<i64> = connection
            .query_row(
                "SELECT next_local_id FROM cursors WHERE consumer_id = ?1",
                params![consumer_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(next.unwrap_or(0).max(0) as u64)
    }

    /// Moves `consumer_id`'s cursor to `new_next`. Never moves it backwards:
    /// a `new_next` at or below the current position is ignored.
    pub fn advance_cursor(&self, consumer_id: &str, new_next: u64) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO cursors (consumer_id, next_local_id) VALUES (?1, ?2)
            ON CONFLICT(consumer_id) DO UPDATE SET
                next_local_id = MAX(cursors.next_local_id, excluded.next_local_id)
            "#,
            params![consumer_id, new_next as i64],
        )?;
        Ok(())
    }

    /// Latest cached payload for `(chat_id, message_id)`, if any.
    pub fn cached_message(&self, chat_id: i64, message_id: i64) -> StoreResult<Option<Value>> {
        let connection = self.open_connection()?;
        let payload: Option<String> = connection
            .query_row(
                "SELECT payload FROM messages WHERE chat_id = ?1 AND message_id = ?2",
                params![chat_id, message_id],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|payload| serde_json::from_str(&payload))
            .transpose()
            .map_err(Into::into)
    }
}

/// Atomic unit of log and cache work, bound to its own connection.
pub struct UpdateTx {
    connection: Connection,
}

impl UpdateTx {
    /// Appends an update to the log and returns its assigned `local_id`.
    pub fn insert_update(
        &self,
        origin: UpdateOrigin,
        upstream_update_id: Option<u64>,
        kind: &str,
        payload: &Value,
    ) -> StoreResult<u64> {
        self.connection.execute(
            r#"
            INSERT INTO updates (origin, upstream_update_id, kind, payload)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                origin.as_str(),
                upstream_update_id.map(|id| id as i64),
                kind,
                serde_json::to_string(payload)?,
            ],
        )?;
        Ok(self.connection.last_insert_rowid() as u64)
    }

    /// Replaces the cached payload for the message described by `payload`.
    /// A payload without both `chat.id` and `message_id` is a no-op.
    pub fn upsert_message(&self, payload: &Value) -> StoreResult<()> {
        let Some(chat_id) = payload
            .pointer("/chat/id")
            .and_then(Value::as_i64)
            .filter(|id| *id != 0)
        else {
            return Ok(());
        };
        let Some(message_id) = payload
            .get("message_id")
            .and_then(Value::as_i64)
            .filter(|id| *id != 0)
        else {
            return Ok(());
        };

        self.connection.execute(
            r#"
            INSERT INTO messages (chat_id, message_id, payload) VALUES (?1, ?2, ?3)
            ON CONFLICT(chat_id, message_id) DO UPDATE SET payload = excluded.payload
            "#,
            params![chat_id, message_id, serde_json::to_string(payload)?],
        )?;
        Ok(())
    }

    pub fn commit(self) -> StoreResult<()> {
        self.connection.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(self) -> StoreResult<()> {
        self.connection.execute_batch("ROLLBACK")?;
        Ok(())
    }
}
