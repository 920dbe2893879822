//! Durable store of confirmed messages.
//!
//! Appends go through a single connection lock, and each one is stamped by
//! a [`MonotonicClock`] while that lock is held, so timestamps are strictly
//! increasing in persistence order and a `server_timestamp > cursor` fetch
//! can never skip a message.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use courier_shared::{ClientId, ConfirmedMessage, ConversationId, MessageId, UserId};

use crate::error::{Result, ServerError};

/// A message accepted by the relay but not yet persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub client_id: Option<ClientId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub message: ConfirmedMessage,
    /// `true` when `(sender, client_id)` was already stored; `message` is the
    /// original.
    pub duplicate: bool,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message. Idempotent on `(sender_id, client_id)`.
    async fn append(&self, message: NewMessage) -> Result<AppendOutcome>;

    /// Messages with `server_timestamp > after`, ascending, at most `limit`.
    async fn since(
        &self,
        conversation_id: &ConversationId,
        after: i64,
        limit: usize,
    ) -> Result<Vec<ConfirmedMessage>>;

    /// Stamp `read_at` on unread messages received by `reader_id`.
    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        reader_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<usize>;

    async fn count(&self) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Millisecond clock that never repeats or goes backwards.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: i64,
}

impl MonotonicClock {
    pub fn starting_after(last: i64) -> Self {
        Self { last }
    }

    /// `max(now_ms, last + 1)`.
    pub fn next(&mut self, now_ms: i64) -> i64 {
        self.last = now_ms.max(self.last + 1);
        self.last
    }
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS relay_messages (
    id               TEXT PRIMARY KEY NOT NULL,
    client_id        TEXT,
    conversation_id  TEXT NOT NULL,
    sender_id        TEXT NOT NULL,
    receiver_id      TEXT NOT NULL,
    content          TEXT NOT NULL,
    server_timestamp INTEGER NOT NULL,
    read_at          TEXT
);

CREATE INDEX IF NOT EXISTS idx_relay_messages_conv_ts
    ON relay_messages(conversation_id, server_timestamp);

CREATE UNIQUE INDEX IF NOT EXISTS idx_relay_messages_sender_client
    ON relay_messages(sender_id, client_id) WHERE client_id IS NOT NULL;
"#;

const COLUMNS: &str =
    "id, client_id, conversation_id, sender_id, receiver_id, content, server_timestamp, read_at";

struct Inner {
    conn: Connection,
    clock: MonotonicClock,
}

pub struct SqliteMessageStore {
    inner: Mutex<Inner>,
}

impl SqliteMessageStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;

        // Resume the clock above anything already stored.
        let last: i64 = conn.query_row(
            "SELECT COALESCE(MAX(server_timestamp), 0) FROM relay_messages",
            [],
            |row| row.get(0),
        )?;

        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                clock: MonotonicClock::starting_after(last),
            }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| ServerError::Internal("message store lock poisoned".into()))
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append(&self, message: NewMessage) -> Result<AppendOutcome> {
        let mut inner = self.lock()?;

        if let Some(client_id) = &message.client_id {
            let existing = inner
                .conn
                .query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM relay_messages
                         WHERE sender_id = ?1 AND client_id = ?2"
                    ),
                    params![message.sender_id.as_str(), client_id.as_str()],
                    row_to_message,
                )
                .optional()?;
            if let Some(existing) = existing {
                return Ok(AppendOutcome {
                    message: existing,
                    duplicate: true,
                });
            }
        }

        let server_timestamp = inner.clock.next(Utc::now().timestamp_millis());
        let confirmed = ConfirmedMessage {
            id: MessageId::generate(),
            client_id: message.client_id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            content: message.content,
            server_timestamp,
            read_at: None,
        };

        inner.conn.execute(
            "INSERT INTO relay_messages
                 (id, client_id, conversation_id, sender_id, receiver_id, content, server_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                confirmed.id.as_str(),
                confirmed.client_id.as_ref().map(|c| c.as_str()),
                confirmed.conversation_id.as_str(),
                confirmed.sender_id.as_str(),
                confirmed.receiver_id.as_str(),
                confirmed.content,
                confirmed.server_timestamp,
            ],
        )?;

        Ok(AppendOutcome {
            message: confirmed,
            duplicate: false,
        })
    }

    async fn since(
        &self,
        conversation_id: &ConversationId,
        after: i64,
        limit: usize,
    ) -> Result<Vec<ConfirmedMessage>> {
        let inner = self.lock()?;
        let mut stmt = inner.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM relay_messages
             WHERE conversation_id = ?1 AND server_timestamp > ?2
             ORDER BY server_timestamp ASC
             LIMIT ?3"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(
            params![conversation_id.as_str(), after, limit],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        reader_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let inner = self.lock()?;
        let affected = inner.conn.execute(
            "UPDATE relay_messages SET read_at = ?3
             WHERE conversation_id = ?1 AND receiver_id = ?2 AND read_at IS NULL",
            params![
                conversation_id.as_str(),
                reader_id.as_str(),
                at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )?;
        Ok(affected)
    }

    async fn count(&self) -> Result<u64> {
        let inner = self.lock()?;
        let n: i64 = inner
            .conn
            .query_row("SELECT COUNT(*) FROM relay_messages", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConfirmedMessage> {
    let id: String = row.get(0)?;
    let client_id: Option<String> = row.get(1)?;
    let conversation_id: String = row.get(2)?;
    let sender_id: String = row.get(3)?;
    let receiver_id: String = row.get(4)?;
    let content: String = row.get(5)?;
    let server_timestamp: i64 = row.get(6)?;
    let read_at: Option<String> = row.get(7)?;

    let read_at = read_at
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        7,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })
        })
        .transpose()?;

    Ok(ConfirmedMessage {
        id: MessageId(id),
        client_id: client_id.map(ClientId),
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId(sender_id),
        receiver_id: UserId(receiver_id),
        content,
        server_timestamp,
        read_at,
    })
}
