//! v001 -- Initial schema creation.
//!
//! Creates the three client tables: `outbox`, `messages` and `conversations`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Outbox: messages not yet confirmed durable on the relay
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS outbox (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,  -- insertion order, FIFO tiebreak
    client_id       TEXT NOT NULL UNIQUE,               -- idempotency key
    conversation_id TEXT,                               -- NULL until the relay allocates one
    sender_id       TEXT NOT NULL,
    receiver_id     TEXT NOT NULL,
    content         TEXT NOT NULL,
    created_at      TEXT NOT NULL,                      -- client clock, RFC-3339 (micros)
    status          TEXT NOT NULL
                    CHECK (status IN ('pending', 'sending', 'sent', 'failed')),
    retry_count     INTEGER NOT NULL DEFAULT 0,
    last_attempt_at TEXT,
    confirmed_id    TEXT,                               -- relay message id once sent
    sent_at         TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_status_created
    ON outbox(status, created_at, seq);

-- ----------------------------------------------------------------
-- Confirmed history
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id               TEXT PRIMARY KEY NOT NULL,         -- relay-assigned
    client_id        TEXT,
    conversation_id  TEXT NOT NULL,
    sender_id        TEXT NOT NULL,
    receiver_id      TEXT NOT NULL,
    content          TEXT NOT NULL,
    server_timestamp INTEGER NOT NULL,                  -- ms since epoch, relay clock
    read_at          TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, server_timestamp);

CREATE INDEX IF NOT EXISTS idx_messages_client_id
    ON messages(client_id);

-- ----------------------------------------------------------------
-- Known conversations and their sync cursors
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id          TEXT PRIMARY KEY NOT NULL,
    peer_id     TEXT NOT NULL,
    archived    INTEGER NOT NULL DEFAULT 0,             -- boolean 0/1
    sync_cursor INTEGER NOT NULL DEFAULT 0              -- last reconciled server_timestamp
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
