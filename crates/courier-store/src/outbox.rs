//! Durable outbox of not-yet-confirmed outgoing messages.
//!
//! Each helper is one single-row statement whose `WHERE` clause names the
//! status the transition starts from, so a transition that does not apply
//! touches zero rows instead of clobbering a concurrent update.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use courier_shared::{ClientId, ConversationId, MessageId, UserId};

use crate::database::{fmt_ts, parse_opt_ts, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{OutboxMessage, OutboxStatus};

pub(crate) const OUTBOX_COLUMNS: &str = "client_id, conversation_id, sender_id, receiver_id, content, \
     created_at, status, retry_count, last_attempt_at, confirmed_id, sent_at";

impl Database {
    /// Persist a new entry. Must happen before any network attempt.
    pub fn enqueue_outbox(&self, message: &OutboxMessage) -> Result<()> {
        self.conn().execute(
            "INSERT INTO outbox (client_id, conversation_id, sender_id, receiver_id, content,
                                 created_at, status, retry_count, last_attempt_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.client_id.as_str(),
                message.conversation_id.as_ref().map(|c| c.as_str()),
                message.sender_id.as_str(),
                message.receiver_id.as_str(),
                message.content,
                fmt_ts(&message.created_at),
                message.status.as_str(),
                message.retry_count,
                message.last_attempt_at.as_ref().map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    pub fn get_outbox(&self, client_id: &ClientId) -> Result<OutboxMessage> {
        self.conn()
            .query_row(
                &format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE client_id = ?1"),
                params![client_id.as_str()],
                row_to_outbox,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// `pending → sending`, stamping the attempt time.
    pub fn mark_outbox_sending(&self, client_id: &ClientId, at: DateTime<Utc>) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE outbox SET status = 'sending', last_attempt_at = ?2
             WHERE client_id = ?1 AND status = 'pending'",
            params![client_id.as_str(), fmt_ts(&at)],
        )?;
        expect_one(affected, client_id, "pending")
    }

    /// Record relay confirmation. The confirmation is authoritative, so it is
    /// accepted from any non-`sent` state; repeating it is a no-op.
    pub fn mark_outbox_sent(
        &self,
        client_id: &ClientId,
        confirmed_id: &MessageId,
        conversation_id: &ConversationId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE outbox
             SET status = 'sent', confirmed_id = ?2, sent_at = ?3,
                 conversation_id = COALESCE(conversation_id, ?4)
             WHERE client_id = ?1 AND status IN ('pending', 'sending', 'failed')",
            params![
                client_id.as_str(),
                confirmed_id.as_str(),
                fmt_ts(&at),
                conversation_id.as_str(),
            ],
        )?;

        if affected == 0 {
            // Either already sent or gone entirely.
            self.get_outbox(client_id)?;
        }
        Ok(())
    }

    /// Count a failed attempt: `sending → pending`, or `sending → failed`
    /// once `max_retries` attempts have been used. Returns the new status.
    pub fn mark_outbox_attempt_failed(
        &self,
        client_id: &ClientId,
        max_retries: u32,
        at: DateTime<Utc>,
    ) -> Result<OutboxStatus> {
        let status: Option<String> = self
            .conn()
            .query_row(
                "UPDATE outbox
                 SET retry_count = retry_count + 1,
                     status = CASE WHEN retry_count + 1 >= ?2 THEN 'failed' ELSE 'pending' END,
                     last_attempt_at = ?3
                 WHERE client_id = ?1 AND status = 'sending'
                 RETURNING status",
                params![client_id.as_str(), max_retries, fmt_ts(&at)],
                |row| row.get(0),
            )
            .optional()?;

        match status.as_deref().and_then(OutboxStatus::parse) {
            Some(status) => Ok(status),
            None => Err(StoreError::InvalidTransition {
                client_id: client_id.to_string(),
                expected: "sending",
            }),
        }
    }

    /// The relay refused the message outright: `sending → failed`.
    pub fn mark_outbox_rejected(&self, client_id: &ClientId, at: DateTime<Utc>) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE outbox SET status = 'failed', last_attempt_at = ?2
             WHERE client_id = ?1 AND status = 'sending'",
            params![client_id.as_str(), fmt_ts(&at)],
        )?;
        expect_one(affected, client_id, "sending")
    }

    /// `sending → pending` without consuming a retry; the attempt never
    /// reached the network.
    pub fn release_outbox(&self, client_id: &ClientId) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE outbox SET status = 'pending'
             WHERE client_id = ?1 AND status = 'sending'",
            params![client_id.as_str()],
        )?;
        expect_one(affected, client_id, "sending")
    }

    /// Return entries left `sending` by a previous process to `pending`.
    pub fn recover_outbox_in_flight(&self) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE outbox SET status = 'pending' WHERE status = 'sending'",
            [],
        )?;
        Ok(affected)
    }

    /// Pending entries, FIFO by client creation time.
    pub fn list_pending_outbox(&self) -> Result<Vec<OutboxMessage>> {
        self.query_outbox("WHERE status = 'pending'")
    }

    pub fn list_failed_outbox(&self) -> Result<Vec<OutboxMessage>> {
        self.query_outbox("WHERE status = 'failed'")
    }

    pub fn list_outbox(&self) -> Result<Vec<OutboxMessage>> {
        self.query_outbox("")
    }

    /// User-invoked: `failed → pending` with a fresh retry budget.
    pub fn retry_failed_outbox(&self) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE outbox SET status = 'pending', retry_count = 0 WHERE status = 'failed'",
            [],
        )?;
        Ok(affected)
    }

    /// User-invoked: drop every `failed` entry.
    pub fn clear_failed_outbox(&self) -> Result<usize> {
        let affected = self
            .conn()
            .execute("DELETE FROM outbox WHERE status = 'failed'", [])?;
        Ok(affected)
    }

    /// Delete `sent` entries confirmed before `older_than` whose confirmed
    /// message is already part of the local history.
    pub fn purge_sent_outbox(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM outbox
             WHERE status = 'sent'
               AND sent_at <= ?1
               AND confirmed_id IN (SELECT id FROM messages)",
            params![fmt_ts(&older_than)],
        )?;
        Ok(affected)
    }

    fn query_outbox(&self, filter: &str) -> Result<Vec<OutboxMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox {filter} ORDER BY created_at ASC, seq ASC"
        ))?;
        let rows = stmt.query_map([], row_to_outbox)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn expect_one(affected: usize, client_id: &ClientId, expected: &'static str) -> Result<()> {
    if affected == 1 {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            client_id: client_id.to_string(),
            expected,
        })
    }
}

pub(crate) fn row_to_outbox(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxMessage> {
    let client_id: String = row.get(0)?;
    let conversation_id: Option<String> = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let receiver_id: String = row.get(3)?;
    let content: String = row.get(4)?;
    let created_str: String = row.get(5)?;
    let status_str: String = row.get(6)?;
    let retry_count: u32 = row.get(7)?;
    let last_attempt: Option<String> = row.get(8)?;
    let confirmed_id: Option<String> = row.get(9)?;
    let sent_at: Option<String> = row.get(10)?;

    let status = OutboxStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown outbox status: {status_str}").into(),
        )
    })?;

    Ok(OutboxMessage {
        client_id: ClientId(client_id),
        conversation_id: conversation_id.map(ConversationId),
        sender_id: UserId(sender_id),
        receiver_id: UserId(receiver_id),
        content,
        created_at: parse_ts(5, &created_str)?,
        status,
        retry_count,
        last_attempt_at: parse_opt_ts(8, last_attempt)?,
        confirmed_id: confirmed_id.map(MessageId),
        sent_at: parse_opt_ts(10, sent_at)?,
    })
}
