use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use courier_shared::{ClientId, ConfirmedMessage, ConversationId, MessageId, UserId};

use crate::database::{fmt_ts, parse_opt_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{LocalConversation, ViewEntry};
use crate::outbox::{row_to_outbox, OUTBOX_COLUMNS};

const MESSAGE_COLUMNS: &str =
    "id, client_id, conversation_id, sender_id, receiver_id, content, server_timestamp, read_at";

impl Database {
    // -----------------------------------------------------------------------
    // Confirmed history
    // -----------------------------------------------------------------------

    /// Merge a relay-confirmed message. Idempotent on the message id; a
    /// repeated copy only refreshes `read_at`. Returns `true` if the message
    /// was not known before.
    pub fn upsert_confirmed(&self, message: &ConfirmedMessage) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO messages
                 (id, client_id, conversation_id, sender_id, receiver_id, content,
                  server_timestamp, read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id.as_str(),
                message.client_id.as_ref().map(|c| c.as_str()),
                message.conversation_id.as_str(),
                message.sender_id.as_str(),
                message.receiver_id.as_str(),
                message.content,
                message.server_timestamp,
                message.read_at.as_ref().map(fmt_ts),
            ],
        )?;

        if inserted == 0 {
            if let Some(read_at) = &message.read_at {
                self.conn().execute(
                    "UPDATE messages SET read_at = ?2 WHERE id = ?1",
                    params![message.id.as_str(), fmt_ts(read_at)],
                )?;
            }
        }

        Ok(inserted == 1)
    }

    /// Confirmed messages of one conversation in server order.
    pub fn messages_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ConfirmedMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY server_timestamp ASC, id ASC"
        ))?;

        let rows = stmt.query_map(params![conversation_id.as_str()], row_to_confirmed)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn find_confirmed_by_client_id(
        &self,
        client_id: &ClientId,
    ) -> Result<Option<ConfirmedMessage>> {
        let found = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE client_id = ?1"),
                params![client_id.as_str()],
                row_to_confirmed,
            )
            .optional()?;
        Ok(found)
    }

    /// Stamp `read_at` on the messages `reader_id` received in a conversation.
    pub fn apply_read_receipt(
        &self,
        conversation_id: &ConversationId,
        reader_id: &UserId,
        read_at: DateTime<Utc>,
    ) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE messages SET read_at = ?3
             WHERE conversation_id = ?1 AND receiver_id = ?2 AND read_at IS NULL",
            params![conversation_id.as_str(), reader_id.as_str(), fmt_ts(&read_at)],
        )?;
        Ok(affected)
    }

    // -----------------------------------------------------------------------
    // Conversations and cursors
    // -----------------------------------------------------------------------

    /// Record a conversation learned from the relay. The sync cursor of an
    /// existing row is left untouched.
    pub fn upsert_conversation(
        &self,
        id: &ConversationId,
        peer_id: &UserId,
        archived: bool,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO conversations (id, peer_id, archived) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET peer_id = excluded.peer_id,
                                           archived = excluded.archived",
            params![id.as_str(), peer_id.as_str(), archived],
        )?;
        Ok(())
    }

    /// Record a conversation first seen through one of its messages. Existing
    /// rows are left as they are.
    pub fn ensure_conversation(&self, id: &ConversationId, peer_id: &UserId) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO conversations (id, peer_id) VALUES (?1, ?2)",
            params![id.as_str(), peer_id.as_str()],
        )?;
        Ok(inserted == 1)
    }

    pub fn get_conversation(&self, id: &ConversationId) -> Result<LocalConversation> {
        self.conn()
            .query_row(
                "SELECT id, peer_id, archived, sync_cursor FROM conversations WHERE id = ?1",
                params![id.as_str()],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn find_conversation_with(&self, peer_id: &UserId) -> Result<Option<LocalConversation>> {
        let found = self
            .conn()
            .query_row(
                "SELECT id, peer_id, archived, sync_cursor FROM conversations
                 WHERE peer_id = ?1 LIMIT 1",
                params![peer_id.as_str()],
                row_to_conversation,
            )
            .optional()?;
        Ok(found)
    }

    pub fn list_conversations(&self) -> Result<Vec<LocalConversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, peer_id, archived, sync_cursor FROM conversations ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    pub fn set_conversation_archived(&self, id: &ConversationId, archived: bool) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE conversations SET archived = ?2 WHERE id = ?1",
            params![id.as_str(), archived],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Last reconciled server timestamp; `0` for a conversation never synced.
    pub fn sync_cursor(&self, id: &ConversationId) -> Result<i64> {
        let cursor: Option<i64> = self
            .conn()
            .query_row(
                "SELECT sync_cursor FROM conversations WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor.unwrap_or(0))
    }

    /// Move the cursor forward to `to`. Never moves it backwards; returns the
    /// resulting cursor.
    pub fn advance_sync_cursor(&self, id: &ConversationId, to: i64) -> Result<i64> {
        let cursor: Option<i64> = self
            .conn()
            .query_row(
                "UPDATE conversations SET sync_cursor = MAX(sync_cursor, ?2)
                 WHERE id = ?1
                 RETURNING sync_cursor",
                params![id.as_str(), to],
                |row| row.get(0),
            )
            .optional()?;
        cursor.ok_or(StoreError::NotFound)
    }

    // -----------------------------------------------------------------------
    // View
    // -----------------------------------------------------------------------

    /// Confirmed messages in server order followed by the optimistic bubbles
    /// of outbox entries that have no confirmed counterpart yet.
    ///
    /// Entries still waiting for the relay to allocate a conversation are
    /// matched by receiver against the conversation's peer.
    pub fn conversation_view(&self, conversation_id: &ConversationId) -> Result<Vec<ViewEntry>> {
        let mut view: Vec<ViewEntry> = self
            .messages_for_conversation(conversation_id)?
            .into_iter()
            .map(ViewEntry::Confirmed)
            .collect();

        let mut stmt = self.conn().prepare(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox o
             WHERE (o.conversation_id = ?1
                    OR (o.conversation_id IS NULL
                        AND o.receiver_id = (SELECT peer_id FROM conversations WHERE id = ?1)))
               AND NOT EXISTS (SELECT 1 FROM messages m WHERE m.client_id = o.client_id)
             ORDER BY o.created_at ASC, o.seq ASC"
        ))?;
        let rows = stmt.query_map(params![conversation_id.as_str()], row_to_outbox)?;
        for row in rows {
            view.push(ViewEntry::Pending(row?));
        }

        Ok(view)
    }
}

fn row_to_confirmed(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConfirmedMessage> {
    let id: String = row.get(0)?;
    let client_id: Option<String> = row.get(1)?;
    let conversation_id: String = row.get(2)?;
    let sender_id: String = row.get(3)?;
    let receiver_id: String = row.get(4)?;
    let content: String = row.get(5)?;
    let server_timestamp: i64 = row.get(6)?;
    let read_at: Option<String> = row.get(7)?;

    Ok(ConfirmedMessage {
        id: MessageId(id),
        client_id: client_id.map(ClientId),
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId(sender_id),
        receiver_id: UserId(receiver_id),
        content,
        server_timestamp,
        read_at: parse_opt_ts(7, read_at)?,
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalConversation> {
    let id: String = row.get(0)?;
    let peer_id: String = row.get(1)?;
    let archived: bool = row.get(2)?;
    let sync_cursor: i64 = row.get(3)?;

    Ok(LocalConversation {
        id: ConversationId(id),
        peer_id: UserId(peer_id),
        archived,
        sync_cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewOutboxMessage, OutboxMessage};

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("history.db")).unwrap();
        (dir, db)
    }

    fn confirmed(id: &str, client_id: Option<&str>, ts: i64) -> ConfirmedMessage {
        ConfirmedMessage {
            id: MessageId(id.into()),
            client_id: client_id.map(|c| ClientId(c.into())),
            conversation_id: ConversationId("c_ab".into()),
            sender_id: UserId::new("alice"),
            receiver_id: UserId::new("bob"),
            content: format!("body of {id}"),
            server_timestamp: ts,
            read_at: None,
        }
    }

    #[test]
    fn upsert_is_idempotent_and_refreshes_read_at() {
        let (_dir, db) = open();
        let mut m = confirmed("m1", Some("c1"), 1000);

        assert!(db.upsert_confirmed(&m).unwrap());
        assert!(!db.upsert_confirmed(&m).unwrap());

        m.read_at = Some(Utc::now());
        assert!(!db.upsert_confirmed(&m).unwrap());

        let stored = db
            .messages_for_conversation(&ConversationId("c_ab".into()))
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].read_at.is_some());
    }

    #[test]
    fn history_is_ordered_by_server_timestamp() {
        let (_dir, db) = open();
        db.upsert_confirmed(&confirmed("m2", None, 2000)).unwrap();
        db.upsert_confirmed(&confirmed("m1", None, 1000)).unwrap();
        db.upsert_confirmed(&confirmed("m3", None, 3000)).unwrap();

        let ids: Vec<_> = db
            .messages_for_conversation(&ConversationId("c_ab".into()))
            .unwrap()
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let (_dir, db) = open();
        let id = ConversationId("c_ab".into());

        assert_eq!(db.sync_cursor(&id).unwrap(), 0);
        assert!(matches!(
            db.advance_sync_cursor(&id, 10),
            Err(StoreError::NotFound)
        ));

        db.upsert_conversation(&id, &UserId::new("bob"), false).unwrap();
        assert_eq!(db.advance_sync_cursor(&id, 1000).unwrap(), 1000);
        assert_eq!(db.advance_sync_cursor(&id, 500).unwrap(), 1000);

        // Re-learning the conversation keeps the cursor.
        db.upsert_conversation(&id, &UserId::new("bob"), true).unwrap();
        let conv = db.get_conversation(&id).unwrap();
        assert_eq!(conv.sync_cursor, 1000);
        assert!(conv.archived);

        // Seeing it again through a message changes nothing.
        assert!(!db.ensure_conversation(&id, &UserId::new("bob")).unwrap());
        assert!(db.get_conversation(&id).unwrap().archived);
    }

    #[test]
    fn read_receipt_only_touches_received_messages() {
        let (_dir, db) = open();
        let id = ConversationId("c_ab".into());
        db.upsert_confirmed(&confirmed("m1", None, 1000)).unwrap();
        let mut reply = confirmed("m2", None, 2000);
        reply.sender_id = UserId::new("bob");
        reply.receiver_id = UserId::new("alice");
        db.upsert_confirmed(&reply).unwrap();

        assert_eq!(db.apply_read_receipt(&id, &UserId::new("bob"), Utc::now()).unwrap(), 1);
        let history = db.messages_for_conversation(&id).unwrap();
        assert!(history[0].read_at.is_some());
        assert!(history[1].read_at.is_none());
    }

    #[test]
    fn view_replaces_pending_bubble_with_confirmed() {
        let (_dir, db) = open();
        let id = ConversationId("c_ab".into());
        db.upsert_conversation(&id, &UserId::new("bob"), false).unwrap();

        let pending = OutboxMessage::new(
            NewOutboxMessage {
                conversation_id: None,
                sender_id: UserId::new("alice"),
                receiver_id: UserId::new("bob"),
                content: "hi".into(),
            },
            Utc::now(),
        );
        db.enqueue_outbox(&pending).unwrap();

        let view = db.conversation_view(&id).unwrap();
        assert_eq!(view.len(), 1);
        assert!(matches!(view[0], ViewEntry::Pending(_)));

        let mut m = confirmed("m100", Some(pending.client_id.as_str()), 1000);
        m.content = "hi".into();
        db.upsert_confirmed(&m).unwrap();

        let view = db.conversation_view(&id).unwrap();
        assert_eq!(view.len(), 1);
        assert!(matches!(view[0], ViewEntry::Confirmed(_)));
        assert_eq!(view[0].content(), "hi");
        assert_eq!(view[0].client_id(), Some(&pending.client_id));
    }
}
