//! Durable outbox service.
//!
//! Thin policy layer over the store's outbox table: owns the retry budget and
//! the clock, and hands a message back even when it could not be written.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use courier_shared::{ClientId, ConfirmedMessage};
use courier_store::{
    NewOutboxMessage, OutboxMessage, OutboxStatus, Result as StoreResult, StoreError,
};

use crate::error::EnqueueError;
use crate::store::LocalStore;

#[derive(Clone)]
pub struct Outbox {
    store: LocalStore,
    max_retries: u32,
}

impl Outbox {
    pub fn new(store: LocalStore, max_retries: u32) -> Self {
        Self {
            store,
            max_retries: max_retries.max(1),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Persist a new message before anything touches the network.
    pub fn enqueue(&self, message: NewOutboxMessage) -> Result<OutboxMessage, EnqueueError> {
        let mut entry = OutboxMessage::new(message, Utc::now());
        match self.store.with(|db| db.enqueue_outbox(&entry)) {
            Ok(()) => {
                debug!(client_id = %entry.client_id, "Outbox entry queued");
                Ok(entry)
            }
            Err(source) => {
                warn!(client_id = %entry.client_id, error = %source, "Outbox write failed");
                entry.status = OutboxStatus::Failed;
                Err(EnqueueError {
                    message: entry,
                    source,
                })
            }
        }
    }

    pub fn get(&self, client_id: &ClientId) -> StoreResult<OutboxMessage> {
        self.store.with(|db| db.get_outbox(client_id))
    }

    pub fn begin_attempt(&self, client_id: &ClientId) -> StoreResult<()> {
        self.store
            .with(|db| db.mark_outbox_sending(client_id, Utc::now()))
    }

    /// Apply a relay confirmation. Returns `true` if this moved one of our
    /// entries to `sent`; already-sent entries and messages that never went
    /// through this outbox give `false`.
    pub fn confirm(&self, confirmed: &ConfirmedMessage) -> StoreResult<bool> {
        let Some(client_id) = confirmed.client_id.as_ref() else {
            return Ok(false);
        };
        self.store.with(|db| -> StoreResult<bool> {
            match db.get_outbox(client_id) {
                Ok(entry) if entry.status != OutboxStatus::Sent => {
                    db.mark_outbox_sent(
                        client_id,
                        &confirmed.id,
                        &confirmed.conversation_id,
                        Utc::now(),
                    )?;
                    Ok(true)
                }
                Ok(_) | Err(StoreError::NotFound) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    /// Consume one retry. Returns the resulting status.
    pub fn mark_attempt_failed(&self, client_id: &ClientId) -> StoreResult<OutboxStatus> {
        self.store.with(|db| {
            db.mark_outbox_attempt_failed(client_id, self.max_retries, Utc::now())
        })
    }

    pub fn mark_rejected(&self, client_id: &ClientId) -> StoreResult<()> {
        self.store
            .with(|db| db.mark_outbox_rejected(client_id, Utc::now()))
    }

    /// Put an attempt back without charging it.
    pub fn release(&self, client_id: &ClientId) -> StoreResult<()> {
        self.store.with(|db| db.release_outbox(client_id))
    }

    pub fn recover_in_flight(&self) -> StoreResult<usize> {
        self.store.with(|db| db.recover_outbox_in_flight())
    }

    pub fn list_pending(&self) -> StoreResult<Vec<OutboxMessage>> {
        self.store.with(|db| db.list_pending_outbox())
    }

    pub fn list_failed(&self) -> StoreResult<Vec<OutboxMessage>> {
        self.store.with(|db| db.list_failed_outbox())
    }

    pub fn list_all(&self) -> StoreResult<Vec<OutboxMessage>> {
        self.store.with(|db| db.list_outbox())
    }

    pub fn retry_failed(&self) -> StoreResult<usize> {
        self.store.with(|db| db.retry_failed_outbox())
    }

    pub fn clear_failed(&self) -> StoreResult<usize> {
        self.store.with(|db| db.clear_failed_outbox())
    }

    /// Drop confirmed entries older than `grace` that history already holds.
    pub fn purge_sent(&self, grace: Duration) -> StoreResult<usize> {
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::zero());
        let cutoff = Utc::now() - grace;
        self.store.with(|db| db.purge_sent_outbox(cutoff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::{ConversationId, MessageId, UserId};
    use courier_store::Database;

    fn outbox(max_retries: u32) -> (Outbox, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("client.db")).unwrap();
        (Outbox::new(LocalStore::new(db), max_retries), dir)
    }

    fn draft(content: &str) -> NewOutboxMessage {
        NewOutboxMessage {
            conversation_id: None,
            sender_id: UserId::new("alice"),
            receiver_id: UserId::new("bob"),
            content: content.into(),
        }
    }

    fn confirmation(entry: &OutboxMessage) -> ConfirmedMessage {
        ConfirmedMessage {
            id: MessageId("m1".into()),
            client_id: Some(entry.client_id.clone()),
            conversation_id: ConversationId("c_1".into()),
            sender_id: entry.sender_id.clone(),
            receiver_id: entry.receiver_id.clone(),
            content: entry.content.clone(),
            server_timestamp: 1_000,
            read_at: None,
        }
    }

    #[test]
    fn test_enqueue_is_pending_and_listed() {
        let (outbox, _dir) = outbox(3);
        let entry = outbox.enqueue(draft("hello")).unwrap();

        assert_eq!(entry.status, OutboxStatus::Pending);
        let pending = outbox.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].client_id, entry.client_id);
    }

    #[test]
    fn test_retry_budget_is_enforced() {
        let (outbox, _dir) = outbox(2);
        let entry = outbox.enqueue(draft("hello")).unwrap();

        outbox.begin_attempt(&entry.client_id).unwrap();
        assert_eq!(
            outbox.mark_attempt_failed(&entry.client_id).unwrap(),
            OutboxStatus::Pending
        );
        outbox.begin_attempt(&entry.client_id).unwrap();
        assert_eq!(
            outbox.mark_attempt_failed(&entry.client_id).unwrap(),
            OutboxStatus::Failed
        );

        assert!(outbox.list_pending().unwrap().is_empty());
        assert_eq!(outbox.list_failed().unwrap().len(), 1);
        assert_eq!(outbox.retry_failed().unwrap(), 1);
        assert_eq!(outbox.get(&entry.client_id).unwrap().retry_count, 0);
    }

    #[test]
    fn test_release_keeps_retry_budget() {
        let (outbox, _dir) = outbox(1);
        let entry = outbox.enqueue(draft("hello")).unwrap();

        outbox.begin_attempt(&entry.client_id).unwrap();
        outbox.release(&entry.client_id).unwrap();

        let stored = outbox.get(&entry.client_id).unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.retry_count, 0);
    }

    #[test]
    fn test_confirm_is_idempotent() {
        let (outbox, _dir) = outbox(3);
        let entry = outbox.enqueue(draft("hello")).unwrap();
        let confirmed = confirmation(&entry);

        outbox.begin_attempt(&entry.client_id).unwrap();
        assert!(outbox.confirm(&confirmed).unwrap());
        assert!(!outbox.confirm(&confirmed).unwrap());

        let stored = outbox.get(&entry.client_id).unwrap();
        assert_eq!(stored.status, OutboxStatus::Sent);
        assert_eq!(stored.confirmed_id, Some(MessageId("m1".into())));
        assert_eq!(stored.conversation_id, Some(ConversationId("c_1".into())));
    }

    #[test]
    fn test_confirm_ignores_foreign_messages() {
        let (outbox, _dir) = outbox(3);
        let entry = outbox.enqueue(draft("hello")).unwrap();
        let mut foreign = confirmation(&entry);
        foreign.client_id = Some(ClientId("from-another-device".into()));
        assert!(!outbox.confirm(&foreign).unwrap());

        foreign.client_id = None;
        assert!(!outbox.confirm(&foreign).unwrap());
        assert_eq!(outbox.list_pending().unwrap().len(), 1);
    }

    #[test]
    fn test_purge_waits_for_history() {
        let (outbox, _dir) = outbox(3);
        let entry = outbox.enqueue(draft("hello")).unwrap();
        let confirmed = confirmation(&entry);
        assert!(outbox.confirm(&confirmed).unwrap());

        // Not in history yet, so nothing goes even with no grace.
        assert_eq!(outbox.purge_sent(Duration::ZERO).unwrap(), 0);

        outbox
            .store
            .with(|db| db.upsert_confirmed(&confirmed))
            .unwrap();
        assert_eq!(outbox.purge_sent(Duration::from_secs(600)).unwrap(), 0);
        assert_eq!(outbox.purge_sent(Duration::ZERO).unwrap(), 1);
        assert!(outbox.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_clear_failed_only_touches_failed() {
        let (outbox, _dir) = outbox(3);
        let doomed = outbox.enqueue(draft("one")).unwrap();
        outbox.enqueue(draft("two")).unwrap();

        outbox.begin_attempt(&doomed.client_id).unwrap();
        outbox.mark_rejected(&doomed.client_id).unwrap();

        assert_eq!(outbox.clear_failed().unwrap(), 1);
        let left = outbox.list_all().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].content, "two");
    }
}
