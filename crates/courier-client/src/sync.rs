//! Sync engine.
//!
//! A pass drains the outbox through the relay link, then fetches every known
//! conversation past its cursor and reconciles what comes back. Passes never
//! overlap: a pass requested while one runs is dropped, since the running
//! pass picks up the same work.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use courier_shared::{ConfirmedMessage, UserId};
use courier_store::{LocalConversation, OutboxMessage, OutboxStatus, StoreError};

use crate::config::ClientConfig;
use crate::error::{ClientError, LinkError};
use crate::events::{ClientEvent, EventBus};
use crate::link::RelayLink;
use crate::outbox::Outbox;
use crate::store::LocalStore;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Pause between two deliveries in one pass.
    pub send_delay: Duration,
    pub page_size: usize,
    pub sent_grace: Duration,
}

impl From<&ClientConfig> for SyncSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            send_delay: config.send_delay,
            page_size: config.page_size.max(1),
            sent_grace: config.sent_grace,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Outbox entries the relay acknowledged.
    pub delivered: usize,
    /// Failed attempts sent back to `pending`.
    pub retried: usize,
    /// Entries that ended `failed` in this pass.
    pub failed: usize,
    /// Entries put back untouched because the link went away.
    pub deferred: usize,
    /// Confirmed messages received by missed-message fetches.
    pub fetched: usize,
    pub conversations: usize,
    pub fetch_errors: usize,
    pub purged: usize,
}

/// What reconciling one confirmed message did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Settled one of our outbox entries in place.
    Confirmed,
    /// A message not seen before.
    New,
    /// Already in history.
    Known,
}

pub struct SyncEngine {
    store: LocalStore,
    outbox: Outbox,
    link: Arc<dyn RelayLink>,
    events: EventBus<ClientEvent>,
    user_id: UserId,
    settings: SyncSettings,
    running: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        outbox: Outbox,
        link: Arc<dyn RelayLink>,
        events: EventBus<ClientEvent>,
        user_id: UserId,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            outbox,
            link,
            events,
            user_id,
            settings,
            running: Mutex::new(()),
        }
    }

    /// Run one pass. `None` when another pass is in flight or the link is
    /// down.
    pub async fn run_pass(&self) -> Result<Option<SyncReport>, ClientError> {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("Sync pass already running, coalesced");
            return Ok(None);
        };
        if !self.link.is_ready() {
            debug!("Sync pass skipped, relay link not ready");
            return Ok(None);
        }

        let mut report = SyncReport::default();
        self.drain_outbox(&mut report).await?;
        self.fetch_missed(&mut report).await?;
        report.purged = self.outbox.purge_sent(self.settings.sent_grace)?;

        info!(
            delivered = report.delivered,
            retried = report.retried,
            failed = report.failed,
            fetched = report.fetched,
            fetch_errors = report.fetch_errors,
            "Sync pass complete"
        );
        self.events.publish(ClientEvent::SyncCompleted {
            report: report.clone(),
        });
        Ok(Some(report))
    }

    // -----------------------------------------------------------------------
    // Outbox drain
    // -----------------------------------------------------------------------

    async fn drain_outbox(&self, report: &mut SyncReport) -> Result<(), ClientError> {
        let pending = self.outbox.list_pending()?;
        // Receivers whose earlier message is still undelivered; later ones
        // wait so they cannot overtake it.
        let mut held: HashSet<UserId> = HashSet::new();
        let mut attempted = false;

        for entry in pending {
            if held.contains(&entry.receiver_id) {
                continue;
            }
            if !self.link.is_ready() {
                break;
            }
            if attempted && !self.settings.send_delay.is_zero() {
                tokio::time::sleep(self.settings.send_delay).await;
            }

            match self.outbox.begin_attempt(&entry.client_id) {
                Ok(()) => {}
                // Settled by a live ack since it was listed.
                Err(StoreError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
            attempted = true;

            match self.link.deliver(&entry).await {
                Ok(delivery) => {
                    if delivery.duplicate {
                        debug!(client_id = %entry.client_id, "Relay already had this message");
                    }
                    self.reconcile(&delivery.message)?;
                    report.delivered += 1;
                }
                Err(e) if e.is_session_lost() => {
                    debug!(client_id = %entry.client_id, error = %e, "Link lost mid-drain");
                    settle(self.outbox.release(&entry.client_id))?;
                    report.deferred += 1;
                    break;
                }
                Err(e) if e.is_transient() => {
                    held.insert(entry.receiver_id.clone());
                    self.attempt_failed(&entry, &e, report)?;
                }
                Err(e) => {
                    warn!(client_id = %entry.client_id, error = %e, "Relay refused message");
                    if settle(self.outbox.mark_rejected(&entry.client_id))? {
                        report.failed += 1;
                        self.events.publish(ClientEvent::DeliveryFailed {
                            client_id: entry.client_id.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn attempt_failed(
        &self,
        entry: &OutboxMessage,
        error: &LinkError,
        report: &mut SyncReport,
    ) -> Result<(), ClientError> {
        let status = match self.outbox.mark_attempt_failed(&entry.client_id) {
            Ok(status) => status,
            Err(StoreError::InvalidTransition { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if status == OutboxStatus::Failed {
            warn!(client_id = %entry.client_id, error = %error, "Delivery retries exhausted");
            report.failed += 1;
            self.events.publish(ClientEvent::DeliveryFailed {
                client_id: entry.client_id.clone(),
                reason: error.to_string(),
            });
        } else {
            debug!(client_id = %entry.client_id, error = %error, "Delivery attempt failed");
            report.retried += 1;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Missed-message fetch
    // -----------------------------------------------------------------------

    async fn fetch_missed(&self, report: &mut SyncReport) -> Result<(), ClientError> {
        match self.link.list_conversations().await {
            Ok(remote) => self.store.with(|db| -> courier_store::Result<()> {
                for summary in &remote {
                    db.upsert_conversation(
                        &summary.conversation_id,
                        &summary.peer_id,
                        summary.archived,
                    )?;
                }
                Ok(())
            })?,
            Err(e) => {
                warn!(error = %e, "Conversation list unavailable, using local list");
                report.fetch_errors += 1;
            }
        }

        let conversations = self.store.with(|db| db.list_conversations())?;
        report.conversations = conversations.len();

        for conversation in &conversations {
            match self.fetch_conversation(conversation, report).await {
                Ok(()) => {}
                Err(ClientError::Link(e)) => {
                    warn!(conversation = %conversation.id, error = %e, "Fetch failed, retrying next pass");
                    report.fetch_errors += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn fetch_conversation(
        &self,
        conversation: &LocalConversation,
        report: &mut SyncReport,
    ) -> Result<(), ClientError> {
        let page_size = self.settings.page_size;
        let mut cursor = self.store.with(|db| db.sync_cursor(&conversation.id))?;

        loop {
            let page = self
                .link
                .fetch_since(&conversation.id, cursor, page_size)
                .await?;
            let full = page.len() >= page_size;

            let mut newest = cursor;
            for message in &page {
                self.reconcile(message)?;
                newest = newest.max(message.server_timestamp);
            }
            report.fetched += page.len();

            if newest <= cursor {
                break;
            }
            cursor = self
                .store
                .with(|db| db.advance_sync_cursor(&conversation.id, newest))?;
            if !full {
                break;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Merge one relay-confirmed message into local state. If it answers one
    /// of our outbox entries the entry is settled in place and `Confirmed` is
    /// emitted; otherwise a first sighting emits `Received`.
    pub fn reconcile(&self, message: &ConfirmedMessage) -> Result<Reconciliation, ClientError> {
        let peer = if message.sender_id == self.user_id {
            &message.receiver_id
        } else {
            &message.sender_id
        };

        let inserted = self.store.with(|db| -> courier_store::Result<bool> {
            let inserted = db.upsert_confirmed(message)?;
            db.ensure_conversation(&message.conversation_id, peer)?;
            Ok(inserted)
        })?;

        if message.sender_id == self.user_id && self.outbox.confirm(message)? {
            if let Some(client_id) = &message.client_id {
                debug!(%client_id, message_id = %message.id, "Outbox entry confirmed");
                self.events.publish(ClientEvent::Confirmed {
                    client_id: client_id.clone(),
                    message: message.clone(),
                });
            }
            return Ok(Reconciliation::Confirmed);
        }

        if inserted {
            self.events.publish(ClientEvent::Received {
                message: message.clone(),
            });
            return Ok(Reconciliation::New);
        }
        Ok(Reconciliation::Known)
    }
}

/// `Ok(false)` when the entry had already moved on, e.g. settled by a late
/// ack while its attempt was in flight.
fn settle(result: courier_store::Result<()>) -> Result<bool, ClientError> {
    match result {
        Ok(()) => Ok(true),
        Err(StoreError::InvalidTransition { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use courier_shared::{ClientId, ConversationId, ConversationSummary, ErrorCode, MessageId};
    use courier_store::{Database, NewOutboxMessage, ViewEntry};

    use crate::link::Delivery;

    #[derive(Default)]
    struct FakeRelay {
        messages: Vec<ConfirmedMessage>,
        conversations: HashMap<UserId, ConversationId>,
        /// Outcomes for the next deliveries, in order.
        deliver_failures: VecDeque<LinkError>,
        /// Persist the next delivery but lose the response.
        lose_next_response: bool,
        broken: HashSet<ConversationId>,
        clock: i64,
    }

    struct FakeLink {
        me: UserId,
        ready: AtomicBool,
        relay: std::sync::Mutex<FakeRelay>,
    }

    impl FakeLink {
        fn new(me: &str) -> Arc<Self> {
            Arc::new(Self {
                me: UserId::new(me),
                ready: AtomicBool::new(true),
                relay: std::sync::Mutex::new(FakeRelay::default()),
            })
        }

        fn relay(&self) -> std::sync::MutexGuard<'_, FakeRelay> {
            self.relay.lock().unwrap()
        }

        /// A message some peer sent us while we were away.
        fn incoming(&self, from: &str, content: &str) -> ConfirmedMessage {
            let mut relay = self.relay();
            let peer = UserId::new(from);
            let conversation_id = conversation_for(&mut relay, &peer);
            relay.clock += 1_000;
            let message = ConfirmedMessage {
                id: MessageId::generate(),
                client_id: Some(ClientId::generate()),
                conversation_id,
                sender_id: peer,
                receiver_id: self.me.clone(),
                content: content.into(),
                server_timestamp: relay.clock,
                read_at: None,
            };
            relay.messages.push(message.clone());
            message
        }
    }

    fn conversation_for(relay: &mut FakeRelay, peer: &UserId) -> ConversationId {
        relay
            .conversations
            .entry(peer.clone())
            .or_insert_with(|| ConversationId(format!("c_{}", peer.as_str())))
            .clone()
    }

    #[async_trait]
    impl RelayLink for FakeLink {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn deliver(&self, message: &OutboxMessage) -> Result<Delivery, LinkError> {
            let mut relay = self.relay();
            if let Some(e) = relay.deliver_failures.pop_front() {
                return Err(e);
            }

            if let Some(existing) = relay
                .messages
                .iter()
                .find(|m| m.client_id.as_ref() == Some(&message.client_id))
            {
                return Ok(Delivery {
                    message: existing.clone(),
                    duplicate: true,
                });
            }

            let conversation_id = conversation_for(&mut relay, &message.receiver_id);
            relay.clock += 1_000;
            let confirmed = ConfirmedMessage {
                id: MessageId::generate(),
                client_id: Some(message.client_id.clone()),
                conversation_id,
                sender_id: message.sender_id.clone(),
                receiver_id: message.receiver_id.clone(),
                content: message.content.clone(),
                server_timestamp: relay.clock,
                read_at: None,
            };
            relay.messages.push(confirmed.clone());

            if relay.lose_next_response {
                relay.lose_next_response = false;
                return Err(LinkError::Timeout);
            }
            Ok(Delivery {
                message: confirmed,
                duplicate: false,
            })
        }

        async fn fetch_since(
            &self,
            conversation_id: &ConversationId,
            after: i64,
            limit: usize,
        ) -> Result<Vec<ConfirmedMessage>, LinkError> {
            let relay = self.relay();
            if relay.broken.contains(conversation_id) {
                return Err(LinkError::Timeout);
            }
            Ok(relay
                .messages
                .iter()
                .filter(|m| &m.conversation_id == conversation_id && m.server_timestamp > after)
                .take(limit)
                .cloned()
                .collect())
        }

        async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, LinkError> {
            Ok(self
                .relay()
                .conversations
                .iter()
                .map(|(peer, id)| ConversationSummary {
                    conversation_id: id.clone(),
                    peer_id: peer.clone(),
                    archived: false,
                })
                .collect())
        }
    }

    struct Harness {
        engine: SyncEngine,
        link: Arc<FakeLink>,
        store: LocalStore,
        outbox: Outbox,
        events: EventBus<ClientEvent>,
        _dir: tempfile::TempDir,
    }

    fn harness(max_retries: u32, page_size: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(Database::open_at(&dir.path().join("client.db")).unwrap());
        let outbox = Outbox::new(store.clone(), max_retries);
        let link = FakeLink::new("alice");
        let events = EventBus::new(64);
        let engine = SyncEngine::new(
            store.clone(),
            outbox.clone(),
            link.clone(),
            events.clone(),
            UserId::new("alice"),
            SyncSettings {
                send_delay: Duration::ZERO,
                page_size,
                sent_grace: Duration::from_secs(300),
            },
        );
        Harness {
            engine,
            link,
            store,
            outbox,
            events,
            _dir: dir,
        }
    }

    fn to_bob(content: &str) -> NewOutboxMessage {
        NewOutboxMessage {
            conversation_id: None,
            sender_id: UserId::new("alice"),
            receiver_id: UserId::new("bob"),
            content: content.into(),
        }
    }

    fn bob_conversation() -> ConversationId {
        ConversationId("c_bob".into())
    }

    #[tokio::test]
    async fn test_offline_message_is_delivered_once() {
        let h = harness(5, 200);
        let entry = h.outbox.enqueue(to_bob("hi")).unwrap();

        let report = h.engine.run_pass().await.unwrap().unwrap();
        assert_eq!(report.delivered, 1);

        let stored = h.outbox.get(&entry.client_id).unwrap();
        assert_eq!(stored.status, OutboxStatus::Sent);
        assert!(h.outbox.list_pending().unwrap().is_empty());

        let view = h.store.with(|db| db.conversation_view(&bob_conversation())).unwrap();
        assert_eq!(view.len(), 1);
        assert!(matches!(&view[0], ViewEntry::Confirmed(m) if m.content == "hi"));

        // The fetch step saw the same message and moved the cursor onto it.
        let cursor = h.store.with(|db| db.sync_cursor(&bob_conversation())).unwrap();
        assert_eq!(cursor, 1_000);
    }

    #[tokio::test]
    async fn test_lost_response_is_reconciled_without_duplicate() {
        let h = harness(5, 200);
        let entry = h.outbox.enqueue(to_bob("hi")).unwrap();
        h.link.relay().lose_next_response = true;

        let first = h.engine.run_pass().await.unwrap().unwrap();
        assert_eq!(first.retried, 1);

        // The fetch step of the same pass already found the message.
        let stored = h.outbox.get(&entry.client_id).unwrap();
        assert_eq!(stored.status, OutboxStatus::Sent);

        h.engine.run_pass().await.unwrap().unwrap();
        let history = h
            .store
            .with(|db| db.messages_for_conversation(&bob_conversation()))
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(h.link.relay().messages.len(), 1);
        let view = h.store.with(|db| db.conversation_view(&bob_conversation())).unwrap();
        assert_eq!(view.len(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_marks_failed() {
        let h = harness(2, 200);
        let entry = h.outbox.enqueue(to_bob("hi")).unwrap();
        let mut events = h.events.subscribe();
        h.link
            .relay()
            .deliver_failures
            .extend([LinkError::Timeout, LinkError::Timeout]);

        let first = h.engine.run_pass().await.unwrap().unwrap();
        assert_eq!(first.retried, 1);
        let second = h.engine.run_pass().await.unwrap().unwrap();
        assert_eq!(second.failed, 1);

        assert_eq!(h.outbox.get(&entry.client_id).unwrap().status, OutboxStatus::Failed);

        let mut saw_failure = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), events.next()).await
        {
            if let ClientEvent::DeliveryFailed { client_id, .. } = event {
                assert_eq!(client_id, entry.client_id);
                saw_failure = true;
            }
        }
        assert!(saw_failure);

        // Failed entries wait for the user.
        let third = h.engine.run_pass().await.unwrap().unwrap();
        assert_eq!(third.delivered, 0);
        h.outbox.retry_failed().unwrap();
        let fourth = h.engine.run_pass().await.unwrap().unwrap();
        assert_eq!(fourth.delivered, 1);
    }

    #[tokio::test]
    async fn test_explicit_rejection_fails_immediately() {
        let h = harness(5, 200);
        let entry = h.outbox.enqueue(to_bob("hi")).unwrap();
        h.link.relay().deliver_failures.push_back(LinkError::Rejected {
            code: ErrorCode::Forbidden,
            message: "not a participant".into(),
        });

        let report = h.engine.run_pass().await.unwrap().unwrap();
        assert_eq!(report.failed, 1);
        let stored = h.outbox.get(&entry.client_id).unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn test_lost_link_defers_without_charging() {
        let h = harness(5, 200);
        let entry = h.outbox.enqueue(to_bob("one")).unwrap();
        h.outbox.enqueue(to_bob("two")).unwrap();
        h.link
            .relay()
            .deliver_failures
            .push_back(LinkError::NotConnected);

        let report = h.engine.run_pass().await.unwrap().unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.delivered, 0);

        let stored = h.outbox.get(&entry.client_id).unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(h.outbox.list_pending().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_expired_session_defers_like_lost_link() {
        let h = harness(5, 200);
        let entry = h.outbox.enqueue(to_bob("one")).unwrap();
        h.link.relay().deliver_failures.push_back(LinkError::Rejected {
            code: ErrorCode::NotAuthenticated,
            message: "Session expired, authenticate again".into(),
        });

        let report = h.engine.run_pass().await.unwrap().unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.failed, 0);
        let stored = h.outbox.get(&entry.client_id).unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_conversation_order() {
        let h = harness(5, 200);
        let first = h.outbox.enqueue(to_bob("first")).unwrap();
        let second = h.outbox.enqueue(to_bob("second")).unwrap();
        h.link.relay().deliver_failures.push_back(LinkError::Timeout);

        let report = h.engine.run_pass().await.unwrap().unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.delivered, 0);
        assert_eq!(h.outbox.get(&second.client_id).unwrap().retry_count, 0);

        h.engine.run_pass().await.unwrap().unwrap();
        let history = h
            .store
            .with(|db| db.messages_for_conversation(&bob_conversation()))
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].client_id.as_ref(), Some(&first.client_id));
        assert_eq!(history[1].client_id.as_ref(), Some(&second.client_id));
        assert!(history[0].server_timestamp <= history[1].server_timestamp);
    }

    #[tokio::test]
    async fn test_missed_messages_fetched_in_pages() {
        let h = harness(5, 2);
        for i in 0..5 {
            h.link.incoming("bob", &format!("msg {i}"));
        }
        let mut events = h.events.subscribe();

        let report = h.engine.run_pass().await.unwrap().unwrap();
        assert_eq!(report.fetched, 5);
        assert_eq!(report.conversations, 1);

        let history = h
            .store
            .with(|db| db.messages_for_conversation(&bob_conversation()))
            .unwrap();
        assert_eq!(history.len(), 5);
        let cursor = h.store.with(|db| db.sync_cursor(&bob_conversation())).unwrap();
        assert_eq!(cursor, 5_000);

        let mut received = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), events.next()).await
        {
            if matches!(event, ClientEvent::Received { .. }) {
                received += 1;
            }
        }
        assert_eq!(received, 5);

        // Nothing new: the next pass fetches nothing.
        let again = h.engine.run_pass().await.unwrap().unwrap();
        assert_eq!(again.fetched, 0);
    }

    #[tokio::test]
    async fn test_failed_conversation_does_not_block_others() {
        let h = harness(5, 200);
        h.link.incoming("bob", "from bob");
        h.link.incoming("carol", "from carol");
        h.link
            .relay()
            .broken
            .insert(ConversationId("c_bob".into()));

        let report = h.engine.run_pass().await.unwrap().unwrap();
        assert_eq!(report.fetch_errors, 1);
        assert_eq!(report.fetched, 1);

        let carol = ConversationId("c_carol".into());
        assert_eq!(h.store.with(|db| db.sync_cursor(&carol)).unwrap(), 2_000);
        assert_eq!(h.store.with(|db| db.sync_cursor(&bob_conversation())).unwrap(), 0);

        h.link.relay().broken.clear();
        h.engine.run_pass().await.unwrap().unwrap();
        assert_eq!(h.store.with(|db| db.sync_cursor(&bob_conversation())).unwrap(), 1_000);
    }

    #[tokio::test]
    async fn test_concurrent_pass_is_coalesced() {
        let h = harness(5, 200);
        h.outbox.enqueue(to_bob("hi")).unwrap();

        let guard = h.engine.running.try_lock().unwrap();
        assert!(h.engine.run_pass().await.unwrap().is_none());
        drop(guard);

        assert_eq!(h.link.relay().messages.len(), 0);
        assert!(h.engine.run_pass().await.unwrap().is_some());
        assert_eq!(h.link.relay().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_not_ready_link_skips_pass() {
        let h = harness(5, 200);
        h.outbox.enqueue(to_bob("hi")).unwrap();
        h.link.ready.store(false, Ordering::SeqCst);

        assert!(h.engine.run_pass().await.unwrap().is_none());
        assert_eq!(h.outbox.list_pending().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_outcomes() {
        let h = harness(5, 200);
        let entry = h.outbox.enqueue(to_bob("hi")).unwrap();
        let ours = ConfirmedMessage {
            id: MessageId("m100".into()),
            client_id: Some(entry.client_id.clone()),
            conversation_id: bob_conversation(),
            sender_id: UserId::new("alice"),
            receiver_id: UserId::new("bob"),
            content: "hi".into(),
            server_timestamp: 1_000,
            read_at: None,
        };

        assert_eq!(h.engine.reconcile(&ours).unwrap(), Reconciliation::Confirmed);
        assert_eq!(h.engine.reconcile(&ours).unwrap(), Reconciliation::Known);

        let conversation = h
            .store
            .with(|db| db.get_conversation(&bob_conversation()))
            .unwrap();
        assert_eq!(conversation.peer_id, UserId::new("bob"));

        let theirs = h.link.incoming("bob", "hello back");
        assert_eq!(h.engine.reconcile(&theirs).unwrap(), Reconciliation::New);
    }
}
