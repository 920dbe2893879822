//! The composed client runtime.
//!
//! [`Messenger::start`] opens the local store, returns interrupted deliveries
//! to the outbox, connects the transport and starts the background tasks:
//!
//! - heartbeat while authenticated
//! - sync driver: a pass on every (re)authentication, on the periodic timer,
//!   after a local send and when connectivity is reported back
//! - connection watcher: state changes out to subscribers, status re-sent
//!   after reconnect
//! - inbound pump: live messages, late acks, presence and read receipts

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use courier_shared::protocol::validate_content;
use courier_shared::{ConversationId, PresenceStatus, UserId};
use courier_store::{LocalConversation, NewOutboxMessage, OutboxMessage, ViewEntry};

use crate::config::ClientConfig;
use crate::error::{ClientError, LinkError};
use crate::events::{ClientEvent, EventBus, InboundEvent, Subscription};
use crate::outbox::Outbox;
use crate::presence::{spawn_heartbeat, PeerPresence, PresenceTracker};
use crate::store::LocalStore;
use crate::sync::{SyncEngine, SyncReport, SyncSettings};
use crate::transport::{ConnectionState, Transport};

pub struct Messenger {
    user_id: UserId,
    store: LocalStore,
    outbox: Outbox,
    transport: Transport,
    presence: Arc<PresenceTracker>,
    sync: Arc<SyncEngine>,
    events: EventBus<ClientEvent>,
    sync_trigger: Arc<Notify>,
    transport_task: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Messenger {
    pub async fn start(config: ClientConfig) -> Result<Self, ClientError> {
        if config.user_id.is_empty() {
            return Err(ClientError::InvalidInput("user id is required".into()));
        }

        let store = LocalStore::open(config.db_path.as_deref())?;
        let outbox = Outbox::new(store.clone(), config.max_retries);
        let recovered = outbox.recover_in_flight()?;
        if recovered > 0 {
            info!(recovered, "Returned interrupted deliveries to the outbox");
        }

        let events = EventBus::default();
        let (transport, transport_task) = Transport::spawn(&config);
        let inbound = transport.inbound();
        let presence = Arc::new(PresenceTracker::new());
        let sync = Arc::new(SyncEngine::new(
            store.clone(),
            outbox.clone(),
            Arc::new(transport.clone()),
            events.clone(),
            config.user_id.clone(),
            SyncSettings::from(&config),
        ));
        let sync_trigger = Arc::new(Notify::new());

        let tasks = vec![
            spawn_heartbeat(transport.clone(), config.heartbeat_interval),
            tokio::spawn(drive_sync(
                sync.clone(),
                transport.clone(),
                sync_trigger.clone(),
                config.sync_interval,
            )),
            tokio::spawn(watch_connection(
                transport.clone(),
                presence.clone(),
                events.clone(),
            )),
            tokio::spawn(pump_inbound(
                inbound,
                sync.clone(),
                presence.clone(),
                store.clone(),
                events.clone(),
            )),
        ];

        info!(user = %config.user_id, relay = %config.relay_url, "Messenger started");

        Ok(Self {
            user_id: config.user_id,
            store,
            outbox,
            transport,
            presence,
            sync,
            events,
            sync_trigger,
            transport_task: Mutex::new(Some(transport_task)),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Queue a message for `receiver_id` and return its optimistic entry.
    /// Delivery happens in the background.
    pub fn send_message(
        &self,
        receiver_id: &UserId,
        content: &str,
    ) -> Result<OutboxMessage, ClientError> {
        validate_content(content)?;
        if receiver_id.is_empty() || receiver_id == &self.user_id {
            return Err(ClientError::InvalidInput(format!(
                "cannot send to {receiver_id:?}"
            )));
        }

        let conversation_id = self
            .store
            .with(|db| db.find_conversation_with(receiver_id))?
            .map(|c| c.id);

        let draft = NewOutboxMessage {
            conversation_id,
            sender_id: self.user_id.clone(),
            receiver_id: receiver_id.clone(),
            content: content.to_string(),
        };

        match self.outbox.enqueue(draft) {
            Ok(entry) => {
                self.events.publish(ClientEvent::Queued {
                    message: entry.clone(),
                });
                self.sync_trigger.notify_one();
                Ok(entry)
            }
            Err(e) => {
                self.events.publish(ClientEvent::DeliveryFailed {
                    client_id: e.message.client_id.clone(),
                    reason: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Confirmed history followed by optimistic bubbles.
    pub fn conversation_view(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ViewEntry>, ClientError> {
        Ok(self
            .store
            .with(|db| db.conversation_view(conversation_id))?)
    }

    pub fn conversations(&self) -> Result<Vec<LocalConversation>, ClientError> {
        Ok(self.store.with(|db| db.list_conversations())?)
    }

    pub fn conversation_with(&self, peer_id: &UserId) -> Result<Option<LocalConversation>, ClientError> {
        Ok(self.store.with(|db| db.find_conversation_with(peer_id))?)
    }

    /// Look up or allocate the conversation with `peer_id` on the relay.
    pub async fn open_conversation(&self, peer_id: &UserId) -> Result<LocalConversation, ClientError> {
        if let Some(known) = self.conversation_with(peer_id)? {
            return Ok(known);
        }

        let summary = self.transport.open_conversation(peer_id).await?;
        let conversation = self.store.with(|db| -> courier_store::Result<LocalConversation> {
            db.upsert_conversation(&summary.conversation_id, &summary.peer_id, summary.archived)?;
            db.get_conversation(&summary.conversation_id)
        })?;
        Ok(conversation)
    }

    pub fn outbox(&self) -> Result<Vec<OutboxMessage>, ClientError> {
        Ok(self.outbox.list_all()?)
    }

    /// Give every failed entry a fresh retry budget and kick a pass.
    pub fn retry_failed(&self) -> Result<usize, ClientError> {
        let count = self.outbox.retry_failed()?;
        if count > 0 {
            info!(count, "Retrying failed messages");
            self.sync_trigger.notify_one();
        }
        Ok(count)
    }

    pub fn clear_failed(&self) -> Result<usize, ClientError> {
        Ok(self.outbox.clear_failed()?)
    }

    /// Mark what we received in a conversation as read, locally and on the
    /// relay when connected.
    pub fn mark_read(&self, conversation_id: &ConversationId) -> Result<usize, ClientError> {
        let updated = self
            .store
            .with(|db| db.apply_read_receipt(conversation_id, &self.user_id, Utc::now()))?;
        if let Err(e) = self.transport.mark_read(conversation_id) {
            debug!(conversation = %conversation_id, error = %e, "Read receipt not sent");
        }
        Ok(updated)
    }

    pub fn set_archived(
        &self,
        conversation_id: &ConversationId,
        archived: bool,
    ) -> Result<(), ClientError> {
        self.store
            .with(|db| db.set_conversation_archived(conversation_id, archived))?;
        if let Err(e) = self.transport.set_archived(conversation_id, archived) {
            debug!(conversation = %conversation_id, error = %e, "Archive flag not sent");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    /// Displayed status override. Kept locally and re-sent after reconnect.
    pub async fn set_status(&self, status: PresenceStatus) {
        self.presence.set_user_status(status).await;
        match self.transport.set_status(status) {
            Ok(()) => {}
            Err(LinkError::NotConnected) => debug!(?status, "Status queued until reconnect"),
            Err(e) => warn!(error = %e, "Failed to send status"),
        }
    }

    pub async fn presence_of(&self, user_id: &UserId) -> PeerPresence {
        self.presence.get(user_id).await
    }

    // -----------------------------------------------------------------------
    // Connection and sync control
    // -----------------------------------------------------------------------

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn subscribe(&self) -> Subscription<ClientEvent> {
        self.events.subscribe()
    }

    /// The platform reports the network is back: leave any parked transport
    /// state and sync.
    pub fn notify_connectivity_restored(&self) {
        info!("Connectivity restored");
        self.transport.reconnect();
        self.sync_trigger.notify_one();
    }

    /// Run a pass now. `None` if one is already running or the relay is
    /// unreachable.
    pub async fn sync_now(&self) -> Result<Option<SyncReport>, ClientError> {
        self.sync.run_pass().await
    }

    pub async fn shutdown(&self) {
        self.transport.shutdown();

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }

        let transport_task = lock(&self.transport_task).take();
        if let Some(task) = transport_task {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Transport did not stop in time");
            }
        }
        info!(user = %self.user_id, "Messenger stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn drive_sync(
    sync: Arc<SyncEngine>,
    transport: Transport,
    trigger: Arc<Notify>,
    interval: Duration,
) {
    let mut state = transport.watch_state();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = trigger.notified() => {}
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                if !state.borrow_and_update().is_authenticated() {
                    continue;
                }
            }
        }

        if !transport.is_authenticated() {
            continue;
        }
        if let Err(e) = sync.run_pass().await {
            warn!(error = %e, "Sync pass failed");
        }
    }
}

async fn watch_connection(
    transport: Transport,
    presence: Arc<PresenceTracker>,
    events: EventBus<ClientEvent>,
) {
    let mut state = transport.watch_state();
    loop {
        let current = state.borrow_and_update().clone();
        if current.is_authenticated() {
            let status = presence.user_status().await;
            if status != PresenceStatus::Online {
                if let Err(e) = transport.set_status(status) {
                    debug!(error = %e, "Status not restored");
                }
            }
        }
        events.publish(ClientEvent::ConnectionChanged { state: current });

        if state.changed().await.is_err() {
            break;
        }
    }
}

async fn pump_inbound(
    mut inbound: Subscription<InboundEvent>,
    sync: Arc<SyncEngine>,
    presence: Arc<PresenceTracker>,
    store: LocalStore,
    events: EventBus<ClientEvent>,
) {
    while let Some(event) = inbound.next().await {
        match event {
            InboundEvent::Message(message) | InboundEvent::Ack(message) => {
                if let Err(e) = sync.reconcile(&message) {
                    warn!(message_id = %message.id, error = %e, "Failed to reconcile pushed message");
                }
            }
            InboundEvent::Presence(event) => {
                if let Some(changed) = presence.apply(&event).await {
                    events.publish(ClientEvent::PresenceChanged { presence: changed });
                }
            }
            InboundEvent::Read {
                conversation_id,
                reader_id,
                read_at,
            } => {
                match store.with(|db| db.apply_read_receipt(&conversation_id, &reader_id, read_at)) {
                    Ok(updated) => debug!(conversation = %conversation_id, updated, "Read receipt applied"),
                    Err(e) => warn!(error = %e, "Failed to apply read receipt"),
                }
                events.publish(ClientEvent::ReadReceipt {
                    conversation_id,
                    reader_id,
                    read_at,
                });
            }
            InboundEvent::Error { code, message } => {
                debug!(?code, %message, "Unsolicited relay error");
            }
        }
    }
}
