//! The relay hub: authoritative message persistence and fan-out.
//!
//! Every operation takes the caller's [`SessionHandle`]; the websocket layer
//! checks the handle is still current before dispatching, so a superseded
//! connection never acts on behalf of its user.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use courier_shared::constants::MAX_FETCH_LIMIT;
use courier_shared::protocol::validate_content;
use courier_shared::{
    ClientId, ConfirmedMessage, ConversationId, ConversationSummary, PresenceEvent,
    PresenceStatus, ServerFrame, UserId,
};

use crate::config::ServerConfig;
use crate::conversations::ConversationDirectory;
use crate::error::{Result, ServerError};
use crate::kv::{KvStore, MemoryKv, SqliteKv};
use crate::message_store::{AppendOutcome, MessageStore, NewMessage, SqliteMessageStore};
use crate::presence::PresenceTable;
use crate::profile::{ProfileSink, TracingProfileSink};
use crate::rate_limit::RateLimiter;
use crate::sessions::{SessionHandle, SessionSender, SessionTable};

/// Tunables the hub needs from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub presence_timeout: Duration,
    pub max_sessions: usize,
    pub send_rate_per_sec: f64,
    pub send_burst: f64,
}

impl From<&ServerConfig> for HubSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            presence_timeout: config.presence_timeout(),
            max_sessions: config.max_sessions,
            send_rate_per_sec: config.send_rate_per_sec,
            send_burst: config.send_burst,
        }
    }
}

/// A `send` as received from a client.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub conversation_id: Option<ConversationId>,
    pub receiver_id: UserId,
    pub content: String,
    pub client_id: ClientId,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStatus {
    pub active_sessions: usize,
    pub online_users: usize,
    pub stored_messages: u64,
}

pub struct RelayHub {
    sessions: SessionTable,
    conversations: ConversationDirectory,
    messages: Arc<dyn MessageStore>,
    presence: PresenceTable,
    profiles: Arc<dyn ProfileSink>,
    send_limiter: RateLimiter<UserId>,
    max_sessions: usize,
}

impl RelayHub {
    pub fn new(
        settings: HubSettings,
        session_kv: Arc<dyn KvStore>,
        directory_kv: Arc<dyn KvStore>,
        messages: Arc<dyn MessageStore>,
        profiles: Arc<dyn ProfileSink>,
    ) -> Self {
        Self {
            sessions: SessionTable::new(session_kv),
            conversations: ConversationDirectory::new(directory_kv),
            messages,
            presence: PresenceTable::new(settings.presence_timeout),
            profiles,
            send_limiter: RateLimiter::new(settings.send_rate_per_sec, settings.send_burst),
            max_sessions: settings.max_sessions,
        }
    }

    /// Single-instance relay: sessions in process, directory and messages in
    /// the SQLite file at `config.db_path`.
    pub fn open(config: &ServerConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ServerError::Storage(format!("create data dir: {e}")))?;
            }
        }

        info!(path = %config.db_path.display(), "Opening relay database");

        Ok(Self::new(
            HubSettings::from(config),
            Arc::new(MemoryKv::new()),
            Arc::new(SqliteKv::open(&config.db_path)?),
            Arc::new(SqliteMessageStore::open(&config.db_path)?),
            Arc::new(TracingProfileSink),
        ))
    }

    /// Fully in-memory relay.
    pub fn in_memory(settings: HubSettings) -> Result<Self> {
        Ok(Self::new(
            settings,
            Arc::new(MemoryKv::new()),
            Arc::new(SqliteKv::open_in_memory()?),
            Arc::new(SqliteMessageStore::open_in_memory()?),
            Arc::new(TracingProfileSink),
        ))
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Register a session for `user_id` and answer on `sender` with the
    /// acknowledgment followed by a presence snapshot of the user's peers.
    pub async fn authenticate(
        &self,
        user_id: &UserId,
        display_name: &str,
        sender: SessionSender,
    ) -> Result<SessionHandle> {
        if user_id.is_empty() {
            return Err(ServerError::AuthRejected("empty user id".into()));
        }

        if self.max_sessions > 0
            && self.sessions.active_count().await >= self.max_sessions
            && !self.sessions.is_connected(user_id).await?
        {
            warn!(user = %user_id, max = self.max_sessions, "Session limit reached");
            return Err(ServerError::AuthRejected("relay is full".into()));
        }

        let (handle, previous) = self
            .sessions
            .register(user_id, display_name, sender.clone())
            .await?;

        info!(
            user = %user_id,
            session = %handle.session_id,
            superseded = previous.is_some(),
            "Session authenticated"
        );

        if sender
            .try_send(ServerFrame::AuthAck {
                user_id: user_id.clone(),
                session_id: handle.session_id.clone(),
            })
            .is_err()
        {
            debug!(user = %user_id, "Auth ack dropped, session backlog full or closed");
        }

        for peer in self.conversations.peers_of(user_id).await? {
            if let Some(record) = self.presence.get(&peer).await {
                if sender
                    .try_send(ServerFrame::Presence(record.to_event()))
                    .is_err()
                {
                    debug!(user = %user_id, peer = %peer, "Presence snapshot dropped");
                }
            }
        }

        self.touch(user_id).await?;
        Ok(handle)
    }

    /// Stale-session self check, run before every frame from an
    /// authenticated connection. Counts as activity.
    ///
    /// A newer login gives `SessionSuperseded`; a session removed by the
    /// presence sweeper gives `SessionExpired`.
    pub async fn ensure_current(&self, handle: &SessionHandle) -> Result<()> {
        match self.sessions.current(&handle.user_id).await? {
            Some(record) if record.session_id == handle.session_id => {}
            Some(_) => return Err(ServerError::SessionSuperseded),
            None => return Err(ServerError::SessionExpired),
        }
        self.touch(&handle.user_id).await
    }

    pub async fn heartbeat(&self, handle: &SessionHandle, claimed: &UserId) -> Result<()> {
        if claimed != &handle.user_id {
            return Err(ServerError::Forbidden(
                "heartbeat for a different user".into(),
            ));
        }
        self.touch(&handle.user_id).await
    }

    /// Release the session on transport close. Presence is left to the
    /// sweeper so brief blips do not flap.
    pub async fn disconnect(&self, handle: &SessionHandle) {
        match self.sessions.release(handle).await {
            Ok(released) => {
                debug!(user = %handle.user_id, session = %handle.session_id, released, "Session closed");
            }
            Err(e) => {
                warn!(user = %handle.user_id, error = %e, "Failed to release session");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Persist then fan out. A duplicate `(sender, client_id)` returns the
    /// stored message and is not fanned out again.
    pub async fn send_message(
        &self,
        handle: &SessionHandle,
        request: SendRequest,
    ) -> Result<AppendOutcome> {
        validate_content(&request.content)?;

        if !self.send_limiter.check(handle.user_id.clone()).await {
            return Err(ServerError::RateLimited);
        }

        let sender_id = &handle.user_id;
        let record = match &request.conversation_id {
            Some(id) => {
                let record = self.conversations.get_for(id, sender_id).await?;
                if record.peer_of(sender_id) != Some(&request.receiver_id) {
                    return Err(ServerError::BadRequest(
                        "receiver is not the other participant".into(),
                    ));
                }
                record
            }
            None => {
                self.conversations
                    .open(sender_id, &request.receiver_id)
                    .await?
                    .0
            }
        };

        let outcome = self
            .messages
            .append(NewMessage {
                conversation_id: record.id.clone(),
                sender_id: sender_id.clone(),
                receiver_id: request.receiver_id.clone(),
                content: request.content,
                client_id: Some(request.client_id),
            })
            .await?;

        if outcome.duplicate {
            debug!(
                user = %sender_id,
                message = %outcome.message.id,
                "Duplicate send collapsed"
            );
        } else {
            debug!(
                conversation = %record.id,
                message = %outcome.message.id,
                ts = outcome.message.server_timestamp,
                "Message persisted"
            );
            self.push(
                &request.receiver_id,
                ServerFrame::Message {
                    message: outcome.message.clone(),
                },
            )
            .await;
        }

        Ok(outcome)
    }

    pub async fn fetch(
        &self,
        handle: &SessionHandle,
        conversation_id: &ConversationId,
        after: i64,
        limit: Option<usize>,
    ) -> Result<Vec<ConfirmedMessage>> {
        self.conversations
            .get_for(conversation_id, &handle.user_id)
            .await?;
        let limit = limit.unwrap_or(MAX_FETCH_LIMIT).clamp(1, MAX_FETCH_LIMIT);
        self.messages.since(conversation_id, after, limit).await
    }

    pub async fn list_conversations(
        &self,
        handle: &SessionHandle,
    ) -> Result<Vec<ConversationSummary>> {
        self.conversations.conversations_for(&handle.user_id).await
    }

    pub async fn open_conversation(
        &self,
        handle: &SessionHandle,
        peer_id: &UserId,
    ) -> Result<ConversationSummary> {
        let (record, _) = self.conversations.open(&handle.user_id, peer_id).await?;
        self.conversations.summary_for(&record, &handle.user_id).await
    }

    /// Stamp `read_at` on what the caller received and tell the sender.
    pub async fn mark_read(
        &self,
        handle: &SessionHandle,
        conversation_id: &ConversationId,
    ) -> Result<usize> {
        let record = self
            .conversations
            .get_for(conversation_id, &handle.user_id)
            .await?;
        let now = Utc::now();
        let updated = self
            .messages
            .mark_read(conversation_id, &handle.user_id, now)
            .await?;

        if updated > 0 {
            if let Some(peer) = record.peer_of(&handle.user_id) {
                self.push(
                    peer,
                    ServerFrame::Read {
                        conversation_id: conversation_id.clone(),
                        reader_id: handle.user_id.clone(),
                        read_at: now,
                    },
                )
                .await;
            }
        }
        Ok(updated)
    }

    pub async fn set_archived(
        &self,
        handle: &SessionHandle,
        conversation_id: &ConversationId,
        archived: bool,
    ) -> Result<()> {
        self.conversations
            .set_archived(&handle.user_id, conversation_id, archived)
            .await
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    pub async fn set_status(&self, handle: &SessionHandle, status: PresenceStatus) -> Result<()> {
        let event = self
            .presence
            .set_status(&handle.user_id, status, Utc::now())
            .await;
        self.broadcast_presence(event).await
    }

    pub async fn presence_of(&self, user_id: &UserId) -> Option<PresenceEvent> {
        self.presence.get(user_id).await.map(|r| r.to_event())
    }

    async fn touch(&self, user_id: &UserId) -> Result<()> {
        if let Some(event) = self.presence.touch(user_id, Utc::now()).await {
            info!(user = %user_id, "User online");
            self.broadcast_presence(event).await?;
        }
        Ok(())
    }

    /// Expire silent users: broadcast offline to their peers, mirror
    /// last-seen to the profile sink and drop their sessions.
    ///
    /// Expiry is final once the table has flipped a user offline, so a
    /// storage error for one user is logged and the rest are still handled.
    pub async fn sweep_presence(&self, now: DateTime<Utc>) -> usize {
        let expired = self.presence.expire(now).await;
        for event in &expired {
            info!(user = %event.user_id, last_seen = %event.last_seen, "User offline");

            let profiles = self.profiles.clone();
            let user_id = event.user_id.clone();
            let last_seen = event.last_seen;
            tokio::spawn(async move {
                profiles.record_last_seen(&user_id, last_seen).await;
            });

            if let Err(e) = self.sessions.evict(&event.user_id).await {
                warn!(user = %event.user_id, error = %e, "Session eviction failed");
            }
            if let Err(e) = self.broadcast_presence(event.clone()).await {
                warn!(user = %event.user_id, error = %e, "Offline broadcast failed");
            }
        }
        expired.len()
    }

    /// Forget send buckets that have been idle long enough to refill.
    pub async fn purge_idle_send_limits(&self, max_idle_secs: f64) {
        self.send_limiter.purge_stale(max_idle_secs).await;
    }

    /// Fan a presence change out to the user's conversation peers that have
    /// a session here.
    async fn broadcast_presence(&self, event: PresenceEvent) -> Result<()> {
        for peer in self.conversations.peers_of(&event.user_id).await? {
            self.push(&peer, ServerFrame::Presence(event.clone())).await;
        }
        Ok(())
    }

    /// Best-effort delivery to a user's current session. Never retried.
    async fn push(&self, user_id: &UserId, frame: ServerFrame) {
        match self.sessions.sender_for(user_id).await {
            Ok(Some(sender)) => {
                if sender.try_send(frame).is_err() {
                    debug!(user = %user_id, "Fan-out dropped, session backlog full or closed");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(user = %user_id, error = %e, "Session lookup failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Admin
    // -----------------------------------------------------------------------

    pub async fn status(&self) -> Result<HubStatus> {
        Ok(HubStatus {
            active_sessions: self.sessions.active_count().await,
            online_users: self.presence.online_count().await,
            stored_messages: self.messages.count().await?,
        })
    }

    /// Unscoped history read for operators.
    pub async fn conversation_history(
        &self,
        conversation_id: &ConversationId,
        after: i64,
        limit: usize,
    ) -> Result<Vec<ConfirmedMessage>> {
        if self.conversations.get(conversation_id).await?.is_none() {
            return Err(ServerError::ConversationNotFound(conversation_id.clone()));
        }
        self.messages
            .since(conversation_id, after, limit.clamp(1, MAX_FETCH_LIMIT))
            .await
    }
}

/// Run [`RelayHub::sweep_presence`] every `interval`.
pub fn spawn_presence_sweeper(hub: Arc<RelayHub>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let expired = hub.sweep_presence(Utc::now()).await;
            if expired > 0 {
                debug!(expired, "Presence sweep");
            }
        }
    })
}
