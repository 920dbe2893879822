//! Transport session: one logical websocket connection to the relay,
//! reconnecting with capped exponential backoff.
//!
//! Requests carry a `requestId` and are answered through a oneshot waiting
//! in the pending table, so the sync engine and the UI can share the
//! connection. Everything the relay pushes unprompted goes out on a single
//! [`EventBus<InboundEvent>`].
//!
//! Authentication rejection and session takeover are terminal: the run loop
//! parks until [`Transport::reconnect`] or [`Transport::shutdown`].

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use courier_shared::{
    ClientFrame, ConfirmedMessage, ConversationId, ConversationSummary, ErrorCode,
    PresenceStatus, ServerFrame, UserId,
};
use courier_store::OutboxMessage;

use crate::config::ClientConfig;
use crate::error::LinkError;
use crate::events::{EventBus, InboundEvent, Subscription};
use crate::link::{Delivery, RelayLink};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    Authenticating,
    Authenticated { session_id: String },
    /// Gave up after `attempts` consecutive failures.
    Unreachable { attempts: u32 },
    AuthRejected { reason: String },
    /// Another login of this user took over the relay session.
    Superseded,
}

impl ConnectionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    /// Parked until an explicit reconnect.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::AuthRejected { .. } | Self::Superseded
        )
    }
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`,
/// never above `cap`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// Why a connection ended.
#[derive(Debug)]
enum SessionEnd {
    /// Never reached `authenticated`.
    Failed(String),
    /// Authenticated, then the link dropped.
    Dropped,
    Rejected(String),
    Superseded,
}

#[derive(Debug, Clone)]
struct Settings {
    relay_url: String,
    user_id: UserId,
    display_name: String,
    request_timeout: Duration,
    reconnect_attempts: u32,
    reconnect_base_delay: Duration,
    reconnect_max_delay: Duration,
}

impl From<&ClientConfig> for Settings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            relay_url: config.relay_url.clone(),
            user_id: config.user_id.clone(),
            display_name: config.display_name.clone(),
            request_timeout: config.request_timeout,
            reconnect_attempts: config.reconnect_attempts.max(1),
            reconnect_base_delay: config.reconnect_base_delay,
            reconnect_max_delay: config.reconnect_max_delay,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Settings,
    state: watch::Sender<ConnectionState>,
    /// Outbound frames; present only while authenticated.
    writer: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ServerFrame>>>,
    next_request_id: AtomicU64,
    inbound: EventBus<InboundEvent>,
    reconnect: Notify,
    shutdown: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Transport {
    /// Start connecting in the background.
    pub fn spawn(config: &ClientConfig) -> (Self, JoinHandle<()>) {
        let transport = Self::new(Settings::from(config));
        let inner = transport.inner.clone();
        let task = tokio::spawn(run(inner));
        (transport, task)
    }

    fn new(settings: Settings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                settings,
                state,
                writer: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(1),
                inbound: EventBus::default(),
                reconnect: Notify::new(),
                shutdown,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated()
    }

    /// The multiplexed stream of relay pushes.
    pub fn inbound(&self) -> Subscription<InboundEvent> {
        self.inner.inbound.subscribe()
    }

    /// Leave a parked state, or cut a backoff wait short. No effect while a
    /// connection attempt or session is in progress.
    pub fn reconnect(&self) {
        let state = self.state();
        if !(state.is_terminal() || matches!(state, ConnectionState::Disconnected)) {
            return;
        }
        debug!(?state, "Reconnect requested");
        self.inner.reconnect.notify_one();
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Fire-and-forget frame.
    pub fn send(&self, frame: ClientFrame) -> Result<(), LinkError> {
        match lock(&self.inner.writer).as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| LinkError::NotConnected),
            None => Err(LinkError::NotConnected),
        }
    }

    /// Send a frame built around a fresh request id and wait for the matching
    /// response. An `error` answer becomes [`LinkError::Rejected`].
    pub async fn request(
        &self,
        build: impl FnOnce(u64) -> ClientFrame,
    ) -> Result<ServerFrame, LinkError> {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(request_id, tx);

        if let Err(e) = self.send(build(request_id)) {
            lock(&self.inner.pending).remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.settings.request_timeout, rx).await {
            Ok(Ok(ServerFrame::Error { code, message, .. })) => {
                Err(LinkError::Rejected { code, message })
            }
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => {
                lock(&self.inner.pending).remove(&request_id);
                Err(LinkError::Timeout)
            }
        }
    }

    pub fn heartbeat(&self) -> Result<(), LinkError> {
        self.send(ClientFrame::Heartbeat {
            user_id: self.inner.settings.user_id.clone(),
            timestamp: Utc::now(),
        })
    }

    pub fn set_status(&self, status: PresenceStatus) -> Result<(), LinkError> {
        self.send(ClientFrame::SetStatus { status })
    }

    pub fn mark_read(&self, conversation_id: &ConversationId) -> Result<(), LinkError> {
        self.send(ClientFrame::MarkRead {
            conversation_id: conversation_id.clone(),
        })
    }

    pub fn set_archived(
        &self,
        conversation_id: &ConversationId,
        archived: bool,
    ) -> Result<(), LinkError> {
        self.send(ClientFrame::SetArchived {
            conversation_id: conversation_id.clone(),
            archived,
        })
    }

    pub async fn open_conversation(&self, peer_id: &UserId) -> Result<ConversationSummary, LinkError> {
        let peer_id = peer_id.clone();
        match self
            .request(|request_id| ClientFrame::OpenConversation { request_id, peer_id })
            .await?
        {
            ServerFrame::Conversation { conversation, .. } => Ok(conversation),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(frame: &ServerFrame) -> LinkError {
    LinkError::UnexpectedResponse(format!("{frame:?}"))
}

#[async_trait]
impl RelayLink for Transport {
    fn is_ready(&self) -> bool {
        self.is_authenticated()
    }

    async fn deliver(&self, message: &OutboxMessage) -> Result<Delivery, LinkError> {
        let frame = |request_id: u64| ClientFrame::Send {
            request_id,
            conversation_id: message.conversation_id.clone(),
            receiver_id: message.receiver_id.clone(),
            content: message.content.clone(),
            client_id: message.client_id.clone(),
        };
        match self.request(frame).await? {
            ServerFrame::Ack {
                message,
                duplicate,
                ..
            } => Ok(Delivery { message, duplicate }),
            other => Err(unexpected(&other)),
        }
    }

    async fn fetch_since(
        &self,
        conversation_id: &ConversationId,
        after: i64,
        limit: usize,
    ) -> Result<Vec<ConfirmedMessage>, LinkError> {
        let frame = |request_id: u64| ClientFrame::Fetch {
            request_id,
            conversation_id: conversation_id.clone(),
            after,
            limit: Some(limit),
        };
        match self.request(frame).await? {
            ServerFrame::History { messages, .. } => Ok(messages),
            other => Err(unexpected(&other)),
        }
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, LinkError> {
        match self
            .request(|request_id| ClientFrame::ListConversations { request_id })
            .await?
        {
            ServerFrame::Conversations { conversations, .. } => Ok(conversations),
            other => Err(unexpected(&other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection loop
// ---------------------------------------------------------------------------

async fn run(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        inner.set_state(ConnectionState::Connecting {
            attempt: failures + 1,
        });
        inner.discard_reconnect_request();
        let end = tokio::select! {
            end = inner.run_session() => end,
            _ = shutdown.wait_for(|stop| *stop) => break,
        };
        inner.clear_session();

        let delay = match end {
            SessionEnd::Dropped => {
                info!("Relay connection lost");
                failures = 0;
                inner.settings.reconnect_base_delay
            }
            SessionEnd::Failed(reason) => {
                failures += 1;
                warn!(attempt = failures, %reason, "Relay connection attempt failed");
                if failures >= inner.settings.reconnect_attempts {
                    inner.set_state(ConnectionState::Unreachable { attempts: failures });
                    if !inner.park(&mut shutdown).await {
                        break;
                    }
                    failures = 0;
                    continue;
                }
                backoff_delay(
                    failures,
                    inner.settings.reconnect_base_delay,
                    inner.settings.reconnect_max_delay,
                )
            }
            SessionEnd::Rejected(reason) => {
                warn!(%reason, "Relay rejected authentication");
                inner.set_state(ConnectionState::AuthRejected { reason });
                if !inner.park(&mut shutdown).await {
                    break;
                }
                failures = 0;
                continue;
            }
            SessionEnd::Superseded => {
                info!("Session superseded by another login");
                inner.set_state(ConnectionState::Superseded);
                if !inner.park(&mut shutdown).await {
                    break;
                }
                failures = 0;
                continue;
            }
        };

        inner.set_state(ConnectionState::Disconnected);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.reconnect.notified() => {}
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }

    inner.clear_session();
    inner.set_state(ConnectionState::Disconnected);
    debug!("Transport stopped");
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = ?current, to = ?next, "Connection state");
            *current = next;
            true
        });
    }

    /// Wait in a terminal state. Returns `false` on shutdown.
    async fn park(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = self.reconnect.notified() => true,
            _ = shutdown.wait_for(|stop| *stop) => false,
        }
    }

    /// Consume a reconnect request left over from before this attempt, so it
    /// cannot cut the next backoff short.
    fn discard_reconnect_request(&self) {
        let notified = self.reconnect.notified();
        tokio::pin!(notified);
        if notified.as_mut().enable() {
            debug!("Discarded stale reconnect request");
        }
    }

    /// Drop the writer and fail every waiting request with `Closed`.
    fn clear_session(&self) {
        lock(&self.writer).take();
        lock(&self.pending).clear();
    }

    async fn run_session(&self) -> SessionEnd {
        let settings = &self.settings;
        let connect = tokio_tungstenite::connect_async(settings.relay_url.as_str());
        let ws = match tokio::time::timeout(settings.request_timeout, connect).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => return SessionEnd::Failed(e.to_string()),
            Err(_) => return SessionEnd::Failed("connect timed out".into()),
        };
        self.set_state(ConnectionState::Connected);

        let (mut sink, mut stream) = ws.split();

        self.set_state(ConnectionState::Authenticating);
        let hello = ClientFrame::Authenticate {
            user_id: settings.user_id.clone(),
            display_name: settings.display_name.clone(),
        };
        let text = match hello.to_text() {
            Ok(text) => text,
            Err(e) => return SessionEnd::Failed(e.to_string()),
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            return SessionEnd::Failed(e.to_string());
        }

        let handshake = async {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerFrame::from_text(&text) {
                        Ok(ServerFrame::AuthAck { session_id, .. }) => return Ok(session_id),
                        Ok(ServerFrame::AuthRejected { reason }) => {
                            return Err(SessionEnd::Rejected(reason))
                        }
                        Ok(other) => debug!(frame = ?other, "Ignoring frame before auth ack"),
                        Err(e) => warn!(error = %e, "Unparsable frame from relay"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => return Err(SessionEnd::Failed(e.to_string())),
                }
            }
            Err(SessionEnd::Failed("closed during authentication".into()))
        };
        let session_id = match tokio::time::timeout(settings.request_timeout, handshake).await {
            Ok(Ok(session_id)) => session_id,
            Ok(Err(end)) => return end,
            Err(_) => return SessionEnd::Failed("authentication timed out".into()),
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<ClientFrame>();
        *lock(&self.writer) = Some(tx);
        info!(user = %settings.user_id, session = %session_id, "Authenticated with relay");
        self.set_state(ConnectionState::Authenticated { session_id });

        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    let Some(frame) = outbound else {
                        return SessionEnd::Dropped;
                    };
                    let text = match frame.to_text() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode frame");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        debug!(error = %e, "Relay write failed");
                        return SessionEnd::Dropped;
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let ControlFlow::Break(end) = self.handle_text(&text) {
                            return end;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "Relay read failed");
                        return SessionEnd::Dropped;
                    }
                },
            }
        }
    }

    /// Route one frame from an authenticated session.
    fn handle_text(&self, text: &str) -> ControlFlow<SessionEnd> {
        let frame = match ServerFrame::from_text(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Unparsable frame from relay");
                return ControlFlow::Continue(());
            }
        };

        let superseded = matches!(
            frame,
            ServerFrame::Error {
                code: ErrorCode::SessionSuperseded,
                ..
            }
        );

        let frame = match frame.request_id() {
            Some(request_id) => match lock(&self.pending).remove(&request_id) {
                Some(waiter) => {
                    let _ = waiter.send(frame);
                    None
                }
                None => Some(frame),
            },
            None => Some(frame),
        };

        if superseded {
            return ControlFlow::Break(SessionEnd::Superseded);
        }

        let Some(frame) = frame else {
            return ControlFlow::Continue(());
        };

        let event = match frame {
            ServerFrame::Message { message } => InboundEvent::Message(message),
            ServerFrame::Ack { message, .. } => InboundEvent::Ack(message),
            ServerFrame::Presence(event) => InboundEvent::Presence(event),
            ServerFrame::Read {
                conversation_id,
                reader_id,
                read_at,
            } => InboundEvent::Read {
                conversation_id,
                reader_id,
                read_at,
            },
            ServerFrame::Error { code, message, .. } => {
                warn!(?code, %message, "Relay error");
                InboundEvent::Error { code, message }
            }
            other => {
                debug!(frame = ?other, "Dropping late response");
                return ControlFlow::Continue(());
            }
        };
        self.inbound.publish(event);
        ControlFlow::Continue(())
    }
}
