//! Domain model structs persisted in the local database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to a UI layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_shared::{ClientId, ConfirmedMessage, ConversationId, MessageId, UserId};

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Delivery state of an outbox entry.
///
/// Entries only move forward: `pending → sending → {sent | pending | failed}`.
/// `failed` is left only through an explicit user retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// What the UI hands over when the user presses send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewOutboxMessage {
    /// Known conversation, or `None` for a first message to a new peer.
    pub conversation_id: Option<ConversationId>,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
}

/// A message not yet confirmed durable on the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxMessage {
    /// Idempotency key; exactly one outbox row per client id.
    pub client_id: ClientId,
    pub conversation_id: Option<ConversationId>,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    /// Client clock at enqueue time.
    pub created_at: DateTime<Utc>,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Relay message id, set once the entry is `sent`.
    pub confirmed_id: Option<MessageId>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Build a fresh `pending` entry with a newly generated client id.
    pub fn new(message: NewOutboxMessage, now: DateTime<Utc>) -> Self {
        Self {
            client_id: ClientId::generate(),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            content: message.content,
            created_at: now,
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_attempt_at: None,
            confirmed_id: None,
            sent_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

/// A conversation this client knows about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalConversation {
    pub id: ConversationId,
    pub peer_id: UserId,
    /// Per-user archive flag mirrored from the relay.
    pub archived: bool,
    /// Server timestamp of the last reconciled message.
    pub sync_cursor: i64,
}

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

/// One bubble in a rendered conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ViewEntry {
    /// Relay-confirmed message.
    Confirmed(ConfirmedMessage),
    /// Optimistic bubble for an outbox entry with no confirmed counterpart.
    Pending(OutboxMessage),
}

impl ViewEntry {
    pub fn content(&self) -> &str {
        match self {
            Self::Confirmed(m) => &m.content,
            Self::Pending(m) => &m.content,
        }
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        match self {
            Self::Confirmed(m) => m.client_id.as_ref(),
            Self::Pending(m) => Some(&m.client_id),
        }
    }
}
