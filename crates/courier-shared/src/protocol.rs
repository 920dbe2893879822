use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_CONTENT_LEN;
use crate::error::CourierError;
use crate::types::{ClientId, ConversationId, MessageId, PresenceStatus, UserId};

/// Frames sent by a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Bind this connection to a user. Idempotent.
    Authenticate {
        user_id: UserId,
        display_name: String,
    },

    /// Liveness signal, sent every heartbeat interval while authenticated
    Heartbeat {
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },

    /// Deliver one outbox entry. Without a conversation id the relay looks
    /// up (or allocates) the conversation for `{sender, receiver_id}`.
    Send {
        request_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
        receiver_id: UserId,
        content: String,
        client_id: ClientId,
    },

    /// Confirmed messages with `server_timestamp > after`, ascending.
    Fetch {
        request_id: u64,
        conversation_id: ConversationId,
        after: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    ListConversations {
        request_id: u64,
    },

    OpenConversation {
        request_id: u64,
        peer_id: UserId,
    },

    SetStatus {
        status: PresenceStatus,
    },

    MarkRead {
        conversation_id: ConversationId,
    },

    SetArchived {
        conversation_id: ConversationId,
        archived: bool,
    },
}

/// Frames sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    AuthAck {
        user_id: UserId,
        session_id: String,
    },

    AuthRejected {
        reason: String,
    },

    /// The persisted message, echoing the sender's client id.
    Ack {
        request_id: u64,
        message: ConfirmedMessage,
        duplicate: bool,
    },

    /// Fan-out of a new message to its receiver.
    Message {
        message: ConfirmedMessage,
    },

    Presence(PresenceEvent),

    History {
        request_id: u64,
        conversation_id: ConversationId,
        messages: Vec<ConfirmedMessage>,
    },

    Conversations {
        request_id: u64,
        conversations: Vec<ConversationSummary>,
    },

    Conversation {
        request_id: u64,
        conversation: ConversationSummary,
    },

    Read {
        conversation_id: ConversationId,
        reader_id: UserId,
        read_at: DateTime<Utc>,
    },

    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        code: ErrorCode,
        message: String,
    },
}

impl ServerFrame {
    /// Request id for frames that answer a specific request.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Ack { request_id, .. }
            | Self::History { request_id, .. }
            | Self::Conversations { request_id, .. }
            | Self::Conversation { request_id, .. } => Some(*request_id),
            Self::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    NotAuthenticated,
    SessionSuperseded,
    ConversationNotFound,
    Forbidden,
    InvalidRequest,
    RateLimited,
    Internal,
}

/// A server-acknowledged, persisted message. Immutable apart from `read_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedMessage {
    pub id: MessageId,
    #[serde(default)]
    pub client_id: Option<ClientId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    /// Milliseconds since the Unix epoch, assigned by the relay clock.
    pub server_timestamp: i64,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub status: PresenceStatus,
}

/// A conversation as seen by one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub peer_id: UserId,
    pub archived: bool,
}

impl ClientFrame {
    /// Request id for frames that expect a correlated response.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Send { request_id, .. }
            | Self::Fetch { request_id, .. }
            | Self::ListConversations { request_id }
            | Self::OpenConversation { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    pub fn to_text(&self) -> Result<String, CourierError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, CourierError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerFrame {
    pub fn to_text(&self) -> Result<String, CourierError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, CourierError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Reject empty or oversized message bodies.
pub fn validate_content(content: &str) -> Result<(), CourierError> {
    if content.trim().is_empty() {
        return Err(CourierError::Protocol("empty message content".into()));
    }
    if content.len() > MAX_CONTENT_LEN {
        return Err(CourierError::ContentTooLarge {
            size: content.len(),
            max: MAX_CONTENT_LEN,
        });
    }
    Ok(())
}
