use thiserror::Error;

use courier_shared::{CourierError, ErrorCode};
use courier_store::{OutboxMessage, StoreError};

/// Failure of a single request over the relay link.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("Not connected to the relay")]
    NotConnected,

    #[error("Request timed out")]
    Timeout,

    #[error("Connection closed before a response arrived")]
    Closed,

    #[error("Relay rejected the request ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl LinkError {
    /// Worth another attempt later, as opposed to a definite refusal.
    pub fn is_transient(&self) -> bool {
        match self {
            LinkError::NotConnected | LinkError::Timeout | LinkError::Closed => true,
            LinkError::Rejected { code, .. } => matches!(
                code,
                ErrorCode::RateLimited | ErrorCode::Internal | ErrorCode::NotAuthenticated
            ),
            LinkError::UnexpectedResponse(_) => false,
        }
    }

    /// The session itself is gone, not just this request.
    pub fn is_session_lost(&self) -> bool {
        match self {
            LinkError::NotConnected => true,
            LinkError::Rejected { code, .. } => matches!(
                code,
                ErrorCode::SessionSuperseded | ErrorCode::NotAuthenticated
            ),
            _ => false,
        }
    }
}

/// Write-ahead failure. The message was not stored; it is handed back
/// marked `failed` so the caller can still show it.
#[derive(Debug, Error)]
#[error("Failed to persist outbox entry {}: {source}", .message.client_id)]
pub struct EnqueueError {
    pub message: OutboxMessage,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    #[error("Relay error: {0}")]
    Link(#[from] LinkError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<CourierError> for ClientError {
    fn from(e: CourierError) -> Self {
        ClientError::InvalidInput(e.to_string())
    }
}
