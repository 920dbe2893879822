use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_shared::{ConversationId, CourierError, ErrorCode};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Session superseded by a newer login")]
    SessionSuperseded,

    #[error("Session expired, authenticate again")]
    SessionExpired,

    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl ServerError {
    /// Wire error code carried in `error` frames.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::NotAuthenticated
            | ServerError::AuthRejected(_)
            | ServerError::SessionExpired => ErrorCode::NotAuthenticated,
            ServerError::SessionSuperseded => ErrorCode::SessionSuperseded,
            ServerError::ConversationNotFound(_) => ErrorCode::ConversationNotFound,
            ServerError::BadRequest(_) => ErrorCode::InvalidRequest,
            ServerError::Forbidden(_) => ErrorCode::Forbidden,
            ServerError::RateLimited => ErrorCode::RateLimited,
            ServerError::Storage(_) | ServerError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Message safe to hand to a client; storage details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ServerError::Storage(_) => "Storage error".to_string(),
            ServerError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<rusqlite::Error> for ServerError {
    fn from(e: rusqlite::Error) -> Self {
        ServerError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        ServerError::Internal(format!("serialization: {e}"))
    }
}

impl From<CourierError> for ServerError {
    fn from(e: CourierError) -> Self {
        ServerError::BadRequest(e.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::NotAuthenticated
            | ServerError::AuthRejected(_)
            | ServerError::SessionExpired => StatusCode::UNAUTHORIZED,
            ServerError::SessionSuperseded => StatusCode::CONFLICT,
            ServerError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ServerError::Storage(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = serde_json::json!({
            "error": self.public_message(),
        });

        (status, axum::Json(body)).into_response()
    }
}
