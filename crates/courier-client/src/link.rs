use async_trait::async_trait;

use courier_shared::{ConfirmedMessage, ConversationId, ConversationSummary};
use courier_store::OutboxMessage;

use crate::error::LinkError;

/// Relay acknowledgement of one delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: ConfirmedMessage,
    /// The relay already held this client id.
    pub duplicate: bool,
}

/// The request/response half of the relay connection, as the sync engine
/// sees it.
#[async_trait]
pub trait RelayLink: Send + Sync {
    /// Authenticated and able to carry requests right now.
    fn is_ready(&self) -> bool;

    async fn deliver(&self, message: &OutboxMessage) -> Result<Delivery, LinkError>;

    async fn fetch_since(
        &self,
        conversation_id: &ConversationId,
        after: i64,
        limit: usize,
    ) -> Result<Vec<ConfirmedMessage>, LinkError>;

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, LinkError>;
}
