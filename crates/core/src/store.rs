//! Conversation persistence contract consumed by the orchestration loop.

use async_trait::async_trait;

use crate::domain::conversation::{Conversation, ConversationId, ConversationSummary, Message};
use crate::domain::task::UserId;
use crate::errors::StoreError;

/// Ordered, user-owned conversation history.
///
/// Implementations must serialize appends per conversation so that two
/// concurrent appends never interleave or lose messages, and must signal
/// [`StoreError::Full`] before the message ceiling is exceeded.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(&self, user: &UserId, title: &str) -> Result<Conversation, StoreError>;

    async fn append(&self, conversation_id: &ConversationId, message: Message)
        -> Result<(), StoreError>;

    /// Load a conversation and its messages in strict creation order.
    /// Fails with `NotFound` for unknown ids and `Forbidden` when the
    /// conversation belongs to a different user.
    async fn load(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
    ) -> Result<(Conversation, Vec<Message>), StoreError>;

    async fn load_latest(&self, user: &UserId) -> Result<Option<Conversation>, StoreError>;

    async fn list(&self, user: &UserId) -> Result<Vec<ConversationSummary>, StoreError>;

    async fn message_count(&self, conversation_id: &ConversationId) -> Result<usize, StoreError>;
}
