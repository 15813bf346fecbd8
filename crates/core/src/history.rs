//! History gateway: the append-only message log of each conversation.

use async_trait::async_trait;

use crate::agent::AgentType;
use crate::error::HistoryError;
use crate::message::{ContentBlock, Conversation, ConversationId, Message, Role};

/// Durable conversation history.
///
/// Messages are only ever appended; nothing here updates or deletes one.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> std::result::Result<Option<Conversation>, HistoryError>;

    async fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> std::result::Result<(), HistoryError>;

    /// Messages of the conversation in the order they were saved.
    async fn get_conversation_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> std::result::Result<Vec<Message>, HistoryError>;

    /// Append a message and touch the conversation's `updated_at`.
    async fn save_message(
        &self,
        conversation_id: &ConversationId,
        role: Role,
        content: Vec<ContentBlock>,
    ) -> std::result::Result<Message, HistoryError>;

    /// Append the user message and the assistant reply of one turn as a
    /// unit. On error neither message is stored.
    async fn save_exchange(
        &self,
        conversation_id: &ConversationId,
        user: Vec<ContentBlock>,
        assistant: Vec<ContentBlock>,
    ) -> std::result::Result<(Message, Message), HistoryError>;

    /// Look the conversation up, creating it for `user_id` if it does not exist.
    async fn ensure_conversation(
        &self,
        conversation_id: &ConversationId,
        user_id: &str,
        agent_type: AgentType,
    ) -> std::result::Result<Conversation, HistoryError> {
        if let Some(existing) = self.get_conversation(conversation_id).await? {
            return Ok(existing);
        }
        let conversation = Conversation::new(conversation_id.clone(), user_id, agent_type);
        self.create_conversation(&conversation).await?;
        Ok(conversation)
    }
}
