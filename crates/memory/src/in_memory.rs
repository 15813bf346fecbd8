//! In-memory backends: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use chrono::Utc;
use grantwell_core::error::{HistoryError, MemoryError};
use grantwell_core::history::HistoryStore;
use grantwell_core::memory::{MemoryEntry, MemoryStore};
use grantwell_core::message::{ContentBlock, Conversation, ConversationId, Message, Role};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Memory entries kept in a map of per-conversation vectors.
#[derive(Default)]
pub struct InMemoryMemory {
    entries: RwLock<HashMap<ConversationId, Vec<MemoryEntry>>>,
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemory {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn store(
        &self,
        conversation_id: &ConversationId,
        key: &str,
        value: &str,
    ) -> Result<MemoryEntry, MemoryError> {
        let mut entries = self.entries.write().await;
        let list = entries.entry(conversation_id.clone()).or_default();

        if let Some(existing) = list.iter_mut().find(|e| e.key == key) {
            existing.value = value.to_string();
            existing.updated_at = Utc::now();
            return Ok(existing.clone());
        }

        let entry = MemoryEntry::new(conversation_id.clone(), key, value);
        list.push(entry.clone());
        Ok(entry)
    }

    async fn recall(
        &self,
        conversation_id: &ConversationId,
        key: &str,
    ) -> Result<Option<MemoryEntry>, MemoryError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(conversation_id)
            .and_then(|list| list.iter().find(|e| e.key == key).cloned()))
    }

    async fn list(&self, conversation_id: &ConversationId) -> Result<Vec<MemoryEntry>, MemoryError> {
        let entries = self.entries.read().await;
        Ok(entries.get(conversation_id).cloned().unwrap_or_default())
    }

    async fn clear(&self, conversation_id: &ConversationId) -> Result<usize, MemoryError> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(conversation_id).map(|l| l.len()).unwrap_or(0))
    }
}

#[derive(Default)]
struct HistoryState {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
}

/// Conversation history held in process memory.
#[derive(Default)]
pub struct InMemoryHistory {
    state: RwLock<HistoryState>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>, HistoryError> {
        Ok(self
            .state
            .read()
            .await
            .conversations
            .get(conversation_id)
            .cloned())
    }

    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), HistoryError> {
        self.state
            .write()
            .await
            .conversations
            .entry(conversation.id.clone())
            .or_insert_with(|| conversation.clone());
        Ok(())
    }

    async fn get_conversation_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, HistoryError> {
        Ok(self
            .state
            .read()
            .await
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_message(
        &self,
        conversation_id: &ConversationId,
        role: Role,
        content: Vec<ContentBlock>,
    ) -> Result<Message, HistoryError> {
        let message = Message::new(conversation_id.clone(), role, content);
        self.append(conversation_id, vec![message.clone()]).await?;
        Ok(message)
    }

    async fn save_exchange(
        &self,
        conversation_id: &ConversationId,
        user: Vec<ContentBlock>,
        assistant: Vec<ContentBlock>,
    ) -> Result<(Message, Message), HistoryError> {
        let user = Message::new(conversation_id.clone(), Role::User, user);
        let assistant = Message::new(conversation_id.clone(), Role::Assistant, assistant);
        self.append(conversation_id, vec![user.clone(), assistant.clone()])
            .await?;
        Ok((user, assistant))
    }
}

impl InMemoryHistory {
    /// Append under a single write guard so readers never see half a batch.
    async fn append(
        &self,
        conversation_id: &ConversationId,
        messages: Vec<Message>,
    ) -> Result<(), HistoryError> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| HistoryError::ConversationNotFound(conversation_id.to_string()))?;
        if let Some(last) = messages.last() {
            conversation.updated_at = last.created_at;
        }
        state
            .messages
            .entry(conversation_id.clone())
            .or_default()
            .extend(messages);
        Ok(())
    }
}
