//! Memory trait: durable per-conversation key/value facts.
//!
//! Entries are written by tool calls and read once at the start of every
//! turn to augment the system instructions. Keys are unique within a
//! conversation; storing an existing key overwrites its value.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::message::ConversationId;

/// A single remembered fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub conversation_id: ConversationId,
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(
        conversation_id: ConversationId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            conversation_id,
            key: key.into(),
            value: value.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Render entries as the block appended to the system instructions.
/// Returns an empty string when there is nothing to render.
pub fn format_entries(entries: &[MemoryEntry]) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Remembered Facts\n");
    for entry in entries {
        out.push_str("- ");
        out.push_str(&entry.key);
        out.push_str(": ");
        out.push_str(&entry.value);
        out.push('\n');
    }
    out
}

/// The core Memory trait.
///
/// Implementations: in-memory (tests and ephemeral runs) and SQLite.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Human-readable name of this backend.
    fn name(&self) -> &str;

    /// Insert or overwrite `key` for the conversation.
    async fn store(
        &self,
        conversation_id: &ConversationId,
        key: &str,
        value: &str,
    ) -> std::result::Result<MemoryEntry, MemoryError>;

    async fn recall(
        &self,
        conversation_id: &ConversationId,
        key: &str,
    ) -> std::result::Result<Option<MemoryEntry>, MemoryError>;

    /// All entries for the conversation, oldest first.
    async fn list(
        &self,
        conversation_id: &ConversationId,
    ) -> std::result::Result<Vec<MemoryEntry>, MemoryError>;

    /// Remove every entry for the conversation. Returns how many were removed.
    async fn clear(
        &self,
        conversation_id: &ConversationId,
    ) -> std::result::Result<usize, MemoryError>;

    /// Formatted memory block for the instructions, or `""`.
    ///
    /// Never fails: a storage error is logged and treated as "no memories".
    async fn load_as_context(&self, conversation_id: &ConversationId) -> String {
        match self.list(conversation_id).await {
            Ok(entries) => format_entries(&entries),
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "Failed to load memory, continuing without it"
                );
                String::new()
            }
        }
    }
}
