//! Message and Conversation domain types.
//!
//! Content produced by the reasoning engine comes in two kinds:
//! [`ContentBlock`] is durable and may be written to history, while
//! [`TransientBlock`] (reasoning traces) only lives for the duration of a
//! turn. A persisted [`Message`] can only hold `ContentBlock`s, so a
//! thinking trace cannot reach storage by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentType;

/// Unique identifier for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Durable content. Everything in a persisted [`Message`] is one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        /// Base64-encoded payload.
        data: String,
    },
    Document {
        media_type: String,
        /// Base64-encoded payload.
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Ephemeral content that must never be persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransientBlock {
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

/// A block of engine output: either durable or turn-scoped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Block {
    Persistable(ContentBlock),
    Transient(TransientBlock),
}

impl Block {
    pub fn text(text: impl Into<String>) -> Self {
        Block::Persistable(ContentBlock::text(text))
    }

    pub fn thinking(thinking: impl Into<String>) -> Self {
        Block::Transient(TransientBlock::Thinking {
            thinking: thinking.into(),
            signature: None,
        })
    }

    /// The durable half of this block, if any.
    pub fn into_persistable(self) -> Option<ContentBlock> {
        match self {
            Block::Persistable(b) => Some(b),
            Block::Transient(_) => None,
        }
    }
}

impl From<ContentBlock> for Block {
    fn from(b: ContentBlock) -> Self {
        Block::Persistable(b)
    }
}

/// Drop transient blocks, keeping the order of everything else.
pub fn retain_persistable(blocks: impl IntoIterator<Item = Block>) -> Vec<ContentBlock> {
    blocks.into_iter().filter_map(Block::into_persistable).collect()
}

/// A persisted message. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(conversation_id: ConversationId, role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id,
            role,
            content,
            created_at: Utc::now(),
        }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A message as sent to the reasoning engine within a turn. Unlike
/// [`Message`] it may carry transient blocks produced earlier in the turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: Vec<Block>,
}

impl ContextMessage {
    pub fn user(content: Vec<Block>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn assistant(content: Vec<Block>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }
}

/// Conversation metadata. Messages are owned by the history store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: String,
    pub agent_type: AgentType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: ConversationId, user_id: impl Into<String>, agent_type: AgentType) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id: user_id.into(),
            agent_type,
            created_at: now,
            updated_at: now,
        }
    }
}
