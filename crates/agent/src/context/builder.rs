//! Context builder: one request payload per turn.
//!
//! Merges, in this order:
//!
//! 1. **Instructions**: the agent's system text, followed by the
//!    conversation's remembered facts when there are any
//! 2. **History**: prior persisted messages, oldest first
//! 3. **New turn**: attachments, then the user's text
//!
//! Tool declarations come from the capability registry for the agent type.
//! Nothing is written here; memory and history are only read.

use grantwell_core::error::{HistoryError, ValidationError};
use grantwell_core::message::{Block, ContentBlock, ContextMessage, Message};
use grantwell_core::tool::ToolDeclaration;
use grantwell_core::{AgentType, ConversationId, HistoryStore, MemoryStore};
use grantwell_tools::CapabilityRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::attachment::{TurnInput, to_context_blocks};

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Everything the turn loop needs for its first engine call.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub instructions: String,
    /// Prior messages, ready to send.
    pub history: Vec<ContextMessage>,
    /// The user message of this turn, as it will be persisted.
    pub user_content: Vec<ContentBlock>,
    pub tools: Vec<ToolDeclaration>,
}

impl AssembledContext {
    /// History followed by the new user message.
    pub fn messages(&self) -> Vec<ContextMessage> {
        let mut messages = self.history.clone();
        messages.push(ContextMessage::user(to_context_blocks(&self.user_content)));
        messages
    }
}

pub struct ContextBuilder {
    memory: Arc<dyn MemoryStore>,
    history: Arc<dyn HistoryStore>,
    registry: Arc<CapabilityRegistry>,
    instructions: HashMap<AgentType, String>,
}

impl ContextBuilder {
    pub fn new(
        memory: Arc<dyn MemoryStore>,
        history: Arc<dyn HistoryStore>,
        registry: Arc<CapabilityRegistry>,
    ) -> Self {
        Self {
            memory,
            history,
            registry,
            instructions: HashMap::new(),
        }
    }

    /// Replace the built-in instructions of `agent`.
    pub fn with_instructions(mut self, agent: AgentType, text: impl Into<String>) -> Self {
        self.instructions.insert(agent, text.into());
        self
    }

    pub fn instructions_for(&self, agent: AgentType) -> &str {
        self.instructions
            .get(&agent)
            .map(String::as_str)
            .unwrap_or_else(|| agent.default_instructions())
    }

    /// Validate `input` and assemble the request context.
    ///
    /// Validation runs before any store is touched, so a malformed
    /// attachment never costs a read.
    pub async fn build(
        &self,
        agent: AgentType,
        conversation_id: &ConversationId,
        input: TurnInput,
    ) -> Result<AssembledContext, AssemblyError> {
        input.validate()?;

        let mut instructions = self.instructions_for(agent).to_string();
        let memory = self.memory.load_as_context(conversation_id).await;
        if !memory.is_empty() {
            instructions.push_str("\n\n");
            instructions.push_str(&memory);
        }

        let history: Vec<ContextMessage> = self
            .history
            .get_conversation_messages(conversation_id)
            .await?
            .iter()
            .filter_map(history_message)
            .collect();

        debug!(
            conversation_id = %conversation_id,
            history = history.len(),
            memory_loaded = !memory.is_empty(),
            "Context assembled"
        );

        Ok(AssembledContext {
            instructions,
            history,
            user_content: input.into_blocks(),
            tools: self.registry.declarations(agent),
        })
    }
}

/// A persisted message as replayed to the engine. Tool exchanges belong to
/// the turn that made them and are not replayed; a message left empty is
/// skipped.
fn history_message(message: &Message) -> Option<ContextMessage> {
    let content: Vec<Block> = message
        .content
        .iter()
        .filter(|b| !matches!(b, ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. }))
        .cloned()
        .map(Block::Persistable)
        .collect();
    (!content.is_empty()).then(|| ContextMessage {
        role: message.role,
        content,
    })
}
