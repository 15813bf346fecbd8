//! Provider trait: the abstraction over the reasoning engine.
//!
//! A Provider accepts instructions, an ordered message list, and the declared
//! tool schemas, and answers with content blocks terminated by exactly one
//! [`StopReason`], either in one piece or as a stream of [`StreamChunk`]s.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::{Block, ContentBlock, ContextMessage, TransientBlock};
use crate::tool::ToolDeclaration;

/// One request to the reasoning engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRequest {
    /// The model to use (e.g., "claude-sonnet-4-20250514")
    pub model: String,

    /// System instructions, including any serialized memory.
    pub instructions: String,

    /// Ordered conversation messages, oldest first.
    pub messages: Vec<ContextMessage>,

    /// Tools the engine may request.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclaration>,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}

/// Why the engine stopped producing output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    /// Anything the loop does not recognise.
    Other(String),
}

impl StopReason {
    pub fn as_str(&self) -> &str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
            StopReason::Other(s) => s,
        }
    }
}

impl From<&str> for StopReason {
    fn from(s: &str) -> Self {
        match s {
            "end_turn" => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            other => StopReason::Other(other.to_string()),
        }
    }
}

impl From<String> for StopReason {
    fn from(s: String) -> Self {
        StopReason::from(s.as_str())
    }
}

impl From<StopReason> for String {
    fn from(r: StopReason) -> Self {
        r.as_str().to_string()
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A complete response from the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    /// Produced blocks in the order the engine emitted them.
    pub content: Vec<Block>,

    pub stop_reason: StopReason,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Which model actually responded.
    #[serde(default)]
    pub model: String,
}

impl EngineResponse {
    /// `tool_use` blocks in order of appearance, as (id, name, input).
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                Block::Persistable(ContentBlock::ToolUse { id, name, input }) => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// One increment of a streamed response. `index` is the position of the
/// content block the increment belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    TextDelta {
        index: usize,
        text: String,
    },
    ThinkingDelta {
        index: usize,
        thinking: String,
    },
    SignatureDelta {
        index: usize,
        signature: String,
    },
    /// A fully-assembled tool request.
    ToolUse {
        index: usize,
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// Terminal chunk.
    Stop {
        stop_reason: StopReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
}

/// Receiver half of a streamed engine response.
pub type ChunkReceiver =
    tokio::sync::mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>;

/// Split a complete response into the chunks a streaming engine would
/// have produced for it.
pub fn response_to_chunks(response: EngineResponse) -> Vec<StreamChunk> {
    let mut chunks = Vec::with_capacity(response.content.len() + 1);
    for (index, block) in response.content.into_iter().enumerate() {
        match block {
            Block::Persistable(ContentBlock::Text { text }) => {
                chunks.push(StreamChunk::TextDelta { index, text });
            }
            Block::Persistable(ContentBlock::ToolUse { id, name, input }) => {
                chunks.push(StreamChunk::ToolUse {
                    index,
                    id,
                    name,
                    input,
                });
            }
            Block::Transient(TransientBlock::Thinking {
                thinking,
                signature,
            }) => {
                chunks.push(StreamChunk::ThinkingDelta { index, thinking });
                if let Some(signature) = signature {
                    chunks.push(StreamChunk::SignatureDelta { index, signature });
                }
            }
            // Engines do not emit media or tool results.
            Block::Persistable(_) => {}
        }
    }
    chunks.push(StreamChunk::Stop {
        stop_reason: response.stop_reason,
        usage: response.usage,
    });
    chunks
}

/// The core Provider trait.
///
/// The turn loop calls `stream()` without knowing which backend is in use.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "anthropic").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(
        &self,
        request: EngineRequest,
    ) -> std::result::Result<EngineResponse, ProviderError>;

    /// Send a request and get a stream of response chunks.
    ///
    /// Default implementation calls `complete()` and replays the result.
    async fn stream(
        &self,
        request: EngineRequest,
    ) -> std::result::Result<ChunkReceiver, ProviderError> {
        let response = self.complete(request).await?;
        let chunks = response_to_chunks(response);
        let (tx, rx) = tokio::sync::mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            let _ = tx.send(Ok(chunk)).await;
        }
        Ok(rx)
    }
}
