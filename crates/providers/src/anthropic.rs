//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly.
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System instructions as top-level field
//! - Native content blocks: text, base64 image/document, `tool_use` / `tool_result`
//! - Streaming via SSE (see [`crate::sse`])
//! - Extended thinking, with signatures replayed inside a turn

use async_trait::async_trait;
use futures::StreamExt;
use grantwell_core::error::ProviderError;
use grantwell_core::message::{Block, ContentBlock, ContextMessage, TransientBlock};
use grantwell_core::provider::{
    ChunkReceiver, EngineRequest, EngineResponse, StopReason, Usage,
};
use grantwell_core::tool::ToolDeclaration;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::sse::SseDecoder;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    /// Whole-request bound for non-streaming calls. Streams are bounded per
    /// read instead, so a long but live response is never cut off.
    request_timeout: Duration,
    /// Budget tokens for extended thinking; `None` disables it.
    thinking_budget: Option<u32>,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, timeout_secs: u64) -> Result<Self, ProviderError> {
        let request_timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(request_timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client,
            request_timeout,
            thinking_budget: None,
        })
    }

    /// Custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl AsRef<str>) -> Self {
        self.base_url = base_url.as_ref().trim_end_matches('/').to_string();
        self
    }

    pub fn with_extended_thinking(mut self, budget_tokens: u32) -> Self {
        self.thinking_budget = Some(budget_tokens);
        self
    }

    /// Convert context messages to Anthropic content-block messages.
    fn to_api_messages(messages: &[ContextMessage]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.as_str().to_string(),
                content: m.content.iter().filter_map(Self::to_api_block).collect(),
            })
            .filter(|m| !m.content.is_empty())
            .collect()
    }

    fn to_api_block(block: &Block) -> Option<ApiBlock> {
        Some(match block {
            Block::Persistable(ContentBlock::Text { text }) => ApiBlock::Text { text: text.clone() },
            Block::Persistable(ContentBlock::Image { media_type, data }) => ApiBlock::Image {
                source: ApiSource::base64(media_type, data),
            },
            Block::Persistable(ContentBlock::Document {
                media_type,
                data,
                name,
            }) => ApiBlock::Document {
                source: ApiSource::base64(media_type, data),
                title: name.clone(),
            },
            Block::Persistable(ContentBlock::ToolUse { id, name, input }) => ApiBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            },
            Block::Persistable(ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            }) => ApiBlock::ToolResult {
                tool_use_id: tool_use_id.clone(),
                content: match content {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
                is_error: *is_error,
            },
            // The API rejects thinking blocks it cannot verify.
            Block::Transient(TransientBlock::Thinking {
                thinking,
                signature: Some(signature),
            }) => ApiBlock::Thinking {
                thinking: thinking.clone(),
                signature: signature.clone(),
            },
            Block::Transient(TransientBlock::Thinking { signature: None, .. }) => return None,
        })
    }

    fn to_api_tools(tools: &[ToolDeclaration]) -> Vec<ApiTool> {
        tools
            .iter()
            .map(|t| ApiTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect()
    }

    fn build_body(&self, request: &EngineRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "max_tokens": request.max_tokens,
        });

        if !request.instructions.is_empty() {
            body["system"] = serde_json::json!(request.instructions);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }
        if !request.stop_sequences.is_empty() {
            body["stop_sequences"] = serde_json::json!(request.stop_sequences);
        }
        if stream {
            body["stream"] = serde_json::json!(true);
        }

        match self.thinking_budget {
            // Extended thinking requires the default temperature.
            Some(budget) => {
                body["thinking"] = serde_json::json!({
                    "type": "enabled",
                    "budget_tokens": budget
                });
            }
            None => {
                body["temperature"] = serde_json::json!(request.temperature);
            }
        }

        body
    }

    fn request(&self, body: &serde_json::Value, stream: bool) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/messages", self.base_url);
        let builder = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(body);
        if stream {
            builder.header("Accept", "text/event-stream")
        } else {
            builder.timeout(self.request_timeout)
        }
    }

    async fn send(
        &self,
        body: &serde_json::Value,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self.request(body, stream).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        check_status(response).await
    }

    /// Convert an Anthropic API response to an engine response.
    fn to_engine_response(resp: ApiResponse) -> Result<EngineResponse, ProviderError> {
        let stop_reason = resp
            .stop_reason
            .as_deref()
            .map(StopReason::from)
            .ok_or_else(|| ProviderError::MalformedResponse("missing stop_reason".into()))?;

        let content = resp
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(Block::text(text)),
                ResponseBlock::ToolUse { id, name, input } => {
                    Some(Block::Persistable(ContentBlock::ToolUse { id, name, input }))
                }
                ResponseBlock::Thinking {
                    thinking,
                    signature,
                } => Some(Block::Transient(TransientBlock::Thinking {
                    thinking,
                    signature,
                })),
                ResponseBlock::Unknown => None,
            })
            .collect();

        Ok(EngineResponse {
            content,
            stop_reason,
            usage: Some(Usage {
                input_tokens: resp.usage.input_tokens,
                output_tokens: resp.usage.output_tokens,
            }),
            model: resp.model,
        })
    }
}

/// Map non-success HTTP statuses to provider errors.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status().as_u16();
    match status {
        200..=299 => Ok(response),
        429 => {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            Err(ProviderError::RateLimited { retry_after_secs })
        }
        401 | 403 => Err(ProviderError::AuthenticationFailed(
            "Invalid Anthropic API key".into(),
        )),
        _ => {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Anthropic API error");
            Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            })
        }
    }
}

#[async_trait]
impl grantwell_core::Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: EngineRequest) -> Result<EngineResponse, ProviderError> {
        let body = self.build_body(&request, false);
        debug!(provider = "anthropic", model = %request.model, "Sending completion request");

        let response = self.send(&body, false).await?;
        let api_resp: ApiResponse = response.json().await.map_err(|e| {
            ProviderError::MalformedResponse(format!("Failed to parse Anthropic response: {e}"))
        })?;

        Self::to_engine_response(api_resp)
    }

    async fn stream(&self, request: EngineRequest) -> Result<ChunkReceiver, ProviderError> {
        let body = self.build_body(&request, true);
        debug!(provider = "anthropic", model = %request.model, "Sending streaming request");

        let response = self.send(&body, true).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();

            while let Some(next) = byte_stream.next().await {
                let bytes = match next {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                match decoder.feed(&bytes) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            // Receiver gone: drop the response to abort the request.
                            if tx.send(Ok(chunk)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }

                if decoder.is_finished() {
                    return;
                }
            }

            if let Err(e) = decoder.finish() {
                let _ = tx.send(Err(e)).await;
            }
        });

        Ok(rx)
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: Vec<ApiBlock>,
}

#[derive(Debug, Serialize)]
struct ApiSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

impl ApiSource {
    fn base64(media_type: &str, data: &str) -> Self {
        Self {
            kind: "base64",
            media_type: media_type.to_string(),
            data: data.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text {
        text: String,
    },
    Image {
        source: ApiSource,
    },
    Document {
        source: ApiSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    Thinking {
        thinking: String,
        signature: String,
    },
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    content: Vec<ResponseBlock>,
    usage: ApiUsage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
    /// `redacted_thinking` and anything newer.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}
