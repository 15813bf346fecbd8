//! Decoder for the Anthropic Messages streaming protocol.
//!
//! Bytes go in, [`StreamChunk`]s come out. Tool input arrives as partial
//! JSON fragments and is only surfaced once its content block stops, so
//! every `ToolUse` chunk carries a complete input object.

use grantwell_core::error::ProviderError;
use grantwell_core::provider::{StopReason, StreamChunk, Usage};
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, Default)]
struct PendingTool {
    id: String,
    name: String,
    json: String,
}

/// Incremental SSE decoder. One per response.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    tools: HashMap<usize, PendingTool>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `message_stop` has been decoded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed raw bytes; returns every chunk completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<StreamChunk>, ProviderError> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            out.extend(self.feed_line(line)?);
        }

        Ok(out)
    }

    /// Signal end of the byte stream.
    pub fn finish(&mut self) -> Result<(), ProviderError> {
        if self.finished {
            Ok(())
        } else {
            Err(ProviderError::StreamInterrupted(
                "stream ended before message_stop".into(),
            ))
        }
    }

    fn feed_line(&mut self, line: &str) -> Result<Vec<StreamChunk>, ProviderError> {
        // Event names are repeated in the JSON `type`, so only data lines matter.
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(Vec::new());
        };
        let data = data.trim();
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let event: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                trace!(error = %e, data = %data, "Ignoring unparseable SSE data");
                return Ok(Vec::new());
            }
        };

        self.handle_event(&event)
    }

    fn handle_event(
        &mut self,
        event: &serde_json::Value,
    ) -> Result<Vec<StreamChunk>, ProviderError> {
        let index = event["index"].as_u64().unwrap_or(0) as usize;
        let mut out = Vec::new();

        match event["type"].as_str().unwrap_or("") {
            "message_start" => {
                if let Some(n) = event["message"]["usage"]["input_tokens"].as_u64() {
                    self.usage.input_tokens = n as u32;
                }
            }
            "content_block_start" => {
                let block = &event["content_block"];
                match block["type"].as_str().unwrap_or("") {
                    "tool_use" => {
                        self.tools.insert(
                            index,
                            PendingTool {
                                id: block["id"].as_str().unwrap_or("").to_string(),
                                name: block["name"].as_str().unwrap_or("").to_string(),
                                json: String::new(),
                            },
                        );
                    }
                    "text" => {
                        if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty()) {
                            out.push(StreamChunk::TextDelta {
                                index,
                                text: text.to_string(),
                            });
                        }
                    }
                    "thinking" => {
                        if let Some(thinking) =
                            block["thinking"].as_str().filter(|t| !t.is_empty())
                        {
                            out.push(StreamChunk::ThinkingDelta {
                                index,
                                thinking: thinking.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta["text"].as_str() {
                            out.push(StreamChunk::TextDelta {
                                index,
                                text: text.to_string(),
                            });
                        }
                    }
                    "thinking_delta" => {
                        if let Some(thinking) = delta["thinking"].as_str() {
                            out.push(StreamChunk::ThinkingDelta {
                                index,
                                thinking: thinking.to_string(),
                            });
                        }
                    }
                    "signature_delta" => {
                        if let Some(signature) = delta["signature"].as_str() {
                            out.push(StreamChunk::SignatureDelta {
                                index,
                                signature: signature.to_string(),
                            });
                        }
                    }
                    "input_json_delta" => {
                        if let (Some(tool), Some(partial)) =
                            (self.tools.get_mut(&index), delta["partial_json"].as_str())
                        {
                            tool.json.push_str(partial);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(tool) = self.tools.remove(&index) {
                    let input = if tool.json.trim().is_empty() {
                        serde_json::json!({})
                    } else {
                        serde_json::from_str(&tool.json).map_err(|e| {
                            ProviderError::MalformedResponse(format!(
                                "tool '{}' input is not valid JSON: {e}",
                                tool.name
                            ))
                        })?
                    };
                    out.push(StreamChunk::ToolUse {
                        index,
                        id: tool.id,
                        name: tool.name,
                        input,
                    });
                }
            }
            "message_delta" => {
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(StopReason::from(reason));
                }
                if let Some(n) = event["usage"]["output_tokens"].as_u64() {
                    self.usage.output_tokens = n as u32;
                }
            }
            "message_stop" => {
                let stop_reason = self.stop_reason.take().ok_or_else(|| {
                    ProviderError::MalformedResponse("message_stop without stop_reason".into())
                })?;
                self.finished = true;
                out.push(StreamChunk::Stop {
                    stop_reason,
                    usage: Some(self.usage),
                });
            }
            "error" => {
                let message = event["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown streaming error");
                return Err(ProviderError::StreamInterrupted(message.to_string()));
            }
            _ => {}
        }

        Ok(out)
    }
}
