//! Streaming emitter: relays engine output to the push channel while
//! accumulating the same content into one [`EngineResponse`].
//!
//! Delivery is best-effort: once the receiving side is gone, events are
//! dropped but accumulation continues. When a cancellation token is
//! attached, the first failed delivery (or the receiver closing) cancels it.

use grantwell_core::error::ProviderError;
use grantwell_core::message::{Block, ContentBlock, TransientBlock};
use grantwell_core::provider::{ChunkReceiver, EngineResponse, StreamChunk};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::stream_event::{PushEvent, PushEventKind};

/// A block being assembled from stream increments.
enum Partial {
    Text(String),
    Thinking {
        thinking: String,
        signature: Option<String>,
    },
    Done(Block),
}

pub struct StreamEmitter {
    session_id: String,
    tx: mpsc::Sender<PushEvent>,
    cancel: Option<CancellationToken>,
    closed: bool,
    terminal_sent: bool,
}

impl StreamEmitter {
    pub fn new(session_id: impl Into<String>, tx: mpsc::Sender<PushEvent>) -> Self {
        Self {
            session_id: session_id.into(),
            tx,
            cancel: None,
            closed: false,
            terminal_sent: false,
        }
    }

    /// Cancel `token` as soon as the receiver goes away.
    ///
    /// Spawns a watcher that lives until the returned guard is dropped.
    pub fn cancel_on_disconnect(&mut self, token: CancellationToken) -> DropGuard {
        let finished = CancellationToken::new();
        let tx = self.tx.clone();
        let watched = token.clone();
        let stop = finished.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {
                    debug!("Push channel closed by peer, cancelling turn");
                    watched.cancel();
                }
                _ = stop.cancelled() => {}
                _ = watched.cancelled() => {}
            }
        });
        self.cancel = Some(token);
        finished.drop_guard()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// True once a send has failed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send a non-terminal event.
    pub async fn emit(&mut self, kind: PushEventKind) {
        debug_assert!(!kind.is_terminal(), "use finish() for terminal events");
        if self.terminal_sent {
            warn!(event = kind.event_type(), "Event after terminal dropped");
            return;
        }
        self.send(kind).await;
    }

    /// Send the single terminal event. Later calls are ignored.
    pub async fn finish(&mut self, kind: PushEventKind) {
        if self.terminal_sent {
            warn!(event = kind.event_type(), "Second terminal event dropped");
            return;
        }
        self.terminal_sent = true;
        self.send(kind).await;
    }

    async fn send(&mut self, kind: PushEventKind) {
        if self.closed {
            return;
        }
        let event = PushEvent {
            session_id: self.session_id.clone(),
            kind,
        };
        if self.tx.send(event).await.is_err() {
            debug!(session_id = %self.session_id, "Push channel closed, continuing without delivery");
            self.closed = true;
            if let Some(token) = &self.cancel {
                token.cancel();
            }
        }
    }

    /// Forward a streamed engine response and return it fully assembled.
    ///
    /// Blocks keep the position the engine gave them. A stream that ends
    /// without a stop chunk is reported as interrupted.
    pub async fn relay(&mut self, mut rx: ChunkReceiver) -> Result<EngineResponse, ProviderError> {
        let mut blocks: BTreeMap<usize, Partial> = BTreeMap::new();

        while let Some(chunk) = rx.recv().await {
            match chunk? {
                StreamChunk::TextDelta { index, text } => {
                    match blocks.entry(index).or_insert_with(|| Partial::Text(String::new())) {
                        Partial::Text(buf) => buf.push_str(&text),
                        _ => return Err(mixed_block(index)),
                    }
                    self.emit(PushEventKind::TextDelta { index, text }).await;
                }
                StreamChunk::ThinkingDelta { index, thinking } => {
                    match blocks.entry(index).or_insert_with(|| Partial::Thinking {
                        thinking: String::new(),
                        signature: None,
                    }) {
                        Partial::Thinking { thinking: buf, .. } => buf.push_str(&thinking),
                        _ => return Err(mixed_block(index)),
                    }
                    self.emit(PushEventKind::ThinkingDelta { index, thinking }).await;
                }
                StreamChunk::SignatureDelta { index, signature } => {
                    match blocks.entry(index).or_insert_with(|| Partial::Thinking {
                        thinking: String::new(),
                        signature: None,
                    }) {
                        Partial::Thinking { signature: sig, .. } => {
                            sig.get_or_insert_with(String::new).push_str(&signature)
                        }
                        _ => return Err(mixed_block(index)),
                    }
                }
                StreamChunk::ToolUse {
                    index,
                    id,
                    name,
                    input,
                } => {
                    self.emit(PushEventKind::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    })
                    .await;
                    blocks.insert(
                        index,
                        Partial::Done(Block::Persistable(ContentBlock::ToolUse { id, name, input })),
                    );
                }
                StreamChunk::Stop { stop_reason, usage } => {
                    let content = blocks
                        .into_values()
                        .map(|partial| match partial {
                            Partial::Text(text) => Block::text(text),
                            Partial::Thinking {
                                thinking,
                                signature,
                            } => Block::Transient(TransientBlock::Thinking {
                                thinking,
                                signature,
                            }),
                            Partial::Done(block) => block,
                        })
                        .collect();
                    return Ok(EngineResponse {
                        content,
                        stop_reason,
                        usage,
                        model: String::new(),
                    });
                }
            }
        }

        Err(ProviderError::StreamInterrupted(
            "engine stream ended without a stop reason".into(),
        ))
    }
}

fn mixed_block(index: usize) -> ProviderError {
    ProviderError::MalformedResponse(format!("content block {index} changed type mid-stream"))
}
