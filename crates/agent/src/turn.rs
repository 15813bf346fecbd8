//! The turn controller: the bounded reasoning loop behind every chat turn.
//!
//! One turn runs:
//!
//! 1. **Connect**: emit `connected` with the conversation id
//! 2. **Lock**: wait for exclusive use of the conversation (configurable)
//! 3. **Assemble**: validate input, load memory and history, once
//! 4. **Call the engine**: stream its output to the client
//! 5. **On `tool_use`**: dispatch every request in order, fold the results
//!    back into the context, and go to 4 while under the iteration cap
//! 6. **On any other stop**: persist (or not) and emit one terminal event
//!
//! Only tool failures are recovered inside the loop. Everything else ends
//! the turn without persisting anything.

use chrono::Utc;
use grantwell_config::AppConfig;
use grantwell_core::error::TurnError;
use grantwell_core::event::{DomainEvent, EventBus};
use grantwell_core::message::{
    Block, ContentBlock, ContextMessage, ConversationId, retain_persistable,
};
use grantwell_core::provider::{EngineRequest, EngineResponse, Provider, StopReason, Usage};
use grantwell_core::tool::ToolContext;
use grantwell_core::{AgentType, HistoryStore, MemoryStore};
use grantwell_tools::{CapabilityRegistry, RegistryError, ToolDispatcher};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::{AssemblyError, ContextBuilder, TurnInput};
use crate::emitter::StreamEmitter;
use crate::stream_event::{PushEvent, PushEventKind};
use crate::turn_lock::ConversationLocks;

/// Engine and loop parameters for every turn.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_iterations: u32,
    pub serialize_per_conversation: bool,
    pub cancel_on_disconnect: bool,
    /// Push-channel capacity callers should use.
    pub event_buffer: usize,
}

impl TurnSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_iterations: config.turn.max_iterations,
            serialize_per_conversation: config.turn.serialize_per_conversation,
            cancel_on_disconnect: config.turn.cancel_on_disconnect,
            event_buffer: config.turn.event_buffer,
        }
    }
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// One inbound turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub agent_type: AgentType,
    /// Existing conversation to continue; a new one is started when absent.
    pub conversation_id: Option<ConversationId>,
    pub user_id: String,
    pub input: TurnInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Completed,
    /// Cut off at `max_tokens`; still a success.
    Truncated,
    StoppedAtSequence,
    Faulted,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Completed => "completed",
            TurnState::Truncated => "truncated",
            TurnState::StoppedAtSequence => "stopped_at_sequence",
            TurnState::Faulted => "faulted",
        }
    }
}

/// What the caller gets back when the turn ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub success: bool,
    pub conversation_id: String,
    pub state: TurnState,
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub persisted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl From<AssemblyError> for TurnError {
    fn from(e: AssemblyError) -> Self {
        match e {
            AssemblyError::Validation(v) => TurnError::Validation(v),
            AssemblyError::History(h) => h.into(),
        }
    }
}

/// A turn that reached a non-faulted terminal state.
struct Ended {
    state: TurnState,
    response: Option<String>,
    persisted: bool,
}

/// Counters that survive a fault, for the terminal event.
#[derive(Default)]
struct Progress {
    iterations: u32,
    usage: Option<Usage>,
}

impl Progress {
    fn add_usage(&mut self, usage: Option<Usage>) {
        if let Some(u) = usage {
            let total = self.usage.get_or_insert_with(Usage::default);
            total.input_tokens += u.input_tokens;
            total.output_tokens += u.output_tokens;
        }
    }
}

pub struct TurnController {
    provider: Arc<dyn Provider>,
    history: Arc<dyn HistoryStore>,
    context: ContextBuilder,
    dispatcher: ToolDispatcher,
    locks: ConversationLocks,
    events: Arc<EventBus>,
    settings: TurnSettings,
}

impl TurnController {
    pub fn new(
        provider: Arc<dyn Provider>,
        memory: Arc<dyn MemoryStore>,
        history: Arc<dyn HistoryStore>,
        registry: Arc<CapabilityRegistry>,
        events: Arc<EventBus>,
        settings: TurnSettings,
    ) -> Self {
        Self {
            provider,
            context: ContextBuilder::new(memory, history.clone(), registry.clone()),
            history,
            dispatcher: ToolDispatcher::new(registry),
            locks: ConversationLocks::new(),
            events,
            settings,
        }
    }

    /// Controller with the built-in tools and the configured instructions.
    pub fn from_config(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        memory: Arc<dyn MemoryStore>,
        history: Arc<dyn HistoryStore>,
        events: Arc<EventBus>,
    ) -> Result<Self, RegistryError> {
        let registry = Arc::new(CapabilityRegistry::builtin(memory.clone())?);
        let mut controller = Self::new(
            provider,
            memory,
            history,
            registry,
            events,
            TurnSettings::from_config(config),
        );
        for agent in AgentType::ALL {
            controller = controller.with_instructions(agent, config.instructions_for(agent));
        }
        Ok(controller)
    }

    pub fn with_instructions(mut self, agent: AgentType, text: impl Into<String>) -> Self {
        self.context = self.context.with_instructions(agent, text);
        self
    }

    pub fn settings(&self) -> &TurnSettings {
        &self.settings
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        self.dispatcher.registry()
    }

    /// Run one turn, streaming push events to `tx`.
    pub async fn run(&self, request: TurnRequest, tx: mpsc::Sender<PushEvent>) -> TurnOutcome {
        self.run_with_cancel(request, tx, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), but also stops when `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        request: TurnRequest,
        tx: mpsc::Sender<PushEvent>,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let conversation_id = request.conversation_id.clone().unwrap_or_default();
        let mut emitter = StreamEmitter::new(Uuid::new_v4().to_string(), tx);
        let _watch = self
            .settings
            .cancel_on_disconnect
            .then(|| emitter.cancel_on_disconnect(cancel.clone()));

        info!(
            conversation_id = %conversation_id,
            agent = %request.agent_type,
            session_id = emitter.session_id(),
            "Turn started"
        );
        emitter
            .emit(PushEventKind::Connected {
                conversation_id: conversation_id.to_string(),
                agent_type: request.agent_type,
            })
            .await;
        self.events.publish(DomainEvent::TurnStarted {
            conversation_id: conversation_id.to_string(),
            agent_type: request.agent_type,
            user_id: request.user_id.clone(),
            timestamp: Utc::now(),
        });

        let mut progress = Progress::default();
        let result = self
            .drive(request, &conversation_id, &mut emitter, &cancel, &mut progress)
            .await;
        self.locks.prune_idle();

        let outcome = self.finish(result, &conversation_id, &mut emitter, progress).await;
        self.events.publish(DomainEvent::TurnFinished {
            conversation_id: outcome.conversation_id.clone(),
            state: outcome.state.as_str().to_string(),
            iterations: outcome.iterations,
            persisted: outcome.persisted,
            error: outcome.error.clone(),
            timestamp: Utc::now(),
        });
        outcome
    }

    async fn drive(
        &self,
        request: TurnRequest,
        conversation_id: &ConversationId,
        emitter: &mut StreamEmitter,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<Ended, TurnError> {
        let TurnRequest {
            agent_type,
            user_id,
            input,
            ..
        } = request;

        let _permit = if self.settings.serialize_per_conversation {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                // Semaphores are never closed, so a failed acquire only
                // happens on shutdown.
                permit = self.locks.acquire(conversation_id) => {
                    Some(permit.map_err(|_| TurnError::Cancelled)?)
                }
            }
        } else {
            None
        };

        let assembled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            built = self.context.build(agent_type, conversation_id, input) => built?,
        };

        // The client holds this id from `connected`, so it must resolve
        // even if nothing ends up persisted.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            created = self.history.ensure_conversation(conversation_id, &user_id, agent_type) => {
                created?;
            }
        }

        let tool_ctx = ToolContext {
            conversation_id: conversation_id.clone(),
            user_id,
            agent_type,
        };
        let max_iterations = self.settings.max_iterations;
        let mut messages = assembled.messages();

        loop {
            progress.iterations += 1;
            let iteration = progress.iterations;
            debug!(conversation_id = %conversation_id, iteration, "Calling reasoning engine");
            emitter
                .emit(PushEventKind::Iteration {
                    iteration,
                    max_iterations,
                })
                .await;

            let engine_request = EngineRequest {
                model: self.settings.model.clone(),
                instructions: assembled.instructions.clone(),
                messages: messages.clone(),
                tools: assembled.tools.clone(),
                max_tokens: self.settings.max_tokens,
                temperature: self.settings.temperature,
                stop_sequences: Vec::new(),
            };
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                response = self.call_engine(engine_request, emitter) => response?,
            };
            progress.add_usage(response.usage);

            let state = match response.stop_reason {
                StopReason::EndTurn => TurnState::Completed,
                StopReason::StopSequence => TurnState::StoppedAtSequence,
                StopReason::MaxTokens => TurnState::Truncated,
                StopReason::ToolUse => {
                    let results = self
                        .run_tools(&response, &tool_ctx, emitter, cancel)
                        .await?;
                    messages.push(ContextMessage::assistant(response.content));
                    messages.push(ContextMessage::user(results));

                    if iteration >= max_iterations {
                        warn!(
                            conversation_id = %conversation_id,
                            iterations = iteration,
                            "Iteration cap reached with tools still requested"
                        );
                        return Err(TurnError::LimitExceeded {
                            iterations: iteration,
                        });
                    }
                    continue;
                }
                StopReason::Other(reason) => return Err(TurnError::Protocol(reason)),
            };

            let content = retain_persistable(response.content);
            if content.is_empty() {
                debug!(conversation_id = %conversation_id, "Nothing to persist");
                return Ok(Ended {
                    state,
                    response: None,
                    persisted: false,
                });
            }

            let text = content
                .iter()
                .filter_map(ContentBlock::as_text)
                .collect::<Vec<_>>()
                .join("\n");
            self.persist(conversation_id, assembled.user_content.clone(), content)
                .await?;
            return Ok(Ended {
                state,
                response: Some(text),
                persisted: true,
            });
        }
    }

    async fn call_engine(
        &self,
        request: EngineRequest,
        emitter: &mut StreamEmitter,
    ) -> Result<EngineResponse, TurnError> {
        let rx = self.provider.stream(request).await?;
        Ok(emitter.relay(rx).await?)
    }

    /// Dispatch every tool request of `response` in order and return the
    /// matching `tool_result` blocks in the same order.
    async fn run_tools(
        &self,
        response: &EngineResponse,
        ctx: &ToolContext,
        emitter: &mut StreamEmitter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Block>, TurnError> {
        let calls = response.tool_uses();
        if calls.is_empty() {
            return Err(TurnError::Protocol(
                "tool_use without any tool request".into(),
            ));
        }

        let mut results = Vec::with_capacity(calls.len());
        for (id, name, input) in calls {
            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                outcome = self.dispatcher.execute(name, input.clone(), ctx) => outcome,
            };
            let duration_ms = started.elapsed().as_millis() as u64;
            debug!(tool = name, success = outcome.success, duration_ms, "Tool dispatched");

            self.events.publish(DomainEvent::ToolExecuted {
                conversation_id: ctx.conversation_id.to_string(),
                tool_name: name.to_string(),
                success: outcome.success,
                duration_ms,
                timestamp: Utc::now(),
            });
            emitter
                .emit(PushEventKind::ToolResult {
                    tool_use_id: id.to_string(),
                    name: name.to_string(),
                    success: outcome.success,
                    result: outcome.result.clone(),
                    error: outcome.error.clone(),
                })
                .await;

            results.push(Block::Persistable(ContentBlock::ToolResult {
                tool_use_id: id.to_string(),
                content: outcome.to_value(),
                is_error: !outcome.success,
            }));
        }
        Ok(results)
    }

    async fn persist(
        &self,
        conversation_id: &ConversationId,
        user_content: Vec<ContentBlock>,
        assistant_content: Vec<ContentBlock>,
    ) -> Result<(), TurnError> {
        self.history
            .save_exchange(conversation_id, user_content, assistant_content)
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        result: Result<Ended, TurnError>,
        conversation_id: &ConversationId,
        emitter: &mut StreamEmitter,
        progress: Progress,
    ) -> TurnOutcome {
        let Progress { iterations, usage } = progress;
        match result {
            Ok(ended) => {
                info!(
                    conversation_id = %conversation_id,
                    state = ended.state.as_str(),
                    iterations,
                    persisted = ended.persisted,
                    "Turn finished"
                );
                let terminal = if ended.state == TurnState::Truncated {
                    PushEventKind::Warning {
                        conversation_id: conversation_id.to_string(),
                        message: "Response truncated at max_tokens".into(),
                        iterations,
                        persisted: ended.persisted,
                    }
                } else {
                    PushEventKind::Completion {
                        conversation_id: conversation_id.to_string(),
                        state: ended.state.as_str().to_string(),
                        iterations,
                        persisted: ended.persisted,
                        usage,
                    }
                };
                emitter.finish(terminal).await;
                TurnOutcome {
                    success: true,
                    conversation_id: conversation_id.to_string(),
                    state: ended.state,
                    iterations,
                    response: ended.response,
                    error: None,
                    error_kind: None,
                    persisted: ended.persisted,
                    usage,
                }
            }
            Err(e) => {
                warn!(
                    conversation_id = %conversation_id,
                    kind = e.kind(),
                    iterations,
                    error = %e,
                    "Turn faulted"
                );
                emitter
                    .finish(PushEventKind::Error {
                        conversation_id: conversation_id.to_string(),
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                        iterations,
                    })
                    .await;
                TurnOutcome {
                    success: false,
                    conversation_id: conversation_id.to_string(),
                    state: TurnState::Faulted,
                    iterations,
                    response: None,
                    error: Some(e.to_string()),
                    error_kind: Some(e.kind().to_string()),
                    persisted: false,
                    usage,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Attachment;
    use crate::test_helpers::*;
    use grantwell_core::error::ProviderError;
    use grantwell_core::message::{Role, TransientBlock};
    use grantwell_memory::{InMemoryHistory, InMemoryMemory};
    use std::time::Duration;

    struct Harness {
        controller: Arc<TurnController>,
        memory: Arc<dyn MemoryStore>,
        history: Arc<dyn HistoryStore>,
        events: Arc<EventBus>,
    }

    fn harness_with(provider: Arc<dyn Provider>, history: Arc<dyn HistoryStore>) -> Harness {
        let memory: Arc<dyn MemoryStore> = Arc::new(InMemoryMemory::new());
        let registry = Arc::new(CapabilityRegistry::builtin(memory.clone()).unwrap());
        let events = Arc::new(EventBus::default());
        let controller = TurnController::new(
            provider,
            memory.clone(),
            history.clone(),
            registry,
            events.clone(),
            TurnSettings::default(),
        );
        Harness {
            controller: Arc::new(controller),
            memory,
            history,
            events,
        }
    }

    fn harness(provider: Arc<dyn Provider>) -> Harness {
        harness_with(provider, Arc::new(InMemoryHistory::new()))
    }

    fn request(conv: &str, input: TurnInput) -> TurnRequest {
        TurnRequest {
            agent_type: AgentType::GrantCards,
            conversation_id: Some(ConversationId::from(conv)),
            user_id: "user-1".into(),
            input,
        }
    }

    async fn run(h: &Harness, request: TurnRequest) -> (TurnOutcome, Vec<PushEvent>) {
        let (tx, mut rx) = mpsc::channel(256);
        let outcome = h.controller.run(request, tx).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (outcome, events)
    }

    fn kinds(events: &[PushEvent]) -> Vec<&'static str> {
        events.iter().map(PushEvent::event_type).collect()
    }

    async fn persisted(h: &Harness, conv: &str) -> Vec<grantwell_core::Message> {
        h.history
            .get_conversation_messages(&ConversationId::from(conv))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn plain_text_turn_persists_one_exchange() {
        let provider = Arc::new(ScriptedProvider::replies(vec![text_response("Hello!")]));
        let h = harness(provider.clone());

        let (outcome, events) = run(&h, request("c1", TurnInput::text("Hi"))).await;

        assert!(outcome.success);
        assert_eq!(outcome.state, TurnState::Completed);
        assert_eq!(outcome.response.as_deref(), Some("Hello!"));
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.persisted);

        let messages = persisted(&h, "c1").await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].text(), "Hi");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].text(), "Hello!");

        let kinds = kinds(&events);
        assert_eq!(kinds.first(), Some(&"connected"));
        assert_eq!(kinds.last(), Some(&"completion"));
        assert_eq!(kinds.iter().filter(|k| **k == "connected").count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == "completion").count(), 1);
        assert_eq!(events.iter().map(|e| &e.session_id).collect::<std::collections::HashSet<_>>().len(), 1);
    }

    #[tokio::test]
    async fn memory_store_tool_round_trip() {
        let provider = Arc::new(ScriptedProvider::replies(vec![
            tool_response(&[(
                "toolu_1",
                "memory_store",
                serde_json::json!({"key": "company_name", "value": "Acme"}),
            )]),
            text_response("Noted, Acme."),
        ]));
        let h = harness(provider.clone());

        let (outcome, events) = run(&h, request("c1", TurnInput::text("We are Acme"))).await;

        assert!(outcome.success);
        assert_eq!(outcome.iterations, 2);
        let recalled = h
            .memory
            .recall(&ConversationId::from("c1"), "company_name")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recalled.value, "Acme");

        let tool_result = events
            .iter()
            .find_map(|e| match &e.kind {
                PushEventKind::ToolResult { success, .. } => Some(*success),
                _ => None,
            })
            .unwrap();
        assert!(tool_result);

        let second = &provider.requests()[1];
        let last = second.messages.last().unwrap();
        assert_eq!(last.role, Role::User);
        match &last.content[0] {
            Block::Persistable(ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            }) => {
                assert_eq!(tool_use_id, "toolu_1");
                assert_eq!(content["success"], true);
                assert!(!is_error);
            }
            other => panic!("expected tool_result, got {other:?}"),
        }

        // Only the opening user message and the final reply are persisted.
        let messages = persisted(&h, "c1").await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text(), "Noted, Acme.");
    }

    #[tokio::test]
    async fn endless_tool_requests_hit_the_cap() {
        let provider = Arc::new(ScriptedProvider::repeating(tool_response(&[(
            "toolu_x",
            "memory_list",
            serde_json::json!({}),
        )])));
        let h = harness(provider.clone());

        let (outcome, events) = run(&h, request("c1", TurnInput::text("loop"))).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Max loops exceeded"));
        assert_eq!(outcome.error_kind.as_deref(), Some("limit_exceeded"));
        assert_eq!(outcome.iterations, 20);
        assert_eq!(provider.call_count(), 20);
        assert!(persisted(&h, "c1").await.is_empty());

        let iterations = events
            .iter()
            .filter_map(|e| match e.kind {
                PushEventKind::Iteration { iteration, .. } => Some(iteration),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(iterations, (1..=20).collect::<Vec<_>>());
        assert!(matches!(
            &events.last().unwrap().kind,
            PushEventKind::Error { kind, .. } if kind == "limit_exceeded"
        ));
    }

    #[tokio::test]
    async fn unknown_tool_result_is_fed_back() {
        let provider = Arc::new(ScriptedProvider::replies(vec![
            tool_response(&[("toolu_1", "nonexistent_tool", serde_json::json!({}))]),
            text_response("That tool does not exist."),
        ]));
        let h = harness(provider.clone());

        let (outcome, events) = run(&h, request("c1", TurnInput::text("try it"))).await;

        assert!(outcome.success);
        assert_eq!(provider.call_count(), 2);
        assert!(events.iter().any(|e| matches!(
            &e.kind,
            PushEventKind::ToolResult { success: false, error: Some(msg), .. }
                if msg == "Unknown tool: nonexistent_tool"
        )));

        let second = &provider.requests()[1];
        assert_eq!(
            second.messages.last().unwrap().content,
            vec![Block::Persistable(ContentBlock::ToolResult {
                tool_use_id: "toolu_1".into(),
                content: serde_json::json!({
                    "success": false,
                    "error": "Unknown tool: nonexistent_tool"
                }),
                is_error: true,
            })]
        );
    }

    #[tokio::test]
    async fn tool_results_keep_request_order() {
        let provider = Arc::new(ScriptedProvider::replies(vec![
            tool_response(&[
                ("t1", "memory_store", serde_json::json!({"key": "a", "value": "1"})),
                ("t2", "memory_store", serde_json::json!({"key": "b", "value": "2"})),
                ("t3", "memory_recall", serde_json::json!({"key": "a"})),
            ]),
            text_response("done"),
        ]));
        let h = harness(provider.clone());

        let (_, events) = run(&h, request("c1", TurnInput::text("go"))).await;

        let emitted: Vec<_> = events
            .iter()
            .filter_map(|e| match &e.kind {
                PushEventKind::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(emitted, vec!["t1", "t2", "t3"]);

        let second = &provider.requests()[1];
        let ids: Vec<_> = second
            .messages
            .last()
            .unwrap()
            .content
            .iter()
            .filter_map(|b| match b {
                Block::Persistable(ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                }) => Some((tool_use_id.as_str(), content.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0].0, "t1");
        assert_eq!(ids[2].0, "t3");
        // The recall ran after both stores.
        assert_eq!(ids[2].1["result"]["entry"]["value"], "1");
    }

    #[tokio::test]
    async fn thinking_only_reply_is_not_persisted() {
        let provider = Arc::new(ScriptedProvider::replies(vec![response(
            vec![Block::thinking("nothing to say")],
            StopReason::EndTurn,
        )]));
        let h = harness(provider);

        let (outcome, events) = run(&h, request("c1", TurnInput::text("hm"))).await;

        assert!(outcome.success);
        assert!(!outcome.persisted);
        assert!(outcome.response.is_none());
        assert!(persisted(&h, "c1").await.is_empty());
        assert!(matches!(
            events.last().unwrap().kind,
            PushEventKind::Completion { persisted: false, .. }
        ));
        // The id handed out in `connected` still resolves.
        assert!(
            h.history
                .get_conversation(&ConversationId::from("c1"))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn thinking_is_dropped_before_persistence() {
        let provider = Arc::new(ScriptedProvider::replies(vec![response(
            vec![Block::thinking("private"), Block::text("public")],
            StopReason::EndTurn,
        )]));
        let h = harness(provider);

        run(&h, request("c1", TurnInput::text("hi"))).await;

        let messages = persisted(&h, "c1").await;
        assert_eq!(messages[1].content, vec![ContentBlock::text("public")]);
    }

    #[tokio::test]
    async fn thinking_is_replayed_within_the_turn() {
        let thinking = Block::Transient(TransientBlock::Thinking {
            thinking: "store the name".into(),
            signature: Some("sig".into()),
        });
        let mut first = tool_response(&[(
            "t1",
            "memory_store",
            serde_json::json!({"key": "k", "value": "v"}),
        )]);
        first.content.insert(0, thinking.clone());
        let provider = Arc::new(ScriptedProvider::replies(vec![first, text_response("ok")]));
        let h = harness(provider.clone());

        run(&h, request("c1", TurnInput::text("hi"))).await;

        let second = &provider.requests()[1];
        let assistant = &second.messages[second.messages.len() - 2];
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(assistant.content[0], thinking);
    }

    #[tokio::test]
    async fn max_tokens_persists_and_warns() {
        let provider = Arc::new(ScriptedProvider::replies(vec![response(
            vec![Block::text("The eligibility criteria are")],
            StopReason::MaxTokens,
        )]));
        let h = harness(provider);

        let (outcome, events) = run(&h, request("c1", TurnInput::text("list"))).await;

        assert!(outcome.success);
        assert_eq!(outcome.state, TurnState::Truncated);
        assert_eq!(persisted(&h, "c1").await.len(), 2);
        assert_eq!(kinds(&events).last(), Some(&"warning"));
        assert!(!kinds(&events).contains(&"completion"));
    }

    #[tokio::test]
    async fn stop_sequence_persists_like_end_turn() {
        let provider = Arc::new(ScriptedProvider::replies(vec![response(
            vec![Block::text("Card ready")],
            StopReason::StopSequence,
        )]));
        let h = harness(provider);

        let (outcome, events) = run(&h, request("c1", TurnInput::text("go"))).await;

        assert_eq!(outcome.state, TurnState::StoppedAtSequence);
        assert!(outcome.persisted);
        assert_eq!(persisted(&h, "c1").await.len(), 2);
        assert!(matches!(
            &events.last().unwrap().kind,
            PushEventKind::Completion { state, .. } if state == "stopped_at_sequence"
        ));
    }

    #[tokio::test]
    async fn unknown_stop_reason_is_a_protocol_fault() {
        let provider = Arc::new(ScriptedProvider::replies(vec![response(
            vec![Block::text("partial")],
            StopReason::Other("pause_turn".into()),
        )]));
        let h = harness(provider);

        let (outcome, _) = run(&h, request("c1", TurnInput::text("go"))).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_kind.as_deref(), Some("protocol"));
        assert!(outcome.error.unwrap().contains("pause_turn"));
        assert!(persisted(&h, "c1").await.is_empty());
    }

    #[tokio::test]
    async fn tool_use_without_requests_is_a_protocol_fault() {
        let provider = Arc::new(ScriptedProvider::replies(vec![response(
            vec![Block::text("calling a tool")],
            StopReason::ToolUse,
        )]));
        let h = harness(provider);

        let (outcome, _) = run(&h, request("c1", TurnInput::text("go"))).await;
        assert_eq!(outcome.error_kind.as_deref(), Some("protocol"));
    }

    #[tokio::test]
    async fn transport_error_aborts_without_retry() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::Network(
            "connection refused".into(),
        ))]));
        let h = harness(provider.clone());

        let (outcome, events) = run(&h, request("c1", TurnInput::text("hi"))).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_kind.as_deref(), Some("transport"));
        assert_eq!(provider.call_count(), 1);
        assert!(persisted(&h, "c1").await.is_empty());
        assert_eq!(kinds(&events), vec!["connected", "iteration", "error"]);
    }

    #[tokio::test]
    async fn invalid_attachment_never_reaches_the_engine() {
        let provider = Arc::new(ScriptedProvider::replies(vec![]));
        let h = harness(provider.clone());
        let input = TurnInput {
            text: "see file".into(),
            attachments: vec![Attachment {
                kind: "spreadsheet".into(),
                media_type: "application/vnd.ms-excel".into(),
                data: "AAAA".into(),
                name: None,
            }],
        };

        let (outcome, events) = run(&h, request("c1", input)).await;

        assert_eq!(outcome.error_kind.as_deref(), Some("validation"));
        assert_eq!(outcome.iterations, 0);
        assert_eq!(provider.call_count(), 0);
        assert_eq!(kinds(&events), vec!["connected", "error"]);
    }

    #[tokio::test]
    async fn persistence_failure_is_a_storage_fault() {
        let provider = Arc::new(ScriptedProvider::replies(vec![text_response("hello")]));
        let h = harness_with(provider, Arc::new(ReadOnlyHistory));

        let (outcome, events) = run(&h, request("c1", TurnInput::text("hi"))).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_kind.as_deref(), Some("storage"));
        assert!(!outcome.persisted);
        assert_eq!(kinds(&events).last(), Some(&"error"));
    }

    #[tokio::test]
    async fn rejected_reply_leaves_no_orphan_user_message() {
        let provider = Arc::new(ScriptedProvider::replies(vec![text_response("hello")]));
        let h = harness_with(provider, Arc::new(RejectingReplyHistory::new()));

        let (outcome, events) = run(&h, request("c1", TurnInput::text("hi"))).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_kind.as_deref(), Some("storage"));
        assert!(!outcome.persisted);
        assert_eq!(kinds(&events).last(), Some(&"error"));
        assert!(persisted(&h, "c1").await.is_empty());
    }

    #[tokio::test]
    async fn conversation_create_failure_stops_before_the_engine() {
        let provider = Arc::new(ScriptedProvider::replies(vec![]));
        let h = harness_with(provider.clone(), Arc::new(RejectingCreateHistory));

        let (outcome, events) = run(&h, request("c1", TurnInput::text("hi"))).await;

        assert_eq!(outcome.error_kind.as_deref(), Some("storage"));
        assert_eq!(provider.call_count(), 0);
        assert_eq!(kinds(&events), vec!["connected", "error"]);
    }

    #[tokio::test]
    async fn second_turn_sees_the_first() {
        let provider = Arc::new(ScriptedProvider::replies(vec![
            text_response("first reply"),
            text_response("second reply"),
        ]));
        let h = harness(provider.clone());

        run(&h, request("c1", TurnInput::text("one"))).await;
        run(&h, request("c1", TurnInput::text("two"))).await;

        let second = &provider.requests()[1];
        assert_eq!(second.messages.len(), 3);
        assert_eq!(second.messages[1].content, vec![Block::text("first reply")]);
        assert_eq!(persisted(&h, "c1").await.len(), 4);
    }

    #[tokio::test]
    async fn missing_conversation_id_starts_a_new_conversation() {
        let provider = Arc::new(ScriptedProvider::replies(vec![text_response("welcome")]));
        let h = harness(provider);
        let mut req = request("unused", TurnInput::text("hi"));
        req.conversation_id = None;

        let (outcome, events) = run(&h, req).await;

        let PushEventKind::Connected {
            conversation_id, ..
        } = &events[0].kind
        else {
            panic!("first event must be connected");
        };
        assert_eq!(conversation_id, &outcome.conversation_id);
        let conversation = h
            .history
            .get_conversation(&ConversationId::from(conversation_id.as_str()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.user_id, "user-1");
        assert_eq!(conversation.agent_type, AgentType::GrantCards);
    }

    #[tokio::test]
    async fn disconnect_cancels_the_turn() {
        let h = harness(Arc::new(HangingProvider));
        let (tx, mut rx) = mpsc::channel(16);
        let controller = h.controller.clone();
        let turn = tokio::spawn(async move {
            controller
                .run(request("c1", TurnInput::text("hi")), tx)
                .await
        });

        assert_eq!(rx.recv().await.unwrap().event_type(), "connected");
        assert_eq!(rx.recv().await.unwrap().event_type(), "iteration");
        drop(rx);

        let outcome = tokio::time::timeout(Duration::from_secs(2), turn)
            .await
            .expect("turn should stop after disconnect")
            .unwrap();
        assert_eq!(outcome.error_kind.as_deref(), Some("cancelled"));
        assert!(persisted(&h, "c1").await.is_empty());
    }

    #[tokio::test]
    async fn turns_on_one_conversation_do_not_overlap() {
        let probe = Arc::new(ConcurrencyProbe::new());
        let h = harness(probe.clone());

        tokio::join!(
            run(&h, request("same", TurnInput::text("a"))),
            run(&h, request("same", TurnInput::text("b"))),
        );
        assert_eq!(probe.peak(), 1);
        assert_eq!(persisted(&h, "same").await.len(), 4);
    }

    #[tokio::test]
    async fn different_conversations_run_concurrently() {
        let probe = Arc::new(ConcurrencyProbe::new());
        let h = harness(probe.clone());

        tokio::join!(
            run(&h, request("a", TurnInput::text("a"))),
            run(&h, request("b", TurnInput::text("b"))),
        );
        assert_eq!(probe.peak(), 2);
    }

    #[tokio::test]
    async fn domain_events_bracket_the_turn() {
        let provider = Arc::new(ScriptedProvider::replies(vec![
            tool_response(&[("t1", "memory_list", serde_json::json!({}))]),
            text_response("nothing yet"),
        ]));
        let h = harness(provider);
        let mut bus = h.events.subscribe();

        run(&h, request("c1", TurnInput::text("what do you know?"))).await;

        let mut seen = Vec::new();
        while let Ok(event) = bus.try_recv() {
            seen.push(match event.as_ref() {
                DomainEvent::TurnStarted { .. } => "started",
                DomainEvent::ToolExecuted { .. } => "tool",
                DomainEvent::TurnFinished { state, .. } => {
                    assert_eq!(state, "completed");
                    "finished"
                }
            });
        }
        assert_eq!(seen, vec!["started", "tool", "finished"]);
    }

    #[test]
    fn outcome_serializes_camel_case() {
        let outcome = TurnOutcome {
            success: false,
            conversation_id: "c1".into(),
            state: TurnState::Faulted,
            iterations: 20,
            response: None,
            error: Some("Max loops exceeded".into()),
            error_kind: Some("limit_exceeded".into()),
            persisted: false,
            usage: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["conversationId"], "c1");
        assert_eq!(json["state"], "faulted");
        assert_eq!(json["errorKind"], "limit_exceeded");
        assert!(json.get("response").is_none());
    }
}
