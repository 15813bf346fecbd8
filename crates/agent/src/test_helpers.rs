//! Shared test helpers for turn tests.

use async_trait::async_trait;
use grantwell_core::error::{HistoryError, ProviderError};
use grantwell_core::message::{Block, ContentBlock, Conversation, ConversationId, Message, Role};
use grantwell_core::provider::{EngineRequest, EngineResponse, Provider, StopReason, Usage};
use grantwell_core::{AgentType, HistoryStore};
use grantwell_memory::InMemoryHistory;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A mock engine that answers from a queue of scripted responses.
///
/// With `repeating`, the last response is served forever once the queue
/// is drained. Otherwise running out of responses panics.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<EngineResponse, ProviderError>>>,
    repeat: Option<EngineResponse>,
    requests: Mutex<Vec<EngineRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Result<EngineResponse, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(responses: Vec<EngineResponse>) -> Self {
        Self::new(responses.into_iter().map(Ok).collect())
    }

    pub fn repeating(response: EngineResponse) -> Self {
        Self {
            repeat: Some(response),
            ..Self::new(vec![])
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<EngineRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: EngineRequest) -> Result<EngineResponse, ProviderError> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            requests.len()
        };
        let next = self.responses.lock().unwrap().pop_front();
        match (next, &self.repeat) {
            (Some(response), _) => response,
            (None, Some(response)) => Ok(response.clone()),
            (None, None) => panic!("ScriptedProvider: no response for call #{call}"),
        }
    }
}

/// An engine that never answers.
pub struct HangingProvider;

#[async_trait]
impl Provider for HangingProvider {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn complete(&self, _request: EngineRequest) -> Result<EngineResponse, ProviderError> {
        std::future::pending().await
    }
}

/// An engine that records how many calls overlap.
pub struct ConcurrencyProbe {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ConcurrencyProbe {
    fn name(&self) -> &str {
        "probe"
    }

    async fn complete(&self, _request: EngineRequest) -> Result<EngineResponse, ProviderError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(text_response("done"))
    }
}

/// History whose conversations all exist but which cannot store messages.
pub struct ReadOnlyHistory;

#[async_trait]
impl HistoryStore for ReadOnlyHistory {
    fn name(&self) -> &str {
        "read-only"
    }

    async fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>, HistoryError> {
        Ok(Some(Conversation::new(
            conversation_id.clone(),
            "user-1",
            AgentType::GrantCards,
        )))
    }

    async fn create_conversation(&self, _conversation: &Conversation) -> Result<(), HistoryError> {
        Err(HistoryError::Storage("disk full".into()))
    }

    async fn get_conversation_messages(
        &self,
        _conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, HistoryError> {
        Ok(vec![])
    }

    async fn save_message(
        &self,
        _conversation_id: &ConversationId,
        _role: Role,
        _content: Vec<ContentBlock>,
    ) -> Result<Message, HistoryError> {
        Err(HistoryError::Storage("disk full".into()))
    }

    async fn save_exchange(
        &self,
        _conversation_id: &ConversationId,
        _user: Vec<ContentBlock>,
        _assistant: Vec<ContentBlock>,
    ) -> Result<(Message, Message), HistoryError> {
        Err(HistoryError::Storage("disk full".into()))
    }
}

/// History where no conversation exists and none can be created.
pub struct RejectingCreateHistory;

#[async_trait]
impl HistoryStore for RejectingCreateHistory {
    fn name(&self) -> &str {
        "rejecting-create"
    }

    async fn get_conversation(
        &self,
        _conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>, HistoryError> {
        Ok(None)
    }

    async fn create_conversation(&self, _conversation: &Conversation) -> Result<(), HistoryError> {
        Err(HistoryError::Storage("disk full".into()))
    }

    async fn get_conversation_messages(
        &self,
        _conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, HistoryError> {
        Ok(vec![])
    }

    async fn save_message(
        &self,
        conversation_id: &ConversationId,
        _role: Role,
        _content: Vec<ContentBlock>,
    ) -> Result<Message, HistoryError> {
        Err(HistoryError::ConversationNotFound(conversation_id.to_string()))
    }

    async fn save_exchange(
        &self,
        conversation_id: &ConversationId,
        _user: Vec<ContentBlock>,
        _assistant: Vec<ContentBlock>,
    ) -> Result<(Message, Message), HistoryError> {
        Err(HistoryError::ConversationNotFound(conversation_id.to_string()))
    }
}

/// In-memory history that accepts user messages but rejects any write
/// carrying an assistant reply.
pub struct RejectingReplyHistory {
    pub inner: InMemoryHistory,
}

impl RejectingReplyHistory {
    pub fn new() -> Self {
        Self {
            inner: InMemoryHistory::new(),
        }
    }
}

#[async_trait]
impl HistoryStore for RejectingReplyHistory {
    fn name(&self) -> &str {
        "rejecting-reply"
    }

    async fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>, HistoryError> {
        self.inner.get_conversation(conversation_id).await
    }

    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), HistoryError> {
        self.inner.create_conversation(conversation).await
    }

    async fn get_conversation_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, HistoryError> {
        self.inner.get_conversation_messages(conversation_id).await
    }

    async fn save_message(
        &self,
        conversation_id: &ConversationId,
        role: Role,
        content: Vec<ContentBlock>,
    ) -> Result<Message, HistoryError> {
        if role == Role::Assistant {
            return Err(HistoryError::Storage("reply rejected".into()));
        }
        self.inner.save_message(conversation_id, role, content).await
    }

    async fn save_exchange(
        &self,
        _conversation_id: &ConversationId,
        _user: Vec<ContentBlock>,
        _assistant: Vec<ContentBlock>,
    ) -> Result<(Message, Message), HistoryError> {
        Err(HistoryError::Storage("reply rejected".into()))
    }
}

pub fn response(content: Vec<Block>, stop_reason: StopReason) -> EngineResponse {
    EngineResponse {
        content,
        stop_reason,
        usage: Some(Usage {
            input_tokens: 10,
            output_tokens: 5,
        }),
        model: "mock-model".into(),
    }
}

pub fn text_response(text: &str) -> EngineResponse {
    response(vec![Block::text(text)], StopReason::EndTurn)
}

/// A `tool_use` stop requesting each `(id, name, input)` in order.
pub fn tool_response(calls: &[(&str, &str, serde_json::Value)]) -> EngineResponse {
    response(
        calls
            .iter()
            .map(|(id, name, input)| {
                Block::Persistable(ContentBlock::ToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: input.clone(),
                })
            })
            .collect(),
        StopReason::ToolUse,
    )
}
