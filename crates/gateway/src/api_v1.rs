//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `GET    /v1/agents`                         : Agent types and their tools
//! - `POST   /v1/agents/{agent_type}/chat`       : Run a turn, SSE stream of push events
//! - `GET    /v1/conversations/{id}/messages`    : Persisted history
//! - `GET    /v1/conversations/{id}/memory`      : Remembered facts
//! - `DELETE /v1/conversations/{id}/memory`      : Forget all facts
//! - `GET    /v1/events`                         : SSE stream of domain events

use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use grantwell_agent::{Attachment, TurnController, TurnInput, TurnRequest};
use grantwell_core::agent::CAPABILITY_MAP_VERSION;
use grantwell_core::message::{ContentBlock, Role};
use grantwell_core::{AgentType, ConversationId, HistoryStore, MemoryStore};

/// Header carrying the caller's identity. Authentication happens upstream.
pub const USER_ID_HEADER: &str = "x-user-id";
const ANONYMOUS_USER: &str = "anonymous";

// ── State ─────────────────────────────────────────────────────────────────

/// Shared state for the v1 API.
pub struct ApiV1State {
    pub controller: Arc<TurnController>,
    pub memory: Arc<dyn MemoryStore>,
    pub history: Arc<dyn HistoryStore>,
    /// Turns still running. Drained before storage is closed.
    pub turns: TaskTracker,
}

pub type SharedApiState = Arc<ApiV1State>;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/agents", get(list_agents_handler))
        .route("/agents/{agent_type}/chat", post(chat_stream_handler))
        .route("/conversations/{id}/messages", get(list_messages_handler))
        .route(
            "/conversations/{id}/memory",
            get(list_memory_handler).delete(clear_memory_handler),
        )
        .route("/events", get(event_stream_handler))
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    /// Existing conversation ID (omit to start a new one).
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentDto {
    agent_type: AgentType,
    tools: Vec<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentListResponse {
    capability_version: u32,
    agents: Vec<AgentDto>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDto {
    id: String,
    role: Role,
    content: Vec<ContentBlock>,
    created_at: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    conversation_id: String,
    agent_type: AgentType,
    messages: Vec<MessageDto>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemoryDto {
    key: String,
    value: String,
    updated_at: String,
}

#[derive(Serialize, Deserialize)]
struct MemoryListResponse {
    entries: Vec<MemoryDto>,
    count: usize,
}

#[derive(Serialize, Deserialize)]
struct ClearMemoryResponse {
    cleared: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

fn storage_error(e: impl std::fmt::Display) -> ApiError {
    error!(error = %e, "Storage request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn list_agents_handler(State(state): State<SharedApiState>) -> Json<AgentListResponse> {
    let registry = state.controller.registry();
    Json(AgentListResponse {
        capability_version: CAPABILITY_MAP_VERSION,
        agents: AgentType::ALL
            .into_iter()
            .map(|agent_type| AgentDto {
                agent_type,
                tools: registry
                    .declarations(agent_type)
                    .into_iter()
                    .map(|d| d.name)
                    .collect(),
            })
            .collect(),
    })
}

/// `POST /v1/agents/{agent_type}/chat`: run one turn, streamed as SSE.
///
/// The turn runs on its own task. Closing the response stream drops the
/// receiver, which cancels the turn when `turn.cancel_on_disconnect` is on.
async fn chat_stream_handler(
    State(state): State<SharedApiState>,
    Path(agent_type): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<ChatRequest>,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let agent_type: AgentType = agent_type
        .parse()
        .map_err(|e: String| api_error(StatusCode::NOT_FOUND, e))?;
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string();

    info!(agent = %agent_type, user = %user_id, "Chat turn requested");

    let request = TurnRequest {
        agent_type,
        conversation_id: payload
            .conversation_id
            .filter(|id| !id.is_empty())
            .map(ConversationId),
        user_id,
        input: TurnInput {
            text: payload.message,
            attachments: payload.attachments,
        },
    };

    let (tx, rx) = mpsc::channel(state.controller.settings().event_buffer);
    let controller = state.controller.clone();
    state.turns.spawn(async move {
        controller.run(request, tx).await;
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().event(event.event_type()).data(data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn list_messages_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<Json<MessageListResponse>, ApiError> {
    let conversation_id = ConversationId(id);
    let conversation = state
        .history
        .get_conversation(&conversation_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Conversation not found"))?;
    let messages = state
        .history
        .get_conversation_messages(&conversation_id)
        .await
        .map_err(storage_error)?;

    Ok(Json(MessageListResponse {
        conversation_id: conversation.id.to_string(),
        agent_type: conversation.agent_type,
        messages: messages
            .into_iter()
            .map(|m| MessageDto {
                id: m.id,
                role: m.role,
                content: m.content,
                created_at: m.created_at.to_rfc3339(),
            })
            .collect(),
    }))
}

async fn list_memory_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<Json<MemoryListResponse>, ApiError> {
    let entries = state
        .memory
        .list(&ConversationId(id))
        .await
        .map_err(storage_error)?;
    let count = entries.len();
    Ok(Json(MemoryListResponse {
        entries: entries
            .into_iter()
            .map(|e| MemoryDto {
                key: e.key,
                value: e.value,
                updated_at: e.updated_at.to_rfc3339(),
            })
            .collect(),
        count,
    }))
}

async fn clear_memory_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<Json<ClearMemoryResponse>, ApiError> {
    let cleared = state
        .memory
        .clear(&ConversationId(id))
        .await
        .map_err(storage_error)?;
    Ok(Json(ClearMemoryResponse { cleared }))
}

// ── SSE Event Log ─────────────────────────────────────────────────────────

/// `GET /v1/events`: SSE stream of domain events (turns, tool calls).
async fn event_stream_handler(
    State(state): State<SharedApiState>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.controller.events().subscribe();
    let stream = BroadcastStream::new(rx)
        .filter_map(|result| result.ok())
        .map(|event| {
            let data = serde_json::to_string(event.as_ref()).unwrap_or_default();
            Ok(SseEvent::default().event(event.name()).data(data))
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
