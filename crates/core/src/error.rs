//! Error types for the Grantwell domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant; `TurnError` is the
//! taxonomy a turn can terminate with.

use thiserror::Error;

// --- Bounded context errors ---

/// Failures talking to the reasoning engine.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

#[derive(Debug, Clone, Error)]
pub enum HistoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
}

/// Errors raised by tool handlers. The dispatcher converts every one of
/// these into a failure result; they never reach the turn loop.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool backend unavailable: {0}")]
    Backend(String),
}

impl From<MemoryError> for ToolError {
    fn from(e: MemoryError) -> Self {
        ToolError::Backend(e.to_string())
    }
}

/// Malformed turn input, rejected before any network call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Unsupported attachment kind: {0}")]
    UnsupportedAttachmentKind(String),

    #[error("Unsupported media type '{media_type}' for {kind} attachment")]
    UnsupportedMediaType { kind: String, media_type: String },

    #[error("Attachment {index} has an empty payload")]
    EmptyAttachment { index: usize },

    #[error("Attachment {index} payload is not valid base64: {reason}")]
    InvalidEncoding { index: usize, reason: String },

    #[error("Turn has no content")]
    EmptyTurn,
}

/// The ways a turn can terminate unsuccessfully.
///
/// Only tool failures are recovered inside the loop; every variant here ends
/// the turn, emits a terminal `error` push event, and persists nothing.
#[derive(Debug, Clone, Error)]
pub enum TurnError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("Reasoning engine call failed: {0}")]
    Transport(#[from] ProviderError),

    #[error("Unexpected stop reason: {0}")]
    Protocol(String),

    #[error("Max loops exceeded")]
    LimitExceeded { iterations: u32 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Turn cancelled: client disconnected")]
    Cancelled,
}

impl TurnError {
    /// Stable machine-readable kind, used in push events and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::LimitExceeded { .. } => "limit_exceeded",
            Self::Storage(_) => "storage",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<HistoryError> for TurnError {
    fn from(e: HistoryError) -> Self {
        TurnError::Storage(e.to_string())
    }
}
