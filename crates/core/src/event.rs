//! Domain event system: decoupled observation of turn activity.
//!
//! The turn controller publishes events as turns start, run tools, and
//! finish. Subscribers (the gateway's event log, tests) react without the
//! controller knowing about them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::agent::AgentType;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A turn was accepted and context assembly began
    TurnStarted {
        conversation_id: String,
        agent_type: AgentType,
        user_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A tool was dispatched
    ToolExecuted {
        conversation_id: String,
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A turn reached a terminal state
    TurnFinished {
        conversation_id: String,
        state: String,
        iterations: u32,
        persisted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// The `event` tag this variant serialises with.
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::TurnStarted { .. } => "turn_started",
            DomainEvent::ToolExecuted { .. } => "tool_executed",
            DomainEvent::TurnFinished { .. } => "turn_finished",
        }
    }
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
