//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what let the reasoning engine act: remember facts, look up
//! records, generate documents. Each one declares a JSON schema and is
//! invoked through the dispatcher, which owns the non-throwing contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::AgentType;
use crate::error::ToolError;
use crate::message::ConversationId;

/// Static description of a tool, sent to the reasoning engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON Schema object with `properties` and an optional `required` array.
    pub input_schema: serde_json::Value,
}

impl ToolDeclaration {
    /// The `required` subset of the input schema.
    pub fn required_fields(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|fields| fields.iter().filter_map(|f| f.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Who is calling and on behalf of which conversation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub conversation_id: ConversationId,
    pub user_id: String,
    pub agent_type: AgentType,
}

/// Normalised result of one dispatch.
///
/// Serialises as `{"success":true,"result":...}` or
/// `{"success":false,"error":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({ "success": self.success })
        })
    }
}

/// The core Tool trait.
///
/// Handlers may be invoked with partially-validated input: the dispatcher
/// only checks that required fields are present.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "memory_store").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the engine).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given input.
    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<serde_json::Value, ToolError>;

    fn to_declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters_schema(),
        }
    }
}
