//! Memory tools: let the engine remember facts about the applicant.
//!
//! All three operate on the conversation from the [`ToolContext`], never on
//! an id supplied in the input, so one conversation cannot read another's
//! memory.

use async_trait::async_trait;
use grantwell_core::agent::tool_names;
use grantwell_core::error::ToolError;
use grantwell_core::memory::{MemoryEntry, MemoryStore};
use grantwell_core::tool::{Tool, ToolContext};
use std::sync::Arc;

fn string_arg<'a>(input: &'a serde_json::Value, field: &str) -> Result<&'a str, ToolError> {
    input[field]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments(format!("'{field}' must be a string")))
}

fn entry_json(entry: &MemoryEntry) -> serde_json::Value {
    serde_json::json!({
        "key": entry.key,
        "value": entry.value,
        "updated_at": entry.updated_at.to_rfc3339(),
    })
}

/// `memory_store`: upsert a key/value fact.
pub struct MemoryStoreTool {
    store: Arc<dyn MemoryStore>,
}

impl MemoryStoreTool {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for MemoryStoreTool {
    fn name(&self) -> &str {
        tool_names::MEMORY_STORE
    }

    fn description(&self) -> &str {
        "Remember a fact about the applicant or their project for the rest of this \
         conversation. Storing an existing key replaces its value."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "key": {
                    "type": "string",
                    "description": "Short snake_case name for the fact, e.g. company_name"
                },
                "value": {
                    "type": "string",
                    "description": "The fact to remember"
                }
            },
            "required": ["key", "value"]
        })
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let key = string_arg(&input, "key")?.trim();
        if key.is_empty() {
            return Err(ToolError::InvalidArguments("'key' must not be empty".into()));
        }
        // Numbers and booleans are remembered in their JSON form.
        let value = match &input["value"] {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let entry = self.store.store(&ctx.conversation_id, key, &value).await?;
        Ok(serde_json::json!({ "stored": true, "key": entry.key }))
    }
}

/// `memory_recall`: look one fact up by key.
pub struct MemoryRecallTool {
    store: Arc<dyn MemoryStore>,
}

impl MemoryRecallTool {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for MemoryRecallTool {
    fn name(&self) -> &str {
        tool_names::MEMORY_RECALL
    }

    fn description(&self) -> &str {
        "Recall a previously remembered fact by its key."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "key": { "type": "string", "description": "Key used when the fact was stored" }
            },
            "required": ["key"]
        })
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let key = string_arg(&input, "key")?.trim();
        match self.store.recall(&ctx.conversation_id, key).await? {
            Some(entry) => Ok(serde_json::json!({ "found": true, "entry": entry_json(&entry) })),
            None => Ok(serde_json::json!({ "found": false, "key": key })),
        }
    }
}

/// `memory_list`: everything remembered in this conversation.
pub struct MemoryListTool {
    store: Arc<dyn MemoryStore>,
}

impl MemoryListTool {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for MemoryListTool {
    fn name(&self) -> &str {
        tool_names::MEMORY_LIST
    }

    fn description(&self) -> &str {
        "List every fact remembered in this conversation."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    async fn execute(
        &self,
        _input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let entries = self.store.list(&ctx.conversation_id).await?;
        Ok(serde_json::json!({
            "count": entries.len(),
            "entries": entries.iter().map(entry_json).collect::<Vec<_>>(),
        }))
    }
}
