//! Tool dispatcher: resolve, pre-check, and invoke one tool call.
//!
//! `execute` never fails. Unknown or disallowed names, missing required
//! fields, handler errors, and handler panics all come back as a
//! `{success:false, error}` outcome so the turn loop can hand them to the
//! engine and keep going. Each call invokes the handler at most once.

use futures::FutureExt;
use grantwell_core::tool::{ToolContext, ToolOutcome};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::registry::CapabilityRegistry;

#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<CapabilityRegistry>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> ToolOutcome {
        let Some(tool) = self.registry.resolve(ctx.agent_type, name) else {
            warn!(tool = name, agent = %ctx.agent_type, "Tool not available to agent");
            return ToolOutcome::failure(format!("Unknown tool: {name}"));
        };

        let declaration = tool.to_declaration();
        let missing: Vec<&str> = declaration
            .required_fields()
            .into_iter()
            .filter(|field| input.get(*field).is_none_or(|v| v.is_null()))
            .collect();
        if !missing.is_empty() {
            return ToolOutcome::failure(format!(
                "Missing required field(s) for {name}: {}",
                missing.join(", ")
            ));
        }

        debug!(tool = name, conversation_id = %ctx.conversation_id, "Executing tool");
        let call = AssertUnwindSafe(tool.execute(input, ctx)).catch_unwind();
        match call.await {
            Ok(Ok(result)) => ToolOutcome::ok(result),
            Ok(Err(e)) => {
                warn!(tool = name, error = %e, "Tool failed");
                ToolOutcome::failure(format!("Tool {name} failed: {e}"))
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                warn!(tool = name, panic = %message, "Tool panicked");
                ToolOutcome::failure(format!("Tool {name} failed: {message}"))
            }
        }
    }
}
