//! Capability registry: which agent type may call which tool.
//!
//! Built once at startup from [`AgentType::capabilities`]. Every name in the
//! capability map must resolve to a registered tool, otherwise the build
//! fails before the server accepts any request. The registry is immutable
//! afterwards and shared behind an `Arc`.

use grantwell_core::agent::CAPABILITY_MAP_VERSION;
use grantwell_core::memory::MemoryStore;
use grantwell_core::tool::{Tool, ToolDeclaration};
use grantwell_core::AgentType;
use std::collections::HashMap;
use std::sync::Arc;

use crate::memory::{MemoryListTool, MemoryRecallTool, MemoryStoreTool};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Agent '{agent}' declares tool '{tool}' but no such tool is registered")]
    MissingTool { agent: AgentType, tool: String },

    #[error("Tool '{0}' registered twice")]
    DuplicateTool(String),
}

pub struct CapabilityRegistry {
    by_agent: HashMap<AgentType, Vec<Arc<dyn Tool>>>,
    version: u32,
}

impl CapabilityRegistry {
    /// Resolve the capability map against `tools`.
    pub fn build(tools: Vec<Arc<dyn Tool>>) -> Result<Self, RegistryError> {
        let mut by_name: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        for tool in tools {
            let name = tool.name().to_string();
            if by_name.insert(name.clone(), tool).is_some() {
                return Err(RegistryError::DuplicateTool(name));
            }
        }

        let mut by_agent = HashMap::new();
        for agent in AgentType::ALL {
            let resolved = agent
                .capabilities()
                .iter()
                .map(|name| {
                    by_name
                        .get(*name)
                        .cloned()
                        .ok_or_else(|| RegistryError::MissingTool {
                            agent,
                            tool: name.to_string(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            by_agent.insert(agent, resolved);
        }

        tracing::debug!(version = CAPABILITY_MAP_VERSION, "Capability registry built");
        Ok(Self {
            by_agent,
            version: CAPABILITY_MAP_VERSION,
        })
    }

    /// Registry with the built-in tools, backed by `memory`.
    pub fn builtin(memory: Arc<dyn MemoryStore>) -> Result<Self, RegistryError> {
        Self::build(vec![
            Arc::new(MemoryStoreTool::new(memory.clone())),
            Arc::new(MemoryRecallTool::new(memory.clone())),
            Arc::new(MemoryListTool::new(memory)),
        ])
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// The tool `name`, if `agent` is allowed to call it.
    pub fn resolve(&self, agent: AgentType, name: &str) -> Option<&Arc<dyn Tool>> {
        self.by_agent
            .get(&agent)
            .and_then(|tools| tools.iter().find(|t| t.name() == name))
    }

    /// Declarations sent to the engine for `agent`, in capability order.
    pub fn declarations(&self, agent: AgentType) -> Vec<ToolDeclaration> {
        self.by_agent
            .get(&agent)
            .map(|tools| tools.iter().map(|t| t.to_declaration()).collect())
            .unwrap_or_default()
    }
}
