//! Agent types and their fixed capability sets.
//!
//! Which agent type may invoke which tools is a closed, versioned mapping.
//! It is resolved once at startup into a capability registry and never
//! mutated while serving requests.

use serde::{Deserialize, Serialize};

/// Bump when any agent's capability set changes.
pub const CAPABILITY_MAP_VERSION: u32 = 1;

/// Names of the built-in memory tools.
pub mod tool_names {
    pub const MEMORY_STORE: &str = "memory_store";
    pub const MEMORY_RECALL: &str = "memory_recall";
    pub const MEMORY_LIST: &str = "memory_list";
}

const MEMORY_TOOLS: &[&str] = &[
    tool_names::MEMORY_STORE,
    tool_names::MEMORY_RECALL,
    tool_names::MEMORY_LIST,
];

/// The assistant personas served by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    /// Drafts grant application cards from program guidelines.
    GrantCards,
    /// Writes Employer Training Grant applications.
    EtgWriter,
    /// Prepares CanExport expense claims.
    CanexportClaims,
}

impl AgentType {
    pub const ALL: [AgentType; 3] = [
        AgentType::GrantCards,
        AgentType::EtgWriter,
        AgentType::CanexportClaims,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::GrantCards => "grant-cards",
            AgentType::EtgWriter => "etg-writer",
            AgentType::CanexportClaims => "canexport-claims",
        }
    }

    /// Tool names this agent type may invoke, in declaration order.
    pub fn capabilities(&self) -> &'static [&'static str] {
        match self {
            AgentType::GrantCards | AgentType::EtgWriter | AgentType::CanexportClaims => {
                MEMORY_TOOLS
            }
        }
    }

    /// Built-in system instructions. May be overridden by configuration.
    pub fn default_instructions(&self) -> &'static str {
        match self {
            AgentType::GrantCards => {
                "You are a grant research assistant. Turn program guidelines and the \
                 applicant's details into concise grant cards: eligibility, funding amounts, \
                 deadlines, and required documents. Use memory_store to remember facts about \
                 the applicant's organisation so you do not have to ask twice."
            }
            AgentType::EtgWriter => {
                "You are an Employer Training Grant writer. Help the applicant describe the \
                 training, the trainees, costs, and expected outcomes in the funder's language. \
                 Remember confirmed details with memory_store and check memory before asking."
            }
            AgentType::CanexportClaims => {
                "You are a CanExport claims assistant. Review expenses the applicant provides, \
                 flag ineligible items, and prepare claim line items with supporting \
                 documentation notes. Record confirmed project facts with memory_store."
            }
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentType::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown agent type '{s}'"))
    }
}
