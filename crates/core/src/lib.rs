//! # Grantwell Core
//!
//! Domain types, traits, and error definitions for the Grantwell assistant runtime.
//! This crate has **zero framework dependencies**: it defines the domain model
//! that all other crates implement against.
//!
//! Every external collaborator of the turn loop (reasoning engine, tool handlers,
//! memory store, history gateway) is a trait here. Implementations live in their
//! respective crates, so tests can swap in scripted or in-memory versions.

pub mod agent;
pub mod error;
pub mod event;
pub mod history;
pub mod memory;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use agent::AgentType;
pub use event::{DomainEvent, EventBus};
pub use history::HistoryStore;
pub use memory::{MemoryEntry, MemoryStore};
pub use message::{
    Block, ContentBlock, ContextMessage, Conversation, ConversationId, Message, Role,
    TransientBlock,
};
pub use provider::{EngineRequest, EngineResponse, Provider, StopReason, StreamChunk};
pub use tool::{Tool, ToolContext, ToolDeclaration, ToolOutcome};
