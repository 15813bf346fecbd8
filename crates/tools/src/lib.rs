//! Built-in tools, the capability registry, and the tool dispatcher.
//!
//! Tools give the engine the ability to act on behalf of the applicant.
//! Which agent may call which tool is fixed by the capability map in
//! `grantwell_core::agent`; the registry resolves it once at startup and
//! the dispatcher enforces it per call.

pub mod dispatcher;
pub mod memory;
pub mod registry;

pub use dispatcher::ToolDispatcher;
pub use memory::{MemoryListTool, MemoryRecallTool, MemoryStoreTool};
pub use registry::{CapabilityRegistry, RegistryError};
