//! The agent turn loop for Grantwell.
//!
//! A turn follows a **Assemble → Call → Dispatch** cycle:
//!
//! 1. **Assemble** instructions, memory, history, and the new user content
//! 2. **Call** the reasoning engine, relaying its output as push events
//! 3. **Dispatch** any requested tools and fold the results back in
//!
//! The loop ends on the first stop that is not a tool request, or when the
//! iteration cap is reached.

pub mod context;
pub mod emitter;
pub mod stream_event;
pub mod turn;
pub mod turn_lock;

#[cfg(test)]
mod test_helpers;

pub use context::{AssembledContext, AssemblyError, Attachment, ContextBuilder, TurnInput};
pub use emitter::StreamEmitter;
pub use stream_event::{PushEvent, PushEventKind};
pub use turn::{TurnController, TurnOutcome, TurnRequest, TurnSettings, TurnState};
pub use turn_lock::{ConversationLocks, LocksClosed};
