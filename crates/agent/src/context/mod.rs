//! Context assembly for one turn.
//!
//! | Part | Source | Notes |
//! |------|--------|-------|
//! | Instructions | agent type or `[agents.*]` override | memory facts appended |
//! | History | history store | tool exchanges dropped |
//! | New turn | request | attachments validated, then placed before text |
//! | Tools | capability registry | fixed per agent type |

pub mod attachment;
pub mod builder;

pub use attachment::{Attachment, TurnInput};
pub use builder::{AssembledContext, AssemblyError, ContextBuilder};
