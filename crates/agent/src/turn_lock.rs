//! Per-conversation turn serialisation.
//!
//! Each conversation id maps to a `Semaphore(1)`. A turn holds the permit
//! from before context assembly until its terminal event, so memory and
//! history writes of two turns on the same conversation never interleave.
//! Different conversations never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;

use grantwell_core::ConversationId;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct ConversationLocks {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for ConversationLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive use of `conversation_id`. Released on drop.
    pub async fn acquire(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<OwnedSemaphorePermit, LocksClosed> {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(conversation_id.as_str().to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        sem.acquire_owned().await.map_err(|_| LocksClosed)
    }

    pub fn conversation_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Forget conversations nobody holds or waits on.
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, sem| sem.available_permits() == 0 || Arc::strong_count(sem) > 1);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("conversation lock was closed")]
pub struct LocksClosed;
