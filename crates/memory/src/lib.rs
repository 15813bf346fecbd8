//! Memory store and history gateway implementations for Grantwell.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::{InMemoryHistory, InMemoryMemory};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use grantwell_config::StorageConfig;
use grantwell_core::error::MemoryError;
use grantwell_core::{HistoryStore, MemoryStore};
use std::sync::Arc;

/// Process-scoped storage handles, created once at startup and injected
/// into the turn controller and tools.
#[derive(Clone)]
pub struct Stores {
    pub memory: Arc<dyn MemoryStore>,
    pub history: Arc<dyn HistoryStore>,
    #[cfg(feature = "sqlite")]
    sqlite: Option<SqliteStore>,
}

impl Stores {
    /// Fresh in-process stores.
    pub fn in_memory() -> Self {
        Self {
            memory: Arc::new(InMemoryMemory::new()),
            history: Arc::new(InMemoryHistory::new()),
            #[cfg(feature = "sqlite")]
            sqlite: None,
        }
    }

    /// Open the backend named in the configuration.
    pub async fn open(config: &StorageConfig) -> Result<Self, MemoryError> {
        match config.backend.as_str() {
            "memory" => Ok(Self::in_memory()),
            #[cfg(feature = "sqlite")]
            "sqlite" => {
                let store = SqliteStore::connect(&config.database_path()).await?;
                Ok(Self {
                    memory: Arc::new(store.clone()),
                    history: Arc::new(store.clone()),
                    sqlite: Some(store),
                })
            }
            other => Err(MemoryError::Storage(format!(
                "storage backend '{other}' is not available"
            ))),
        }
    }

    /// Release the connection pool, if any.
    pub async fn close(&self) {
        #[cfg(feature = "sqlite")]
        {
            if let Some(store) = &self.sqlite {
                store.close().await;
            }
        }
    }
}
