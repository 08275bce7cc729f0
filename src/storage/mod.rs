//! Key-value persistence for conversation data
//!
//! Everything the engine persists is a JSON string stored under a string
//! key. Backends only need to provide atomic-per-key reads and writes.

mod memory;
mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(#[from] sqlx::Error),

    #[error("Malformed value under key {key}: {source}")]
    Read {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Local key-value persistence
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value` under `key`, replacing any previous value
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// All keys starting with `prefix`, in lexical order
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}
