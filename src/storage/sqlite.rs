//! Key-value storage on SQLite
//!
//! Provides durable local persistence for conversation logs and the index.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::{KeyValueStore, StorageError};

/// SQLite-backed key-value store
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at the given path
    pub async fn new(db_path: &Path) -> Result<Self, StorageError> {
        // Create parent directories if they don't exist
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create an in-memory store
    pub async fn new_in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(value,)| value))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // substr comparison avoids LIKE treating `_` in the prefix as a wildcard
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT key FROM kv
            WHERE substr(key, 1, length(?1)) = ?1
            ORDER BY key ASC
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(key,)| key).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        let store = SqliteStore::new_in_memory().await.unwrap();

        assert!(store.get("conv_1").await.unwrap().is_none());

        assert_ok!(store.set("conv_1", r#"[{"id":"a"}]"#).await);
        assert_ok!(store.set("conv_1", r#"[{"id":"b"}]"#).await);

        let value = assert_ok!(store.get("conv_1").await);
        assert_eq!(value.as_deref(), Some(r#"[{"id":"b"}]"#));
    }

    #[tokio::test]
    async fn test_sqlite_prefix_is_literal() {
        let store = SqliteStore::new_in_memory().await.unwrap();

        store.set("conv_1", "[]").await.unwrap();
        store.set("convX1", "[]").await.unwrap();
        store.set("conversations", "[]").await.unwrap();

        let keys = store.keys_with_prefix("conv_").await.unwrap();
        assert_eq!(keys, vec!["conv_1"]);
    }
}
