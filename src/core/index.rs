//! Conversation index: summaries of every conversation, newest first

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::conversation::ConversationSummary;
use crate::storage::{KeyValueStore, StorageError};

pub const INDEX_KEY: &str = "conversations";

pub struct ConversationIndex {
    kv: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
}

impl ConversationIndex {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            write_lock: Mutex::new(()),
        }
    }

    /// All summaries, most recently created first. An unreadable index
    /// reads as empty.
    pub async fn list(&self) -> Result<Vec<ConversationSummary>, StorageError> {
        let Some(raw) = self.kv.get(INDEX_KEY).await? else {
            return Ok(Vec::new());
        };

        match serde_json::from_str(&raw) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable conversation index");
                Ok(Vec::new())
            }
        }
    }

    pub async fn get(&self, conversation_id: &str) -> Result<Option<ConversationSummary>, StorageError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|c| c.id == conversation_id))
    }

    /// Insert a new summary at the head. Returns false if the id is already
    /// indexed.
    pub async fn prepend(&self, summary: ConversationSummary) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;

        let mut entries = self.list().await?;
        if entries.iter().any(|c| c.id == summary.id) {
            return Ok(false);
        }
        entries.insert(0, summary);
        self.write(&entries).await?;
        Ok(true)
    }

    /// Set the title of an existing entry. Returns false if not found.
    pub async fn upsert_title(&self, conversation_id: &str, title: &str) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;

        let mut entries = self.list().await?;
        let Some(entry) = entries.iter_mut().find(|c| c.id == conversation_id) else {
            return Ok(false);
        };
        entry.title = Some(title.to_string());
        self.write(&entries).await?;
        Ok(true)
    }

    async fn write(&self, entries: &[ConversationSummary]) -> Result<(), StorageError> {
        let raw = serde_json::to_string(entries)?;
        self.kv.set(INDEX_KEY, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    fn index() -> ConversationIndex {
        ConversationIndex::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn test_prepend_newest_first() {
        let index = index();
        index.prepend(ConversationSummary::with_id("1")).await.unwrap();
        index.prepend(ConversationSummary::with_id("2")).await.unwrap();

        let ids: Vec<_> = index.list().await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["2", "1"]);
    }

    #[tokio::test]
    async fn test_prepend_ignores_duplicates() {
        let index = index();
        assert!(index.prepend(ConversationSummary::with_id("1")).await.unwrap());
        assert!(!index.prepend(ConversationSummary::with_id("1")).await.unwrap());
        assert_eq!(index.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_title() {
        let index = index();
        index.prepend(ConversationSummary::with_id("1")).await.unwrap();

        assert!(index.upsert_title("1", "Cell Biology Basics").await.unwrap());
        assert!(!index.upsert_title("missing", "Nope").await.unwrap());

        let entry = index.get("1").await.unwrap().unwrap();
        assert_eq!(entry.title.as_deref(), Some("Cell Biology Basics"));
        assert!(index.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_index_reads_empty() {
        let kv = Arc::new(InMemoryStore::new());
        kv.set(INDEX_KEY, "oops").await.unwrap();
        let index = ConversationIndex::new(kv);

        assert!(index.list().await.unwrap().is_empty());
        index.prepend(ConversationSummary::with_id("1")).await.unwrap();
        assert_eq!(index.list().await.unwrap().len(), 1);
    }
}
