//! Per-conversation message logs
//!
//! Each conversation is stored as one JSON array under `conv_<id>`. Every
//! mutation rewrites the whole array. Writers for the same conversation are
//! serialized so load-modify-save cycles never interleave.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::conversation::Message;
use crate::storage::{KeyValueStore, StorageError};

pub const CONVERSATION_KEY_PREFIX: &str = "conv_";

pub fn conversation_key(conversation_id: &str) -> String {
    format!("{}{}", CONVERSATION_KEY_PREFIX, conversation_id)
}

pub struct MessageStore {
    kv: Arc<dyn KeyValueStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MessageStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Load the ordered message log; empty if nothing is stored yet
    pub async fn load(&self, conversation_id: &str) -> Result<Vec<Message>, StorageError> {
        let key = conversation_key(conversation_id);
        match self.kv.get(&key).await? {
            None => Ok(Vec::new()),
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|source| StorageError::Read { key, source })
            }
        }
    }

    /// Like [`load`](Self::load), but a malformed log reads as empty
    pub async fn load_or_empty(&self, conversation_id: &str) -> Result<Vec<Message>, StorageError> {
        match self.load(conversation_id).await {
            Err(StorageError::Read { key, source }) => {
                tracing::warn!(%key, error = %source, "Discarding unreadable conversation log");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Persist the full ordered log, replacing what was there
    pub async fn save(&self, conversation_id: &str, messages: &[Message]) -> Result<(), StorageError> {
        let lock = self.lock_for(conversation_id).await;
        let _guard = lock.lock().await;
        self.write(conversation_id, messages).await
    }

    pub async fn append(&self, conversation_id: &str, message: Message) -> Result<(), StorageError> {
        self.update(conversation_id, |messages| messages.push(message))
            .await
    }

    /// Load, mutate and save the log while holding the conversation's
    /// write lock. A malformed stored log is treated as empty.
    pub async fn update<F, R>(&self, conversation_id: &str, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut Vec<Message>) -> R,
    {
        self.try_update(conversation_id, |messages| Ok(f(messages)))
            .await
    }

    /// Like [`update`](Self::update), but nothing is written when `f` fails
    pub async fn try_update<F, R, E>(&self, conversation_id: &str, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Vec<Message>) -> Result<R, E>,
        E: From<StorageError>,
    {
        let lock = self.lock_for(conversation_id).await;
        let _guard = lock.lock().await;

        let mut messages = self.load_or_empty(conversation_id).await?;
        let result = f(&mut messages)?;
        self.write(conversation_id, &messages).await?;
        Ok(result)
    }

    /// Like [`update`](Self::update), but nothing is written when `f`
    /// returns `None`
    pub async fn modify<F, R>(&self, conversation_id: &str, f: F) -> Result<Option<R>, StorageError>
    where
        F: FnOnce(&mut Vec<Message>) -> Option<R>,
    {
        let lock = self.lock_for(conversation_id).await;
        let _guard = lock.lock().await;

        let mut messages = self.load_or_empty(conversation_id).await?;
        let Some(result) = f(&mut messages) else {
            return Ok(None);
        };
        self.write(conversation_id, &messages).await?;
        Ok(Some(result))
    }

    /// Ids of every conversation that has a stored log
    pub async fn conversation_ids(&self) -> Result<Vec<String>, StorageError> {
        let keys = self.kv.keys_with_prefix(CONVERSATION_KEY_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(CONVERSATION_KEY_PREFIX).map(str::to_string))
            .collect())
    }

    async fn write(&self, conversation_id: &str, messages: &[Message]) -> Result<(), StorageError> {
        let raw = serde_json::to_string(messages)?;
        self.kv.set(&conversation_key(conversation_id), &raw).await
    }

    async fn lock_for(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    fn store() -> (Arc<InMemoryStore>, MessageStore) {
        let kv = Arc::new(InMemoryStore::new());
        (kv.clone(), MessageStore::new(kv))
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let (_, messages) = store();
        assert!(messages.load("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_keeps_order() {
        let (kv, messages) = store();

        let question = Message::user("Define entropy");
        let answer = Message::pending_reply(&question.id);
        messages.append("c1", question.clone()).await.unwrap();
        messages.append("c1", answer.clone()).await.unwrap();

        let loaded = messages.load("c1").await.unwrap();
        assert_eq!(loaded, vec![question, answer]);
        assert!(kv.get("conv_c1").await.unwrap().unwrap().starts_with('['));
    }

    #[tokio::test]
    async fn test_malformed_log() {
        let (kv, messages) = store();
        kv.set("conv_bad", "{not json").await.unwrap();

        let err = messages.load("bad").await.unwrap_err();
        assert!(matches!(err, StorageError::Read { ref key, .. } if key == "conv_bad"));

        assert!(messages.load_or_empty("bad").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let (_, messages) = store();
        messages
            .save("c1", &[Message::user("one"), Message::user("two")])
            .await
            .unwrap();
        messages.save("c1", &[Message::user("three")]).await.unwrap();

        let loaded = messages.load("c1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].text, "three");
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_serialized() {
        let (_, messages) = store();
        let messages = Arc::new(messages);

        let mut tasks = Vec::new();
        for i in 0..20 {
            let messages = messages.clone();
            tasks.push(tokio::spawn(async move {
                messages
                    .append("c1", Message::user(format!("q{}", i)))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(messages.load("c1").await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_failed_updates_write_nothing() {
        let (kv, messages) = store();

        let untouched: Option<()> = messages.modify("ghost", |_| None).await.unwrap();
        assert!(untouched.is_none());

        let err: Result<(), StorageError> = messages
            .try_update("ghost", |_| {
                Err(StorageError::Encode(
                    serde_json::from_str::<u8>("x").unwrap_err(),
                ))
            })
            .await;
        assert!(err.is_err());

        assert!(kv.get("conv_ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conversation_ids() {
        let (kv, messages) = store();
        messages.append("100", Message::user("a")).await.unwrap();
        messages.append("200", Message::user("b")).await.unwrap();
        kv.set("conversations", "[]").await.unwrap();

        assert_eq!(messages.conversation_ids().await.unwrap(), vec!["100", "200"]);
    }
}
