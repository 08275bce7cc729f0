//! Short-lived feedback badges ("Copied!", "Shared", ...)
//!
//! Each badge is keyed by message id and kind and clears itself after a
//! fixed duration. Raising a badge again restarts its timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BadgeKind {
    Copied,
    Shared,
    Liked,
    Disliked,
}

type BadgeKey = (String, BadgeKind);

pub struct BadgeTimers {
    active: Arc<Mutex<HashMap<BadgeKey, u64>>>,
    next_generation: AtomicU64,
    duration: Duration,
}

impl BadgeTimers {
    pub fn new(duration: Duration) -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            duration,
        }
    }

    pub async fn raise(&self, message_id: &str, kind: BadgeKind) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let key = (message_id.to_string(), kind);
        self.active.lock().await.insert(key.clone(), generation);

        let active = self.active.clone();
        let duration = self.duration;
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let mut active = active.lock().await;
            // A later raise owns the badge now
            if active.get(&key) == Some(&generation) {
                active.remove(&key);
            }
        });
    }

    pub async fn is_active(&self, message_id: &str, kind: BadgeKind) -> bool {
        self.active
            .lock()
            .await
            .contains_key(&(message_id.to_string(), kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_badge_dismisses_itself() {
        let badges = BadgeTimers::new(Duration::from_millis(2000));
        badges.raise("m1", BadgeKind::Copied).await;

        assert!(badges.is_active("m1", BadgeKind::Copied).await);
        assert!(!badges.is_active("m1", BadgeKind::Shared).await);

        sleep(Duration::from_millis(2001)).await;
        assert!(!badges.is_active("m1", BadgeKind::Copied).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raise_again_restarts_timer() {
        let badges = BadgeTimers::new(Duration::from_millis(2000));
        badges.raise("m1", BadgeKind::Copied).await;

        sleep(Duration::from_millis(1500)).await;
        badges.raise("m1", BadgeKind::Copied).await;

        sleep(Duration::from_millis(1000)).await;
        assert!(badges.is_active("m1", BadgeKind::Copied).await);

        sleep(Duration::from_millis(1100)).await;
        assert!(!badges.is_active("m1", BadgeKind::Copied).await);
    }
}
