use std::sync::Arc;

use async_trait::async_trait;

use crate::action::{Action, QueueItem};
use crate::error::LiveOpsError;
use crate::store::SharedStore;

/// Receives completed actions whose triggers should run.
#[async_trait]
pub trait TriggerSink: Send + Sync {
    async fn trigger(&self, action: &Action) -> Result<(), LiveOpsError>;
}

/// The best-effort FIFO feeding trigger handlers, optionally scoped to a
/// segment: `"{prefix}[:{segment}]:trigger-queue"`.
pub struct SideEffectQueue {
    store: Arc<dyn SharedStore>,
    key: String,
}

impl SideEffectQueue {
    pub fn new(store: Arc<dyn SharedStore>, prefix: &str, segment: Option<&str>) -> Self {
        let key = match segment {
            Some(segment) => format!("{prefix}:{segment}:trigger-queue"),
            None => format!("{prefix}:trigger-queue"),
        };
        Self { store, key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn enqueue(&self, client: Option<String>, action: Action) -> Result<(), LiveOpsError> {
        let action_type = action.action_type.clone();
        let raw = QueueItem::new(client, action).encode()?;
        self.store.push_back(&self.key, raw).await?;
        tracing::debug!(queue = %self.key, action_type = %action_type, "enqueued trigger");
        Ok(())
    }

    /// Pop the oldest item. Undecodable entries are dropped with a warning and
    /// the next one is tried.
    pub async fn pop(&self) -> Result<Option<QueueItem>, LiveOpsError> {
        while let Some(raw) = self.store.pop_front(&self.key).await? {
            match QueueItem::decode(&raw) {
                Ok(item) => return Ok(Some(item)),
                Err(e) => {
                    tracing::warn!(queue = %self.key, error = %e, "dropping malformed trigger item")
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl TriggerSink for SideEffectQueue {
    async fn trigger(&self, action: &Action) -> Result<(), LiveOpsError> {
        self.enqueue(action.client.clone(), action.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_store::MemoryStore;
    use serde_json::json;

    #[test]
    fn key_format() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        assert_eq!(
            SideEffectQueue::new(store.clone(), "lo", None).key(),
            "lo:trigger-queue"
        );
        assert_eq!(
            SideEffectQueue::new(store, "lo", Some("eu")).key(),
            "lo:eu:trigger-queue"
        );
    }

    #[tokio::test]
    async fn fifo_and_skips_garbage() {
        let store = Arc::new(MemoryStore::new());
        let queue = SideEffectQueue::new(store.clone(), "lo", None);
        queue
            .trigger(&Action::new("A", json!({})).with_client("c"))
            .await
            .unwrap();
        store
            .push_back("lo:trigger-queue", "not json".into())
            .await
            .unwrap();
        queue.enqueue(None, Action::new("B", json!({}))).await.unwrap();

        let first = queue.pop().await.unwrap().unwrap();
        assert_eq!(first.action.action_type.as_str(), "A");
        assert_eq!(first.client.as_deref(), Some("c"));
        let second = queue.pop().await.unwrap().unwrap();
        assert_eq!(second.action.action_type.as_str(), "B");
        assert!(queue.pop().await.unwrap().is_none());
    }
}
