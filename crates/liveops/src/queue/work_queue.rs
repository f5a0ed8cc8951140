use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::action::{Action, QueueItem};
use crate::error::LiveOpsError;
use crate::hash::bucket_for_resource;
use crate::store::SharedStore;
use crate::types::BucketKey;

/// A fixed number of independent FIFO buckets in the shared store.
///
/// Producers enqueue into `hash(resource) % bucket_count`; each consumer polls
/// only the buckets allocated to it.
pub struct ShardedWorkQueue {
    store: Arc<dyn SharedStore>,
    prefix: String,
    bucket_count: u32,
    owned: ArcSwap<Vec<BucketKey>>,
}

impl ShardedWorkQueue {
    /// # Panics
    ///
    /// Panics if `bucket_count` is zero; validate the config first.
    pub fn new(store: Arc<dyn SharedStore>, prefix: impl Into<String>, bucket_count: u32) -> Self {
        assert!(bucket_count >= 1, "bucket_count must be >= 1, got {bucket_count}");
        Self {
            store,
            prefix: prefix.into(),
            bucket_count,
            owned: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    pub fn bucket_key(&self, resource: &str, segment: Option<&str>) -> BucketKey {
        BucketKey::new(
            self.prefix.clone(),
            segment,
            bucket_for_resource(resource, self.bucket_count),
        )
    }

    /// Append an action to its resource's bucket. Never waits for a consumer.
    pub async fn enqueue(
        &self,
        client: Option<String>,
        action: Action,
        resource: &str,
        segment: Option<&str>,
    ) -> Result<BucketKey, LiveOpsError> {
        let key = self.bucket_key(resource, segment);
        let action_type = action.action_type.clone();
        let raw = QueueItem::new(client, action).encode()?;
        self.store.push_back(&key.store_key(), raw).await?;
        tracing::debug!(bucket = %key, action_type = %action_type, resource, "enqueued action");
        Ok(key)
    }

    /// Replace the set of buckets this consumer polls.
    pub fn allocate_buckets(&self, buckets: &[u32], segment: Option<&str>) {
        let keys: Vec<BucketKey> = buckets
            .iter()
            .filter(|&&b| b < self.bucket_count)
            .map(|&b| BucketKey::new(self.prefix.clone(), segment, b))
            .collect();
        if let (Some(first), Some(last)) = (buckets.first(), buckets.last()) {
            tracing::debug!(first, last, count = keys.len(), "allocating buckets");
        }
        self.owned.store(Arc::new(keys));
    }

    pub fn owned_buckets(&self) -> Arc<Vec<BucketKey>> {
        self.owned.load_full()
    }

    /// Pop at most one item from every owned bucket, concurrently.
    ///
    /// Store errors and undecodable items are logged and skipped; the bucket
    /// is tried again on the next poll.
    pub async fn poll_owned(&self) -> Vec<(BucketKey, QueueItem)> {
        let owned = self.owned.load_full();
        let pops = owned.iter().map(|key| async move {
            match self.store.pop_front(&key.store_key()).await {
                Ok(Some(raw)) => match QueueItem::decode(&raw) {
                    Ok(item) => {
                        tracing::debug!(
                            bucket = %key,
                            action_type = %item.action.action_type,
                            "received action"
                        );
                        Some((key.clone(), item))
                    }
                    Err(e) => {
                        tracing::warn!(bucket = %key, error = %e, "dropping malformed queue item");
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(bucket = %key, error = %e, "failed to poll bucket");
                    None
                }
            }
        });
        futures::future::join_all(pops)
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}
