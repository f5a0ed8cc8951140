use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::LiveOpsError;
use crate::store::{BusStream, SharedStore};

/// In-process shared store for tests and single-node deployments.
///
/// Several nodes created in one process can share one `MemoryStore` behind an
/// `Arc` to simulate a cluster.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

struct Inner {
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    /// Lock key -> (holder, expiry).
    locks: HashMap<String, (String, Instant)>,
    /// Subscribers per bus scope.
    subscribers: HashMap<String, Vec<tokio::sync::mpsc::UnboundedSender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                lists: HashMap::new(),
                sets: HashMap::new(),
                locks: HashMap::new(),
                subscribers: HashMap::new(),
            }),
        }
    }

    /// Current length of a list.
    pub fn list_len(&self, key: &str) -> usize {
        self.inner.lock().lists.get(key).map_or(0, VecDeque::len)
    }

    /// Current holder of a lock, ignoring expired entries.
    pub fn lock_holder(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .locks
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(holder, _)| holder.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn push_back(&self, key: &str, value: String) -> Result<(), LiveOpsError> {
        let mut inner = self.inner.lock();
        inner.lists.entry(key.to_string()).or_default().push_back(value);
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>, LiveOpsError> {
        let mut inner = self.inner.lock();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(None);
        };
        let value = list.pop_front();
        if list.is_empty() {
            inner.lists.remove(key);
        }
        Ok(value)
    }

    async fn pop_back(&self, key: &str) -> Result<Option<String>, LiveOpsError> {
        let mut inner = self.inner.lock();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(None);
        };
        let value = list.pop_back();
        if list.is_empty() {
            inner.lists.remove(key);
        }
        Ok(value)
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, LiveOpsError> {
        let inner = self.inner.lock();
        Ok(inner
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove(&self, key: &str) -> Result<(), LiveOpsError> {
        let mut inner = self.inner.lock();
        inner.lists.remove(key);
        inner.sets.remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, LiveOpsError> {
        let mut inner = self.inner.lock();
        Ok(inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, LiveOpsError> {
        let mut inner = self.inner.lock();
        let Some(set) = inner.sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            inner.sets.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, LiveOpsError> {
        let inner = self.inner.lock();
        let mut members: Vec<String> = inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn publish(&self, scope: &str, message: String) -> Result<(), LiveOpsError> {
        let mut inner = self.inner.lock();
        if let Some(subscribers) = inner.subscribers.get_mut(scope) {
            subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, scope: &str) -> Result<BusStream, LiveOpsError> {
        let mut inner = self.inner.lock();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        inner
            .subscribers
            .entry(scope.to_string())
            .or_default()
            .push(tx);
        Ok(Box::pin(
            tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
        ))
    }

    async fn acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, LiveOpsError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some((current, expires)) = inner.locks.get(key) {
            if current != holder && *expires > now {
                return Ok(false);
            }
        }
        inner
            .locks
            .insert(key.to_string(), (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_lock(&self, key: &str, holder: &str) -> Result<(), LiveOpsError> {
        let mut inner = self.inner.lock();
        if inner.locks.get(key).is_some_and(|(current, _)| current == holder) {
            inner.locks.remove(key);
        }
        Ok(())
    }
}
