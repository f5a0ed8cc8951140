use std::sync::Arc;

use crate::action::Action;
use crate::error::LiveOpsError;
use crate::store::SharedStore;
use crate::types::TransactionId;

/// Durable per-transaction list of already-executed actions, stored at
/// `"{prefix}:transaction:{id}"`.
///
/// Only the owner of the bucket holding a transaction's actions mutates its
/// log, so no cross-process locking is needed.
pub struct TransactionLog {
    store: Arc<dyn SharedStore>,
    prefix: String,
    max_revert_steps: usize,
}

impl TransactionLog {
    pub fn new(store: Arc<dyn SharedStore>, prefix: impl Into<String>, max_revert_steps: usize) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            max_revert_steps,
        }
    }

    pub fn key(&self, id: &TransactionId) -> String {
        format!("{}:transaction:{}", self.prefix, id)
    }

    /// Record `action` as executed. Actions outside a transaction are not
    /// logged.
    pub async fn append(&self, action: &Action) -> Result<(), LiveOpsError> {
        let Some(id) = action.transaction() else {
            return Ok(());
        };
        let raw = serde_json::to_string(action).map_err(|e| {
            LiveOpsError::malformed(format!("failed to encode log entry {}", action.action_type), e)
        })?;
        let key = self.key(id);
        self.store.push_back(&key, raw).await?;
        tracing::debug!(transaction = %id, action_type = %action.action_type, "logged transaction entry");
        Ok(())
    }

    /// Drain the log of `last`'s transaction.
    ///
    /// Returns every logged action in execution order followed by `last`, and
    /// deletes the log.
    pub async fn complete(&self, last: &Action) -> Result<Vec<Action>, LiveOpsError> {
        let Some(id) = last.transaction() else {
            return Ok(vec![last.clone()]);
        };
        let key = self.key(id);
        let mut actions = Vec::new();
        for raw in self.store.range(&key).await? {
            match serde_json::from_str::<Action>(&raw) {
                Ok(action) => actions.push(action),
                Err(e) => {
                    tracing::warn!(transaction = %id, error = %e, "skipping malformed log entry")
                }
            }
        }
        actions.push(last.clone());
        self.store.remove(&key).await?;
        tracing::debug!(transaction = %id, entries = actions.len(), "completed transaction");
        Ok(actions)
    }

    /// Walk the log backwards from the most recent entry until one carries a
    /// `revert`.
    ///
    /// Each inspected entry is removed. The found revert is returned with
    /// `reverting` set and joined to `failed`'s transaction. Returns `None`
    /// when the log runs out first, or after `max_revert_steps` entries.
    pub async fn revert(&self, failed: &Action) -> Result<Option<Action>, LiveOpsError> {
        let Some(id) = failed.transaction() else {
            return Ok(None);
        };
        let key = self.key(id);
        for _ in 0..self.max_revert_steps {
            let Some(raw) = self.store.pop_back(&key).await? else {
                tracing::debug!(transaction = %id, "revert walk reached start of transaction");
                return Ok(None);
            };
            let entry = match serde_json::from_str::<Action>(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(transaction = %id, error = %e, "skipping malformed log entry");
                    continue;
                }
            };
            if let Some(revert) = entry.revert {
                let mut revert = *revert;
                revert.reverting = true;
                revert.meta.transaction = Some(id.clone());
                tracing::debug!(
                    transaction = %id,
                    action_type = %entry.action_type,
                    revert_type = %revert.action_type,
                    "reverting transaction entry"
                );
                return Ok(Some(revert));
            }
        }
        tracing::warn!(
            transaction = %id,
            max_revert_steps = self.max_revert_steps,
            "revert walk stopped at step limit"
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_store::MemoryStore;
    use serde_json::json;

    fn log(store: Arc<MemoryStore>) -> TransactionLog {
        TransactionLog::new(store, "lo", 1024)
    }

    fn in_tx(action_type: &str, id: &str) -> Action {
        Action::new(action_type, json!({})).with_transaction(TransactionId::new(id))
    }

    #[tokio::test]
    async fn complete_returns_entries_in_order_and_clears() {
        let store = Arc::new(MemoryStore::new());
        let log = log(store.clone());
        log.append(&in_tx("A", "t1")).await.unwrap();
        log.append(&in_tx("B", "t1")).await.unwrap();

        let done = log.complete(&in_tx("C", "t1")).await.unwrap();
        let types: Vec<_> = done.iter().map(|a| a.action_type.as_str()).collect();
        assert_eq!(types, vec!["A", "B", "C"]);
        assert_eq!(store.list_len("lo:transaction:t1"), 0);
    }

    #[tokio::test]
    async fn untracked_actions_bypass_the_log() {
        let store = Arc::new(MemoryStore::new());
        let log = log(store.clone());
        let action = Action::new("A", json!({}));
        log.append(&action).await.unwrap();
        assert_eq!(log.complete(&action).await.unwrap(), vec![action.clone()]);
        assert!(log.revert(&action).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revert_returns_most_recent_revert() {
        let store = Arc::new(MemoryStore::new());
        let log = log(store.clone());
        log.append(&in_tx("A", "t1").with_revert(Action::new("UNDO_A", json!({}))))
            .await
            .unwrap();
        log.append(&in_tx("B", "t1").with_revert(Action::new("UNDO_B", json!({}))))
            .await
            .unwrap();

        let revert = log.revert(&in_tx("C", "t1")).await.unwrap().unwrap();
        assert_eq!(revert.action_type.as_str(), "UNDO_B");
        assert!(revert.reverting);
        assert_eq!(revert.transaction().unwrap().as_str(), "t1");
        assert_eq!(store.list_len("lo:transaction:t1"), 1);
    }

    #[tokio::test]
    async fn revert_skips_entries_without_revert() {
        let store = Arc::new(MemoryStore::new());
        let log = log(store.clone());
        log.append(&in_tx("A", "t1").with_revert(Action::new("UNDO_A", json!({}))))
            .await
            .unwrap();
        log.append(&in_tx("B", "t1")).await.unwrap();

        let revert = log.revert(&in_tx("C", "t1")).await.unwrap().unwrap();
        assert_eq!(revert.action_type.as_str(), "UNDO_A");
        assert_eq!(store.list_len("lo:transaction:t1"), 0);
    }

    #[tokio::test]
    async fn revert_with_no_reverts_is_silent() {
        let store = Arc::new(MemoryStore::new());
        let log = log(store.clone());
        log.append(&in_tx("A", "t1")).await.unwrap();
        log.append(&in_tx("B", "t1")).await.unwrap();
        assert!(log.revert(&in_tx("C", "t1")).await.unwrap().is_none());
        assert_eq!(store.list_len("lo:transaction:t1"), 0);
    }

    #[tokio::test]
    async fn revert_walk_is_bounded() {
        let store = Arc::new(MemoryStore::new());
        let log = TransactionLog::new(store.clone(), "lo", 2);
        log.append(&in_tx("A", "t1").with_revert(Action::new("UNDO_A", json!({}))))
            .await
            .unwrap();
        for t in ["B", "C", "D"] {
            log.append(&in_tx(t, "t1")).await.unwrap();
        }
        assert!(log.revert(&in_tx("E", "t1")).await.unwrap().is_none());
        // Two entries inspected, A and B remain.
        assert_eq!(store.list_len("lo:transaction:t1"), 2);
    }
}
