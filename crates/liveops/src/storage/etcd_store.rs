use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, EventType, GetOptions, PutOptions, SortOrder,
    SortTarget, Txn, TxnOp, WatchOptions,
};
use tokio::sync::Mutex;

use crate::error::LiveOpsError;
use crate::store::{BusStream, SharedStore};

const MAX_CAS_RETRIES: u32 = 100;

/// etcd-backed shared store.
///
/// List entries are individual keys under `{root}list/{key}/` ordered by
/// create revision; pops delete the head with a mod-revision guarded
/// transaction. Set members are keys under `{root}set/{key}/`. The bus puts
/// each message on `{root}bus/{scope}` and subscribers watch that key. Locks
/// are lease-bound keys created only while absent.
pub struct EtcdStore {
    client: Arc<Mutex<Client>>,
    root: String,
}

impl EtcdStore {
    /// - `client`: connected etcd client.
    /// - `root`: key prefix under which every key lives (e.g. "/liveops/").
    pub fn new(client: Client, root: impl Into<String>) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
            root: root.into(),
        }
    }

    fn list_prefix(&self, key: &str) -> String {
        format!("{}list/{key}/", self.root)
    }

    fn set_prefix(&self, key: &str) -> String {
        format!("{}set/{key}/", self.root)
    }

    fn bus_key(&self, scope: &str) -> String {
        format!("{}bus/{scope}", self.root)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}lock/{key}", self.root)
    }

    fn map_err(e: etcd_client::Error) -> LiveOpsError {
        LiveOpsError::StoreError {
            reason: e.to_string(),
            source: Some(Box::new(e)),
        }
    }

    fn utf8(key: &str, bytes: &[u8]) -> Result<String, LiveOpsError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| LiveOpsError::StoreError {
            reason: format!("value under '{key}' is not valid UTF-8: {e}"),
            source: Some(Box::new(e)),
        })
    }

    /// Pop one end of a list. `order` selects which end by create revision.
    async fn pop(&self, key: &str, order: SortOrder) -> Result<Option<String>, LiveOpsError> {
        let prefix = self.list_prefix(key);
        for attempt in 1..=MAX_CAS_RETRIES {
            let popped = {
                let mut client = self.client.lock().await;
                let resp = client
                    .get(
                        prefix.as_str(),
                        Some(
                            GetOptions::new()
                                .with_prefix()
                                .with_sort(SortTarget::Create, order)
                                .with_limit(1),
                        ),
                    )
                    .await
                    .map_err(Self::map_err)?;
                let Some(kv) = resp.kvs().first() else {
                    return Ok(None);
                };
                let txn = Txn::new()
                    .when([Compare::mod_revision(
                        kv.key(),
                        CompareOp::Equal,
                        kv.mod_revision(),
                    )])
                    .and_then([TxnOp::delete(kv.key(), None)]);
                let txn_resp = client.txn(txn).await.map_err(Self::map_err)?;
                if txn_resp.succeeded() {
                    Some(Self::utf8(key, kv.value())?)
                } else {
                    None
                }
            };

            if popped.is_some() {
                return Ok(popped);
            }

            // Another consumer took the head first.
            tracing::debug!(key, attempt, "etcd list pop conflict, retrying");
            let backoff_ms = (1u64 << attempt.min(6)).min(100);
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
        Err(LiveOpsError::StoreError {
            reason: format!("list pop failed after {MAX_CAS_RETRIES} retries on '{key}'"),
            source: None,
        })
    }
}

#[async_trait]
impl SharedStore for EtcdStore {
    async fn push_back(&self, key: &str, value: String) -> Result<(), LiveOpsError> {
        let item_key = format!("{}{}", self.list_prefix(key), uuid::Uuid::new_v4());
        let mut client = self.client.lock().await;
        client
            .put(item_key, value, None)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>, LiveOpsError> {
        self.pop(key, SortOrder::Ascend).await
    }

    async fn pop_back(&self, key: &str) -> Result<Option<String>, LiveOpsError> {
        self.pop(key, SortOrder::Descend).await
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, LiveOpsError> {
        let mut client = self.client.lock().await;
        let resp = client
            .get(
                self.list_prefix(key),
                Some(
                    GetOptions::new()
                        .with_prefix()
                        .with_sort(SortTarget::Create, SortOrder::Ascend),
                ),
            )
            .await
            .map_err(Self::map_err)?;
        resp.kvs()
            .iter()
            .map(|kv| Self::utf8(key, kv.value()))
            .collect()
    }

    async fn remove(&self, key: &str) -> Result<(), LiveOpsError> {
        let mut client = self.client.lock().await;
        for prefix in [self.list_prefix(key), self.set_prefix(key)] {
            client
                .delete(prefix, Some(DeleteOptions::new().with_prefix()))
                .await
                .map_err(Self::map_err)?;
        }
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, LiveOpsError> {
        let member_key = format!("{}{member}", self.set_prefix(key));
        let mut client = self.client.lock().await;
        let txn = Txn::new()
            .when([Compare::create_revision(
                member_key.as_bytes(),
                CompareOp::Equal,
                0,
            )])
            .and_then([TxnOp::put(member_key.as_bytes(), member.as_bytes(), None)]);
        let resp = client.txn(txn).await.map_err(Self::map_err)?;
        Ok(resp.succeeded())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, LiveOpsError> {
        let member_key = format!("{}{member}", self.set_prefix(key));
        let mut client = self.client.lock().await;
        let resp = client
            .delete(member_key, None)
            .await
            .map_err(Self::map_err)?;
        Ok(resp.deleted() > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, LiveOpsError> {
        let mut client = self.client.lock().await;
        let resp = client
            .get(
                self.set_prefix(key),
                Some(
                    GetOptions::new()
                        .with_prefix()
                        .with_sort(SortTarget::Key, SortOrder::Ascend),
                ),
            )
            .await
            .map_err(Self::map_err)?;
        resp.kvs()
            .iter()
            .map(|kv| Self::utf8(key, kv.value()))
            .collect()
    }

    async fn publish(&self, scope: &str, message: String) -> Result<(), LiveOpsError> {
        let mut client = self.client.lock().await;
        client
            .put(self.bus_key(scope), message, None)
            .await
            .map_err(Self::map_err)?;
        Ok(())
    }

    async fn subscribe(&self, scope: &str) -> Result<BusStream, LiveOpsError> {
        let bus_key = self.bus_key(scope);
        let (mut watcher, watch_stream) = {
            let mut client = self.client.lock().await;
            client
                .watch(bus_key.as_bytes(), None::<WatchOptions>)
                .await
                .map_err(Self::map_err)?
        };

        let client = self.client.clone();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        // Forward put events; on stream end or error, re-create the watch
        // with exponential backoff.
        tokio::spawn(async move {
            let mut stream = watch_stream;
            let mut consecutive_failures: u32 = 0;
            const MAX_RECONNECT_FAILURES: u32 = 50;
            const MAX_BACKOFF: Duration = Duration::from_secs(30);

            'outer: loop {
                loop {
                    match stream.message().await {
                        Ok(Some(resp)) => {
                            consecutive_failures = 0;
                            for event in resp.events() {
                                if event.event_type() != EventType::Put {
                                    continue;
                                }
                                let Some(kv) = event.kv() else { continue };
                                match kv.value_str() {
                                    Ok(value) => {
                                        if tx.send(value.to_string()).is_err() {
                                            break 'outer;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!(
                                            key = %bus_key,
                                            error = %e,
                                            "skipping non-UTF-8 bus message"
                                        );
                                    }
                                }
                            }
                        }
                        Ok(None) => {
                            tracing::warn!(key = %bus_key, "etcd bus watch ended, reconnecting");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(key = %bus_key, error = %e, "etcd bus watch error, reconnecting");
                            break;
                        }
                    }
                }

                if let Err(e) = watcher.cancel().await {
                    tracing::warn!(error = %e, "failed to cancel etcd bus watch before reconnection");
                }

                consecutive_failures += 1;
                if consecutive_failures >= MAX_RECONNECT_FAILURES {
                    tracing::error!(
                        key = %bus_key,
                        consecutive_failures,
                        "etcd bus watch gave up reconnecting"
                    );
                    break 'outer;
                }

                let backoff = std::cmp::min(
                    Duration::from_millis(500u64.saturating_mul(1u64 << consecutive_failures.min(10))),
                    MAX_BACKOFF,
                );
                tokio::time::sleep(backoff).await;

                let mut c = client.lock().await;
                match c.watch(bus_key.as_bytes(), None::<WatchOptions>).await {
                    Ok((new_watcher, new_stream)) => {
                        watcher = new_watcher;
                        stream = new_stream;
                        tracing::info!(key = %bus_key, "etcd bus watch reconnected");
                    }
                    Err(e) => {
                        tracing::warn!(
                            key = %bus_key,
                            error = %e,
                            attempt = consecutive_failures,
                            "etcd bus watch reconnection failed"
                        );
                    }
                }
            }

            if let Err(e) = watcher.cancel().await {
                tracing::warn!(error = %e, "failed to cancel etcd bus watch on task exit");
            }
        });

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
        let lock_key = self.lock_key(key);
        let ttl_secs = ttl.as_secs_f64().ceil().max(1.0) as i64;
        let mut client = self.client.lock().await;
        let lease_id = client
            .lease_grant(ttl_secs, None)
            .await
            .map_err(Self::map_err)?
            .id();

        let create = Txn::new()
            .when([Compare::create_revision(
                lock_key.as_bytes(),
                CompareOp::Equal,
                0,
            )])
            .and_then([TxnOp::put(
                lock_key.as_bytes(),
                holder.as_bytes(),
                Some(PutOptions::new().with_lease(lease_id)),
            )]);
        if client.txn(create).await.map_err(Self::map_err)?.succeeded() {
            return Ok(true);
        }

        // Already held: re-attach to the fresh lease only if the holder is us.
        let refresh = Txn::new()
            .when([Compare::value(
                lock_key.as_bytes(),
                CompareOp::Equal,
                holder.as_bytes(),
            )])
            .and_then([TxnOp::put(
                lock_key.as_bytes(),
                holder.as_bytes(),
                Some(PutOptions::new().with_lease(lease_id)),
            )]);
        if client.txn(refresh).await.map_err(Self::map_err)?.succeeded() {
            return Ok(true);
        }

        if let Err(e) = client.lease_revoke(lease_id).await {
            tracing::debug!(lease_id, error = %e, "failed to revoke unused lock lease");
        }
        Ok(false)
    }

    async fn release_lock(&self, key: &str, holder: &str) -> Result<(), LiveOpsError> {
        let lock_key = self.lock_key(key);
        let mut client = self.client.lock().await;
        let txn = Txn::new()
            .when([Compare::value(
                lock_key.as_bytes(),
                CompareOp::Equal,
                holder.as_bytes(),
            )])
            .and_then([TxnOp::delete(lock_key.as_bytes(), None)]);
        client.txn(txn).await.map_err(Self::map_err)?;
        Ok(())
    }
}
