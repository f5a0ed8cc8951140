//! In-process test doubles and a cluster harness.
//!
//! Every node of a [`TestCluster`] shares one [`MemoryStore`], so
//! coordinators and services see the same queues and bus scopes as they
//! would against a real backend.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::action::Action;
use crate::channels::ChannelMembership;
use crate::config::LiveOpsConfig;
use crate::error::LiveOpsError;
use crate::membership::Coordinator;
use crate::queue::TriggerSink;
use crate::service::{LiveOpsService, RunningService};
use crate::storage::memory_store::MemoryStore;

/// Records join and leave requests instead of applying them.
#[derive(Default)]
pub struct RecordingChannelMembership {
    joined: Mutex<Vec<(String, Vec<String>)>>,
    left: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingChannelMembership {
    pub fn joined(&self) -> Vec<(String, Vec<String>)> {
        self.joined.lock().clone()
    }

    pub fn left(&self) -> Vec<(String, Vec<String>)> {
        self.left.lock().clone()
    }
}

#[async_trait]
impl ChannelMembership for RecordingChannelMembership {
    async fn join(&self, session: &str, channels: &[String]) -> Result<(), LiveOpsError> {
        self.joined
            .lock()
            .push((session.to_string(), channels.to_vec()));
        Ok(())
    }

    async fn leave(&self, session: &str, channels: &[String]) -> Result<(), LiveOpsError> {
        self.left.lock().push((session.to_string(), channels.to_vec()));
        Ok(())
    }
}

/// Records triggered actions in order.
#[derive(Default)]
pub struct RecordingTriggerSink {
    actions: Mutex<Vec<Action>>,
}

impl RecordingTriggerSink {
    pub fn actions(&self) -> Vec<Action> {
        self.actions.lock().clone()
    }

    pub fn types(&self) -> Vec<String> {
        self.actions
            .lock()
            .iter()
            .map(|a| a.action_type.to_string())
            .collect()
    }
}

#[async_trait]
impl TriggerSink for RecordingTriggerSink {
    async fn trigger(&self, action: &Action) -> Result<(), LiveOpsError> {
        self.actions.lock().push(action.clone());
        Ok(())
    }
}

/// Intervals short enough for tests to converge in well under a second.
pub fn fast_config(prefix: &str) -> LiveOpsConfig {
    LiveOpsConfig {
        prefix: prefix.to_string(),
        bucket_count: 16,
        poll_interval: Duration::from_millis(10),
        side_effect_poll_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(20),
        status_check_interval: Duration::from_millis(20),
        snapshot_retry_interval: Duration::from_millis(20),
        leader_lock_ttl: Duration::from_millis(100),
        shutdown_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

/// Poll `condition` every 5ms until it holds or `timeout` passes. Returns
/// whether it held.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Several coordinators and services over one in-memory store.
pub struct TestCluster {
    store: Arc<MemoryStore>,
    config: LiveOpsConfig,
    coordinators: Mutex<Vec<Arc<Coordinator>>>,
    services: Mutex<Vec<Arc<RunningService>>>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(fast_config("lo"))
    }

    pub fn with_config(config: LiveOpsConfig) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            config,
            coordinators: Mutex::new(Vec::new()),
            services: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn config(&self) -> &LiveOpsConfig {
        &self.config
    }

    /// Start another coordinator.
    pub async fn add_coordinator(&self) -> Result<Arc<Coordinator>, LiveOpsError> {
        let coordinator = Arc::new(Coordinator::new(self.store.clone(), self.config.clone())?);
        coordinator.start().await?;
        self.coordinators.lock().push(Arc::clone(&coordinator));
        Ok(coordinator)
    }

    pub fn coordinators(&self) -> Vec<Arc<Coordinator>> {
        self.coordinators.lock().clone()
    }

    pub fn leader(&self) -> Option<Arc<Coordinator>> {
        self.coordinators
            .lock()
            .iter()
            .find(|c| c.is_leader())
            .cloned()
    }

    /// A service over the cluster's store, ready for action declarations.
    pub fn service(&self) -> LiveOpsService {
        LiveOpsService::new(self.store.clone(), self.config.clone())
    }

    pub async fn start_service(
        &self,
        service: LiveOpsService,
        name: &str,
    ) -> Result<Arc<RunningService>, LiveOpsError> {
        let running = Arc::new(service.start(name, "1.0.0").await?);
        self.services.lock().push(Arc::clone(&running));
        Ok(running)
    }

    /// Wait until a leader is elected.
    pub async fn await_leader(&self, timeout: Duration) -> Option<Arc<Coordinator>> {
        if wait_until(timeout, || async move { self.leader().is_some() }).await {
            self.leader()
        } else {
            None
        }
    }

    /// Shut down every node, services first.
    pub async fn shutdown(&self) -> Result<(), LiveOpsError> {
        let services = std::mem::take(&mut *self.services.lock());
        for service in services {
            service.shutdown().await?;
        }
        let coordinators = std::mem::take(&mut *self.coordinators.lock());
        for coordinator in coordinators {
            coordinator.shutdown().await?;
        }
        Ok(())
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}
