use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::config::LiveOpsConfig;
use crate::error::LiveOpsError;
use crate::membership::messages::{
    services_scope, BusMessage, GroupMetadataMessage, Heartbeat, HeartbeatService, LockAllocation,
    NamedBroadcast, ServiceGroup, ServiceInfo, SystemStatus, LOCK_ALLOCATION,
};
use crate::store::{BusStream, SharedStore};
use crate::tasks::BackgroundTasks;
use crate::types::ServiceId;

const EVENT_CAPACITY: usize = 256;

/// Produces the metadata an instance publishes for its group. Called once;
/// the result is memoized.
pub type MetadataProvider =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Value, LiveOpsError>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceEvent {
    /// This instance became the leader of its group.
    Elected,
    Revoked,
    SystemUpdated(u64),
    /// The buckets this instance must poll.
    PartitionAssigned(Vec<u32>),
    /// The known groups or their metadata changed; see
    /// [`ServiceInstance::groups`].
    GroupsChanged,
    /// A named broadcast not interpreted by the instance.
    Broadcast(NamedBroadcast),
}

#[derive(Default)]
struct State {
    system_version: u64,
    is_leader: bool,
    /// Bumped on every election; part of the published metadata version.
    elections: u64,
    groups: BTreeMap<String, ServiceGroup>,
    partition: Vec<u32>,
}

/// One member of a service group.
///
/// Announces itself on start, heartbeats on a fixed interval and follows
/// the coordinator's group updates and bucket allocations.
pub struct ServiceInstance {
    id: ServiceId,
    name: String,
    version: String,
    config: LiveOpsConfig,
    store: Arc<dyn SharedStore>,
    scope: String,
    metadata_provider: MetadataProvider,
    metadata: OnceCell<Value>,
    state: Mutex<State>,
    events: broadcast::Sender<InstanceEvent>,
    cancel: CancellationToken,
    background_tasks: BackgroundTasks,
}

impl ServiceInstance {
    pub fn new(
        store: Arc<dyn SharedStore>,
        config: LiveOpsConfig,
        name: impl Into<String>,
        version: impl Into<String>,
        metadata_provider: MetadataProvider,
    ) -> Result<Self, LiveOpsError> {
        config.validate()?;
        let name = name.into();
        if name.is_empty() {
            return Err(LiveOpsError::InvalidConfig {
                reason: "service name must not be empty".to_string(),
            });
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            id: ServiceId::random(),
            name,
            version: version.into(),
            scope: services_scope(&config.prefix),
            config,
            store,
            metadata_provider,
            metadata: OnceCell::new(),
            state: Mutex::new(State::default()),
            events,
            cancel: CancellationToken::new(),
            background_tasks: BackgroundTasks::default(),
        })
    }

    /// Subscribe to the services bus, announce this instance and start
    /// heartbeating.
    pub async fn start(self: &Arc<Self>) -> Result<(), LiveOpsError> {
        let stream = self.store.subscribe(&self.scope).await?;
        let this = Arc::clone(self);
        self.background_tasks
            .push(tokio::spawn(async move { this.bus_loop(stream).await }))
            .await;

        self.send(&BusMessage::ServiceAdd(self.info())).await?;
        self.send(&BusMessage::SystemStatusRequest).await?;

        let this = Arc::clone(self);
        self.background_tasks
            .push(tokio::spawn(async move { this.heartbeat_loop().await }))
            .await;
        tracing::info!(service = %self.id, name = %self.name, version = %self.version, "service registered");
        Ok(())
    }

    /// Stop heartbeating and announce the removal so the group is
    /// rebalanced without waiting for the ttl.
    pub async fn shutdown(&self) -> Result<(), LiveOpsError> {
        self.cancel.cancel();
        if let Err(e) = self.send(&BusMessage::ServiceRemove(self.id.clone())).await {
            tracing::warn!(service = %self.id, error = %e, "failed to announce service removal");
        }
        self.background_tasks
            .join_all(self.config.shutdown_timeout)
            .await;
        Ok(())
    }

    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            uuid: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().is_leader
    }

    pub fn system_version(&self) -> u64 {
        self.state.lock().system_version
    }

    /// Groups last reported by the coordinator, by name.
    pub fn groups(&self) -> Vec<ServiceGroup> {
        self.state.lock().groups.values().cloned().collect()
    }

    /// Buckets allocated to this instance.
    pub fn partition(&self) -> Vec<u32> {
        self.state.lock().partition.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events.subscribe()
    }

    /// Send a named event to every coordinator and instance.
    pub async fn broadcast(&self, kind: impl Into<String>, data: Value) -> Result<(), LiveOpsError> {
        self.send(&BusMessage::ServiceBroadcast(NamedBroadcast {
            kind: kind.into(),
            data,
        }))
        .await
    }

    pub fn metadata_version(&self) -> String {
        format!("{}.{}", self.version, self.state.lock().elections)
    }

    async fn metadata(&self) -> Result<Value, LiveOpsError> {
        self.metadata
            .get_or_try_init(|| (self.metadata_provider)())
            .await
            .cloned()
    }

    /// Publish one heartbeat carrying the memoized metadata.
    pub async fn heartbeat(&self) -> Result<(), LiveOpsError> {
        let metadata = self.metadata().await?;
        let message = BusMessage::ServiceHeartbeat(Heartbeat {
            service: HeartbeatService {
                uuid: self.id.clone(),
                name: self.name.clone(),
                version: self.version.clone(),
                metadata_version: Some(self.metadata_version()),
                metadata: Some(metadata),
            },
            system_version: self.system_version(),
        });
        self.send(&message).await
    }

    fn emit(&self, event: InstanceEvent) {
        let _ = self.events.send(event);
    }

    async fn send(&self, message: &BusMessage) -> Result<(), LiveOpsError> {
        self.store.publish(&self.scope, message.encode()?).await
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
            }
            if let Err(e) = self.heartbeat().await {
                tracing::error!(service = %self.id, error = %e, "heartbeat failed");
            }
        }
    }

    async fn bus_loop(self: Arc<Self>, mut stream: BusStream) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                raw = stream.next() => {
                    let Some(raw) = raw else {
                        tracing::warn!(service = %self.id, "services bus closed");
                        break;
                    };
                    match BusMessage::decode(&raw) {
                        Ok(message) => self.handle_message(message).await,
                        Err(e) => tracing::warn!(error = %e, "ignoring undecodable bus message"),
                    }
                }
            }
        }
    }

    async fn handle_message(&self, message: BusMessage) {
        match message {
            BusMessage::SystemSetup(by) => {
                tracing::info!(service = %self.id, coordinator = %by, "system setup requested");
                self.state.lock().is_leader = false;
                if let Err(e) = self.heartbeat().await {
                    tracing::error!(service = %self.id, error = %e, "heartbeat failed");
                }
            }
            BusMessage::SystemUpdate(version) => {
                self.state.lock().system_version = version;
                tracing::debug!(service = %self.id, system_version = version, "system version updated");
                self.emit(InstanceEvent::SystemUpdated(version));
            }
            BusMessage::GroupUpdate(group) => {
                let own = group.name == self.name;
                self.state.lock().groups.insert(group.name.clone(), group.clone());
                self.emit(InstanceEvent::GroupsChanged);
                if own {
                    self.follow_leader(&group.leader).await;
                }
            }
            BusMessage::GroupMetadata(metadata) => self.apply_group_metadata(metadata),
            BusMessage::SystemStatus(status) => self.apply_status(status).await,
            BusMessage::ServiceBroadcast(broadcast) if broadcast.kind == LOCK_ALLOCATION => {
                self.apply_allocation(broadcast.data)
            }
            BusMessage::ServiceBroadcast(broadcast) => self.emit(InstanceEvent::Broadcast(broadcast)),
            _ => {}
        }
    }

    /// React to the recorded leader of this instance's group.
    async fn follow_leader(&self, leader: &ServiceId) {
        let transition = {
            let mut state = self.state.lock();
            let elected = leader == &self.id;
            if elected == state.is_leader {
                None
            } else {
                state.is_leader = elected;
                if elected {
                    state.elections += 1;
                }
                Some(elected)
            }
        };
        match transition {
            Some(true) => {
                tracing::info!(service = %self.id, group = %self.name, "elected as group leader");
                self.emit(InstanceEvent::Elected);
                if let Err(e) = self.publish_metadata().await {
                    tracing::error!(service = %self.id, error = %e, "failed to publish group metadata");
                }
            }
            Some(false) => {
                tracing::info!(service = %self.id, group = %self.name, "group leadership revoked");
                self.emit(InstanceEvent::Revoked);
            }
            None => {}
        }
    }

    async fn publish_metadata(&self) -> Result<(), LiveOpsError> {
        let metadata = self.metadata().await?;
        tracing::debug!(service = %self.id, metadata_version = %self.metadata_version(), "sending group metadata");
        self.send(&BusMessage::GroupMetadata(GroupMetadataMessage {
            name: self.name.clone(),
            metadata_version: self.metadata_version(),
            metadata,
        }))
        .await
    }

    fn apply_group_metadata(&self, metadata: GroupMetadataMessage) {
        let known = {
            let mut state = self.state.lock();
            match state.groups.get_mut(&metadata.name) {
                Some(group) => {
                    group.metadata_version = Some(metadata.metadata_version);
                    group.metadata = Some(metadata.metadata);
                    true
                }
                None => false,
            }
        };
        if known {
            self.emit(InstanceEvent::GroupsChanged);
        }
    }

    async fn apply_status(&self, status: SystemStatus) {
        let leader = {
            let mut state = self.state.lock();
            state.system_version = status.system_version;
            state.groups = status
                .groups
                .into_iter()
                .map(|g| (g.name.clone(), g))
                .collect();
            state.groups.get(&self.name).map(|g| g.leader.clone())
        };
        self.emit(InstanceEvent::SystemUpdated(status.system_version));
        self.emit(InstanceEvent::GroupsChanged);
        if let Some(leader) = leader {
            self.follow_leader(&leader).await;
        }
    }

    fn apply_allocation(&self, data: Value) {
        let allocation: LockAllocation = match serde_json::from_value(data) {
            Ok(allocation) => allocation,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed bucket allocation");
                return;
            }
        };
        if allocation.group != self.name {
            return;
        }
        let Some(buckets) = allocation.partition_table.get(&self.id) else {
            tracing::debug!(service = %self.id, "allocation does not include this instance, keeping current buckets");
            return;
        };
        if let (Some(first), Some(last)) = (buckets.first(), buckets.last()) {
            tracing::info!(service = %self.id, first, last, "buckets allocated");
        }
        self.state.lock().partition = buckets.clone();
        self.emit(InstanceEvent::PartitionAssigned(buckets.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_store::MemoryStore;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn provider(calls: Arc<AtomicUsize>) -> MetadataProvider {
        Arc::new(move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "mappings": [] }))
            }
            .boxed()
        })
    }

    fn instance(store: Arc<MemoryStore>) -> (ServiceInstance, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = LiveOpsConfig {
            prefix: "lo".into(),
            ..Default::default()
        };
        let instance =
            ServiceInstance::new(store, config, "shop", "1.0.0", provider(calls.clone())).unwrap();
        (instance, calls)
    }

    fn group(name: &str, leader: &ServiceId) -> ServiceGroup {
        ServiceGroup {
            name: name.into(),
            leader: leader.clone(),
            version: "1.0.0".into(),
            system_version: 1,
            metadata_version: None,
            metadata: None,
        }
    }

    async fn next_message(bus: &mut BusStream) -> BusMessage {
        BusMessage::decode(&bus.next().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn start_announces_the_service() {
        let store = Arc::new(MemoryStore::new());
        let mut bus = store.subscribe("lo:service-manager:nrp").await.unwrap();
        let (instance, _) = instance(store);
        let instance = Arc::new(instance);
        instance.start().await.unwrap();

        assert_eq!(next_message(&mut bus).await, BusMessage::ServiceAdd(instance.info()));
        assert_eq!(next_message(&mut bus).await, BusMessage::SystemStatusRequest);
        instance.shutdown().await.unwrap();
        assert_eq!(
            next_message(&mut bus).await,
            BusMessage::ServiceRemove(instance.id().clone())
        );
    }

    #[tokio::test]
    async fn heartbeat_memoizes_metadata() {
        let store = Arc::new(MemoryStore::new());
        let mut bus = store.subscribe("lo:service-manager:nrp").await.unwrap();
        let (instance, calls) = instance(store);
        instance.heartbeat().await.unwrap();
        instance.heartbeat().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let BusMessage::ServiceHeartbeat(hb) = next_message(&mut bus).await else {
            panic!("expected a heartbeat");
        };
        assert_eq!(hb.service.metadata_version.as_deref(), Some("1.0.0.0"));
        assert_eq!(hb.service.metadata, Some(json!({ "mappings": [] })));
    }

    #[tokio::test]
    async fn election_resends_metadata_with_bumped_version() {
        let store = Arc::new(MemoryStore::new());
        let mut bus = store.subscribe("lo:service-manager:nrp").await.unwrap();
        let (instance, _) = instance(store);
        let mut events = instance.subscribe();

        instance
            .handle_message(BusMessage::GroupUpdate(group("shop", instance.id())))
            .await;
        assert!(instance.is_leader());
        assert_eq!(events.recv().await.unwrap(), InstanceEvent::GroupsChanged);
        assert_eq!(events.recv().await.unwrap(), InstanceEvent::Elected);
        let BusMessage::GroupMetadata(metadata) = next_message(&mut bus).await else {
            panic!("expected group metadata");
        };
        assert_eq!(metadata.metadata_version, "1.0.0.1");

        instance
            .handle_message(BusMessage::GroupUpdate(group("shop", &ServiceId::new("other"))))
            .await;
        assert!(!instance.is_leader());
        assert_eq!(events.recv().await.unwrap(), InstanceEvent::GroupsChanged);
        assert_eq!(events.recv().await.unwrap(), InstanceEvent::Revoked);
    }

    #[tokio::test]
    async fn other_groups_do_not_change_leadership() {
        let store = Arc::new(MemoryStore::new());
        let (instance, _) = instance(store);
        instance
            .handle_message(BusMessage::GroupUpdate(group("chat", instance.id())))
            .await;
        assert!(!instance.is_leader());
        assert_eq!(instance.groups().len(), 1);
    }

    #[tokio::test]
    async fn applies_only_its_own_allocation() {
        let store = Arc::new(MemoryStore::new());
        let (instance, _) = instance(store);
        let mut events = instance.subscribe();

        let mut table = BTreeMap::new();
        table.insert(instance.id().clone(), vec![0, 1, 2]);
        table.insert(ServiceId::new("other"), vec![3, 4]);
        let allocation = |group: &str| {
            BusMessage::ServiceBroadcast(NamedBroadcast {
                kind: LOCK_ALLOCATION.into(),
                data: serde_json::to_value(LockAllocation {
                    group: group.into(),
                    partition_table: table.clone(),
                })
                .unwrap(),
            })
        };

        instance.handle_message(allocation("chat")).await;
        assert!(instance.partition().is_empty());
        instance.handle_message(allocation("shop")).await;
        assert_eq!(instance.partition(), vec![0, 1, 2]);
        assert_eq!(
            events.recv().await.unwrap(),
            InstanceEvent::PartitionAssigned(vec![0, 1, 2])
        );
    }

    #[tokio::test]
    async fn unknown_broadcasts_are_relayed() {
        let store = Arc::new(MemoryStore::new());
        let (instance, _) = instance(store);
        let mut events = instance.subscribe();
        let broadcast = NamedBroadcast {
            kind: "channel-join".into(),
            data: json!({ "session": "s1", "channel": ["c"] }),
        };
        instance
            .handle_message(BusMessage::ServiceBroadcast(broadcast.clone()))
            .await;
        assert_eq!(events.recv().await.unwrap(), InstanceEvent::Broadcast(broadcast));
    }

    #[tokio::test]
    async fn system_setup_triggers_immediate_heartbeat() {
        let store = Arc::new(MemoryStore::new());
        let mut bus = store.subscribe("lo:service-manager:nrp").await.unwrap();
        let (instance, _) = instance(store);
        instance
            .handle_message(BusMessage::SystemSetup(ServiceId::new("coordinator")))
            .await;
        assert!(matches!(next_message(&mut bus).await, BusMessage::ServiceHeartbeat(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_on_interval() {
        let store = Arc::new(MemoryStore::new());
        let mut bus = store.subscribe("lo:service-manager:nrp").await.unwrap();
        let (instance, _) = instance(store);
        let instance = Arc::new(instance);
        instance.start().await.unwrap();
        next_message(&mut bus).await;
        next_message(&mut bus).await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(matches!(next_message(&mut bus).await, BusMessage::ServiceHeartbeat(_)));
        instance.shutdown().await.unwrap();
    }
}
