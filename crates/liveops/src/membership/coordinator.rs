use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::channels::{apply_channel_broadcast, ChannelMembership};
use crate::config::LiveOpsConfig;
use crate::emitter::{resource_mapping_from_groups, shared_resource_mapping, SharedResourceMapping};
use crate::error::LiveOpsError;
use crate::membership::messages::{
    leader_lock_key, managers_scope, services_scope, BusMessage, GroupMetadataMessage,
    LockAllocation, ManagedService, NamedBroadcast, ServiceGroup, ServiceInfo, SystemStatus,
    LOCK_ALLOCATION,
};
use crate::membership::partition::PartitionAssigner;
use crate::membership::table::{MembershipTable, TableEvent};
use crate::metrics::LiveOpsMetrics;
use crate::routing::ActionMappingSet;
use crate::store::{BusStream, SharedStore};
use crate::tasks::BackgroundTasks;
use crate::types::ServiceId;

const EVENT_CAPACITY: usize = 256;

/// Something observable happened on this coordinator.
///
/// Table changes (`ServiceAdded`, `ServiceRemoved`, `GroupMetadata`) are
/// reported by the leader. Followers report `SystemStatus` after every
/// snapshot they adopt.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    Elected,
    Revoked,
    ServiceAdded(ServiceInfo),
    ServiceRemoved(ManagedService),
    GroupMetadata(GroupMetadataMessage),
    SystemUpdated(u64),
    SystemStatus,
    /// A `service-broadcast` or `manager-broadcast` seen on the bus.
    Broadcast(NamedBroadcast),
}

struct State {
    table: MembershipTable,
    /// A follower is initialised once it adopted a leader snapshot.
    inited: bool,
    /// Latest system version broadcast by the leader.
    last_incoming: u64,
}

/// Cluster membership coordinator.
///
/// Every coordinator competes for one store lock; the holder is the leader.
/// The leader owns the service and group tables: it registers services from
/// heartbeats, expires them by ttl, recomputes groups and hands out bucket
/// partitions. Followers mirror the leader through snapshots.
pub struct Coordinator {
    id: ServiceId,
    config: LiveOpsConfig,
    store: Arc<dyn SharedStore>,
    services_scope: String,
    managers_scope: String,
    leader_key: String,
    state: Mutex<State>,
    is_leader: AtomicBool,
    events: broadcast::Sender<CoordinatorEvent>,
    resource_mapping: SharedResourceMapping,
    segments: ArcSwap<BTreeSet<String>>,
    channels: Option<Arc<dyn ChannelMembership>>,
    metrics: Arc<LiveOpsMetrics>,
    cancel: CancellationToken,
    background_tasks: BackgroundTasks,
}

impl Coordinator {
    pub fn new(store: Arc<dyn SharedStore>, config: LiveOpsConfig) -> Result<Self, LiveOpsError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            id: ServiceId::random(),
            services_scope: services_scope(&config.prefix),
            managers_scope: managers_scope(&config.prefix),
            leader_key: leader_lock_key(&config.prefix),
            state: Mutex::new(State {
                table: MembershipTable::new(config.default_ttl, config.max_ttl),
                inited: false,
                last_incoming: 0,
            }),
            is_leader: AtomicBool::new(false),
            events,
            resource_mapping: shared_resource_mapping(ActionMappingSet::new()),
            segments: ArcSwap::from_pointee(BTreeSet::new()),
            channels: None,
            metrics: Arc::new(LiveOpsMetrics::unregistered()),
            cancel: CancellationToken::new(),
            background_tasks: BackgroundTasks::default(),
            config,
            store,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<LiveOpsMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Apply relayed `channel-join` / `channel-leave` requests to `channels`.
    pub fn with_channel_membership(mut self, channels: Arc<dyn ChannelMembership>) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Subscribe to both bus scopes and spawn the background loops:
    /// - services bus loop (heartbeats, removals, group updates, snapshots)
    /// - managers bus loop (coordinator-to-coordinator broadcasts)
    /// - status loop (leader lock, and the ttl tick while leader)
    /// - snapshot loop (follower snapshot requests until initialised)
    pub async fn start(self: &Arc<Self>) -> Result<(), LiveOpsError> {
        let services = self.store.subscribe(&self.services_scope).await?;
        let managers = self.store.subscribe(&self.managers_scope).await?;

        let this = Arc::clone(self);
        self.background_tasks
            .push(tokio::spawn(async move { this.services_loop(services).await }))
            .await;
        let this = Arc::clone(self);
        self.background_tasks
            .push(tokio::spawn(async move { this.managers_loop(managers).await }))
            .await;
        let this = Arc::clone(self);
        self.background_tasks
            .push(tokio::spawn(async move { this.status_loop().await }))
            .await;
        let this = Arc::clone(self);
        self.background_tasks
            .push(tokio::spawn(async move { this.snapshot_loop().await }))
            .await;

        tracing::info!(coordinator = %self.id, "coordinator started");
        Ok(())
    }

    /// Stop every loop and give up leadership.
    pub async fn shutdown(&self) -> Result<(), LiveOpsError> {
        self.cancel.cancel();
        if self.is_leader.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.store.release_lock(&self.leader_key, self.id.as_str()).await {
                tracing::warn!(error = %e, "failed to release leader lock during shutdown");
            }
            self.metrics.coordinator_leader.set(0);
            self.emit(CoordinatorEvent::Revoked);
        }
        self.background_tasks
            .join_all(self.config.shutdown_timeout)
            .await;
        tracing::info!(coordinator = %self.id, "coordinator stopped");
        Ok(())
    }

    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// Whether the tables are current: always for the leader, after the first
    /// adopted snapshot for a follower.
    pub fn is_inited(&self) -> bool {
        self.state.lock().inited
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SystemStatus {
        self.state.lock().table.snapshot()
    }

    pub fn system_version(&self) -> u64 {
        self.state.lock().table.system_version()
    }

    pub fn services(&self) -> Vec<ManagedService> {
        self.state.lock().table.services().to_vec()
    }

    pub fn groups(&self) -> Vec<ServiceGroup> {
        self.state.lock().table.groups().to_vec()
    }

    pub fn group(&self, name: &str) -> Option<ServiceGroup> {
        self.state.lock().table.group(name).cloned()
    }

    /// Resource mapping merged from every group's metadata.
    pub fn resource_mapping(&self) -> SharedResourceMapping {
        Arc::clone(&self.resource_mapping)
    }

    /// Segments served by at least one group.
    pub fn active_segments(&self) -> Arc<BTreeSet<String>> {
        self.segments.load_full()
    }

    /// Send a named event to every coordinator and service instance.
    pub async fn broadcast(&self, kind: impl Into<String>, data: Value) -> Result<(), LiveOpsError> {
        let message = BusMessage::ServiceBroadcast(NamedBroadcast {
            kind: kind.into(),
            data,
        });
        self.store
            .publish(&self.services_scope, message.encode()?)
            .await
    }

    /// Send a named event to the other coordinators only.
    pub async fn broadcast_to_managers(
        &self,
        kind: impl Into<String>,
        data: Value,
    ) -> Result<(), LiveOpsError> {
        let message = BusMessage::ManagerBroadcast(NamedBroadcast {
            kind: kind.into(),
            data,
        });
        self.store
            .publish(&self.managers_scope, message.encode()?)
            .await
    }

    fn emit(&self, event: CoordinatorEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    async fn publish(&self, message: &BusMessage) {
        let raw = match message.encode() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(kind = message.kind(), error = %e, "failed to encode bus message");
                return;
            }
        };
        if let Err(e) = self.store.publish(&self.services_scope, raw).await {
            tracing::warn!(kind = message.kind(), error = %e, "failed to publish bus message");
        }
    }

    async fn services_loop(self: Arc<Self>, mut stream: BusStream) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                raw = stream.next() => {
                    let Some(raw) = raw else {
                        tracing::warn!("services bus closed");
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

    async fn managers_loop(self: Arc<Self>, mut stream: BusStream) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                raw = stream.next() => {
                    let Some(raw) = raw else {
                        tracing::warn!("managers bus closed");
                        break;
                    };
                    match BusMessage::decode(&raw) {
                        Ok(BusMessage::ManagerBroadcast(broadcast)) => {
                            self.emit(CoordinatorEvent::Broadcast(broadcast))
                        }
                        Ok(other) => {
                            tracing::debug!(kind = other.kind(), "ignoring message on managers bus")
                        }
                        Err(e) => tracing::warn!(error = %e, "ignoring undecodable bus message"),
                    }
                }
            }
        }
    }

    /// Try to take or keep the leader lock every `status_check_interval`,
    /// first attempt immediately. The leader also runs the ttl tick.
    async fn status_loop(self: Arc<Self>) {
        loop {
            self.check_leadership().await;
            if self.is_leader() {
                self.tick().await;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.status_check_interval) => {}
            }
        }
    }

    async fn snapshot_loop(self: Arc<Self>) {
        loop {
            if !self.is_leader() && !self.is_inited() {
                tracing::debug!(coordinator = %self.id, "requesting system snapshot");
                self.publish(&BusMessage::SystemStatusRequest).await;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.snapshot_retry_interval) => {}
            }
        }
    }

    async fn check_leadership(&self) {
        let held = match self
            .store
            .acquire_lock(&self.leader_key, self.id.as_str(), self.config.leader_lock_ttl)
            .await
        {
            Ok(held) => held,
            Err(e) => {
                tracing::warn!(error = %e, "leader lock check failed");
                false
            }
        };
        if self.cancel.is_cancelled() {
            return;
        }
        let was_leader = self.is_leader.swap(held, Ordering::AcqRel);
        match (was_leader, held) {
            (false, true) => self.on_elected().await,
            (true, false) => self.on_revoked(),
            _ => {}
        }
    }

    async fn on_elected(&self) {
        {
            let mut state = self.state.lock();
            state.table.reset();
            state.inited = true;
        }
        tracing::info!(coordinator = %self.id, "elected as leader, system reset");
        self.metrics.coordinator_leader.set(1);
        self.refresh_groups();
        self.publish(&BusMessage::SystemSetup(self.id.clone())).await;
        self.emit(CoordinatorEvent::Elected);
    }

    fn on_revoked(&self) {
        self.state.lock().inited = false;
        tracing::info!(coordinator = %self.id, "leadership revoked");
        self.metrics.coordinator_leader.set(0);
        self.emit(CoordinatorEvent::Revoked);
    }

    /// Decrement every ttl and announce the services that ran out. Removal
    /// is applied when the announcement comes back over the bus.
    async fn tick(&self) {
        let dead = self.state.lock().table.tick();
        for uuid in dead {
            tracing::info!(service = %uuid, "service ttl expired");
            self.publish(&BusMessage::ServiceRemove(uuid)).await;
        }
    }

    async fn handle_message(&self, message: BusMessage) {
        let leader = self.is_leader();
        match message {
            BusMessage::ServiceAdd(info) if leader => {
                let events = self.state.lock().table.register(info);
                self.apply_events(events).await;
            }
            BusMessage::ServiceHeartbeat(heartbeat) if leader => {
                let events = self.state.lock().table.heartbeat(heartbeat);
                self.apply_events(events).await;
            }
            BusMessage::ServiceRemove(uuid) if leader => {
                let events = self.state.lock().table.remove(&uuid);
                self.apply_events(events).await;
            }
            BusMessage::GroupMetadata(metadata) if leader => {
                let events = self.state.lock().table.apply_metadata(metadata);
                self.apply_events(events).await;
            }
            BusMessage::SystemStatusRequest if leader => {
                let status = self.snapshot();
                self.publish(&BusMessage::SystemStatus(status)).await;
            }
            BusMessage::GroupUpdate(group) if !leader => {
                self.state.lock().table.upsert_group(group);
                self.refresh_groups();
            }
            BusMessage::SystemUpdate(version) if !leader => {
                let trailing = {
                    let mut state = self.state.lock();
                    state.last_incoming = version;
                    state.inited && state.table.system_version() != version
                };
                if trailing {
                    tracing::debug!(system_version = version, "system version moved, resyncing");
                    self.publish(&BusMessage::SystemStatusRequest).await;
                }
            }
            BusMessage::SystemStatus(status) if !leader => self.adopt_snapshot(status).await,
            BusMessage::ServiceBroadcast(broadcast) => {
                if let Some(channels) = &self.channels {
                    if let Err(e) = apply_channel_broadcast(channels.as_ref(), &broadcast).await {
                        tracing::warn!(kind = %broadcast.kind, error = %e, "failed to apply channel request");
                    }
                }
                self.emit(CoordinatorEvent::Broadcast(broadcast));
            }
            _ => {}
        }
    }

    async fn adopt_snapshot(&self, status: SystemStatus) {
        let version = status.system_version;
        let stale = {
            let mut state = self.state.lock();
            if version < state.last_incoming {
                true
            } else {
                state.table.restore(status);
                state.inited = true;
                false
            }
        };
        if stale {
            tracing::debug!(system_version = version, "snapshot is stale, requesting again");
            self.publish(&BusMessage::SystemStatusRequest).await;
            return;
        }
        tracing::debug!(coordinator = %self.id, system_version = version, "adopted system snapshot");
        self.refresh_groups();
        self.emit(CoordinatorEvent::SystemUpdated(version));
        self.emit(CoordinatorEvent::SystemStatus);
    }

    /// Broadcast and report the consequences of a leader table change.
    #[instrument(level = "debug", skip(self, events), fields(coordinator = %self.id, count = events.len()))]
    async fn apply_events(&self, events: Vec<TableEvent>) {
        let mut outgoing = Vec::new();
        let mut groups_changed = false;
        for event in events {
            match event {
                TableEvent::ServiceAdded(info) => self.emit(CoordinatorEvent::ServiceAdded(info)),
                TableEvent::ServiceRemoved(service) => {
                    self.emit(CoordinatorEvent::ServiceRemoved(service))
                }
                TableEvent::GroupUpdated(group) => outgoing.push(BusMessage::GroupUpdate(group)),
                TableEvent::GroupRemoved(_) => groups_changed = true,
                TableEvent::GroupMetadata(metadata) => {
                    groups_changed = true;
                    self.emit(CoordinatorEvent::GroupMetadata(metadata));
                }
                TableEvent::SystemUpdated(version) => {
                    outgoing.push(BusMessage::SystemUpdate(version));
                    self.emit(CoordinatorEvent::SystemUpdated(version));
                }
                TableEvent::MembersChanged(name) => {
                    if let Some(message) = self.lock_allocation(&name) {
                        outgoing.push(message);
                    }
                }
            }
        }
        if groups_changed {
            self.refresh_groups();
        } else {
            self.update_gauges();
        }
        for message in &outgoing {
            self.publish(message).await;
        }
    }

    /// Partition the buckets over the live members of `group`.
    fn lock_allocation(&self, group: &str) -> Option<BusMessage> {
        let members = self.state.lock().table.members(group);
        if members.is_empty() {
            return None;
        }
        let partition_table = match PartitionAssigner::compute(&members, self.config.bucket_count) {
            Ok(table) => table,
            Err(e) => {
                tracing::error!(group, members = members.len(), error = %e, "failed to allocate buckets");
                return None;
            }
        };
        tracing::info!(group, members = members.len(), "allocating buckets");
        let allocation = LockAllocation {
            group: group.to_string(),
            partition_table,
        };
        match serde_json::to_value(&allocation) {
            Ok(data) => Some(BusMessage::ServiceBroadcast(NamedBroadcast {
                kind: LOCK_ALLOCATION.to_string(),
                data,
            })),
            Err(e) => {
                tracing::error!(group, error = %e, "failed to encode bucket allocation");
                None
            }
        }
    }

    /// Rebuild the shared resource mapping and active segments from the
    /// group table.
    fn refresh_groups(&self) {
        let groups = self.groups();
        let (mapping, segments) = resource_mapping_from_groups(&groups);
        tracing::debug!(
            groups = groups.len(),
            mappings = mapping.len(),
            segments = ?segments,
            "resource mapping rebuilt"
        );
        self.resource_mapping.store(Arc::new(mapping));
        self.segments.store(Arc::new(segments));
        self.update_gauges();
    }

    fn update_gauges(&self) {
        let (services, groups) = {
            let state = self.state.lock();
            (state.table.services().len(), state.table.groups().len())
        };
        self.metrics.services.set(services as i64);
        self.metrics.groups.set(groups as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::messages::{Heartbeat, HeartbeatService, ServiceMetadata};
    use crate::storage::memory_store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn config() -> LiveOpsConfig {
        LiveOpsConfig {
            prefix: "lo".into(),
            bucket_count: 16,
            status_check_interval: Duration::from_millis(100),
            leader_lock_ttl: Duration::from_millis(300),
            snapshot_retry_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn heartbeat(uuid: &str, name: &str, metadata: Option<Value>) -> BusMessage {
        BusMessage::ServiceHeartbeat(Heartbeat {
            service: HeartbeatService {
                uuid: ServiceId::new(uuid),
                name: name.into(),
                version: "1.0.0".into(),
                metadata_version: metadata.as_ref().map(|_| "1.0.0.0".to_string()),
                metadata,
            },
            system_version: 0,
        })
    }

    async fn leader(store: Arc<MemoryStore>) -> Arc<Coordinator> {
        let coordinator = Arc::new(Coordinator::new(store, config()).unwrap());
        coordinator.check_leadership().await;
        assert!(coordinator.is_leader());
        coordinator
    }

    #[tokio::test]
    async fn first_coordinator_is_elected() {
        let store = Arc::new(MemoryStore::new());
        let a = Arc::new(Coordinator::new(store.clone(), config()).unwrap());
        let b = Arc::new(Coordinator::new(store.clone(), config()).unwrap());
        let mut events = a.subscribe();

        a.check_leadership().await;
        b.check_leadership().await;
        assert!(a.is_leader());
        assert!(!b.is_leader());
        assert!(a.is_inited());
        assert_eq!(events.recv().await.unwrap(), CoordinatorEvent::Elected);
        assert_eq!(
            store.lock_holder("lo:service-manager:leader").as_deref(),
            Some(a.id().as_str())
        );
    }

    #[tokio::test]
    async fn election_announces_system_setup() {
        let store = Arc::new(MemoryStore::new());
        let mut bus = store.subscribe("lo:service-manager:nrp").await.unwrap();
        let coordinator = leader(store).await;
        let raw = bus.next().await.unwrap();
        assert_eq!(
            BusMessage::decode(&raw).unwrap(),
            BusMessage::SystemSetup(coordinator.id().clone())
        );
    }

    #[tokio::test]
    async fn leader_registers_from_heartbeat_and_allocates_buckets() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = leader(store.clone()).await;
        let mut bus = store.subscribe("lo:service-manager:nrp").await.unwrap();
        let mut events = coordinator.subscribe();

        coordinator.handle_message(heartbeat("s1", "shop", None)).await;

        assert_eq!(coordinator.services().len(), 1);
        assert_eq!(coordinator.group("shop").unwrap().leader, ServiceId::new("s1"));
        assert!(matches!(events.recv().await.unwrap(), CoordinatorEvent::ServiceAdded(_)));

        let mut kinds = Vec::new();
        let mut allocation = None;
        for _ in 0..3 {
            let message = BusMessage::decode(&bus.next().await.unwrap()).unwrap();
            kinds.push(message.kind());
            if let BusMessage::ServiceBroadcast(b) = message {
                allocation = Some(serde_json::from_value::<LockAllocation>(b.data).unwrap());
            }
        }
        assert_eq!(kinds, vec!["group-update", "system-update", "service-broadcast"]);
        let allocation = allocation.unwrap();
        assert_eq!(allocation.group, "shop");
        assert_eq!(allocation.partition_table[&ServiceId::new("s1")], (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn followers_ignore_heartbeats() {
        let store = Arc::new(MemoryStore::new());
        let follower = Coordinator::new(store, config()).unwrap();
        follower.handle_message(heartbeat("s1", "shop", None)).await;
        assert!(follower.services().is_empty());
    }

    #[tokio::test]
    async fn tick_announces_expired_services() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(
            Coordinator::new(
                store.clone(),
                LiveOpsConfig {
                    default_ttl: 1,
                    max_ttl: 1,
                    ..config()
                },
            )
            .unwrap(),
        );
        coordinator.check_leadership().await;
        coordinator.handle_message(heartbeat("s1", "shop", None)).await;

        let mut bus = store.subscribe("lo:service-manager:nrp").await.unwrap();
        coordinator.tick().await;
        let message = BusMessage::decode(&bus.next().await.unwrap()).unwrap();
        assert_eq!(message, BusMessage::ServiceRemove(ServiceId::new("s1")));

        coordinator.handle_message(message).await;
        assert!(coordinator.services().is_empty());
        assert!(coordinator.groups().is_empty());
    }

    #[tokio::test]
    async fn metadata_rebuilds_resource_mapping() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = leader(store).await;
        let mut set = ActionMappingSet::new();
        set.add_rules("SHOP/BUY", ["account:{client}"]).unwrap();
        let metadata = ServiceMetadata {
            resources: set.serialize().unwrap(),
            segment: Some("eu".into()),
        };

        coordinator
            .handle_message(heartbeat("s1", "shop", Some(metadata.to_value().unwrap())))
            .await;

        assert!(coordinator.resource_mapping().load().contains("SHOP/BUY"));
        assert!(coordinator.active_segments().contains("eu"));
    }

    #[tokio::test]
    async fn follower_adopts_snapshot_and_rejects_stale_ones() {
        let store = Arc::new(MemoryStore::new());
        let follower = Coordinator::new(store, config()).unwrap();
        let mut events = follower.subscribe();

        follower.handle_message(BusMessage::SystemUpdate(5)).await;
        follower
            .handle_message(BusMessage::SystemStatus(SystemStatus {
                system_version: 4,
                ..Default::default()
            }))
            .await;
        assert!(!follower.is_inited());

        follower
            .handle_message(BusMessage::SystemStatus(SystemStatus {
                system_version: 5,
                ..Default::default()
            }))
            .await;
        assert!(follower.is_inited());
        assert_eq!(follower.system_version(), 5);
        assert_eq!(events.recv().await.unwrap(), CoordinatorEvent::SystemUpdated(5));
        assert_eq!(events.recv().await.unwrap(), CoordinatorEvent::SystemStatus);
    }

    #[tokio::test]
    async fn trailing_follower_requests_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let follower = Coordinator::new(store.clone(), config()).unwrap();
        follower
            .handle_message(BusMessage::SystemStatus(SystemStatus {
                system_version: 2,
                ..Default::default()
            }))
            .await;

        let mut bus = store.subscribe("lo:service-manager:nrp").await.unwrap();
        follower.handle_message(BusMessage::SystemUpdate(3)).await;
        let message = BusMessage::decode(&bus.next().await.unwrap()).unwrap();
        assert_eq!(message, BusMessage::SystemStatusRequest);
    }

    #[tokio::test]
    async fn broadcasts_surface_as_events() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(Coordinator::new(store, config()).unwrap());
        coordinator.start().await.unwrap();
        let mut events = coordinator.subscribe();

        coordinator
            .broadcast_to_managers("drain", json!({ "world": 1 }))
            .await
            .unwrap();
        let event = loop {
            match events.recv().await.unwrap() {
                CoordinatorEvent::Broadcast(b) => break b,
                _ => continue,
            }
        };
        assert_eq!(event.kind, "drain");
        assert_eq!(event.data, json!({ "world": 1 }));
        coordinator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_releases_leadership() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(Coordinator::new(store.clone(), config()).unwrap());
        coordinator.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !coordinator.is_leader() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        coordinator.shutdown().await.unwrap();
        assert!(!coordinator.is_leader());
        assert!(store.lock_holder("lo:service-manager:leader").is_none());
    }
}
