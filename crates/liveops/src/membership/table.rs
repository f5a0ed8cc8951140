use chrono::Utc;
use tracing::instrument;

use crate::membership::messages::{
    GroupMetadataMessage, Heartbeat, ManagedService, ServiceGroup, ServiceInfo, SystemStatus,
};
use crate::types::ServiceId;

/// A change produced by applying an input to the [`MembershipTable`].
#[derive(Debug, Clone, PartialEq)]
pub enum TableEvent {
    ServiceAdded(ServiceInfo),
    ServiceRemoved(ManagedService),
    GroupUpdated(ServiceGroup),
    GroupRemoved(String),
    GroupMetadata(GroupMetadataMessage),
    SystemUpdated(u64),
    /// The member list of the named group changed; partitions must be
    /// recomputed.
    MembersChanged(String),
}

/// Service and group tables plus the global system version.
///
/// Pure state: every mutation returns the events it caused and never touches
/// the bus. Services and groups keep registration order, which decides
/// leader reassignment and partition order.
#[derive(Debug, Clone)]
pub struct MembershipTable {
    services: Vec<ManagedService>,
    groups: Vec<ServiceGroup>,
    system_version: u64,
    default_ttl: u32,
    max_ttl: u32,
}

impl MembershipTable {
    pub fn new(default_ttl: u32, max_ttl: u32) -> Self {
        Self {
            services: Vec::new(),
            groups: Vec::new(),
            system_version: 0,
            default_ttl,
            max_ttl,
        }
    }

    pub fn system_version(&self) -> u64 {
        self.system_version
    }

    pub fn services(&self) -> &[ManagedService] {
        &self.services
    }

    pub fn groups(&self) -> &[ServiceGroup] {
        &self.groups
    }

    pub fn service(&self, uuid: &ServiceId) -> Option<&ManagedService> {
        self.services.iter().find(|s| &s.uuid == uuid)
    }

    pub fn group(&self, name: &str) -> Option<&ServiceGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Live members of a group in registration order.
    pub fn members(&self, name: &str) -> Vec<ServiceId> {
        self.services
            .iter()
            .filter(|s| s.name == name)
            .map(|s| s.uuid.clone())
            .collect()
    }

    /// Drop every service and group; the system version is kept.
    pub fn reset(&mut self) {
        self.services.clear();
        self.groups.clear();
    }

    pub fn snapshot(&self) -> SystemStatus {
        SystemStatus {
            system_version: self.system_version,
            services: self.services.clone(),
            groups: self.groups.clone(),
        }
    }

    pub fn restore(&mut self, status: SystemStatus) {
        self.system_version = status.system_version;
        self.services = status.services;
        self.groups = status.groups;
    }

    /// Register a new service. A known uuid is a protocol violation and
    /// leaves the tables untouched.
    pub fn register(&mut self, info: ServiceInfo) -> Vec<TableEvent> {
        if self.service(&info.uuid).is_some() {
            tracing::warn!(
                service = %info.uuid,
                name = %info.name,
                "existing service registered again"
            );
            return Vec::new();
        }

        self.services.push(ManagedService {
            uuid: info.uuid.clone(),
            name: info.name.clone(),
            version: info.version.clone(),
            ttl: self.default_ttl,
            system_version: self.system_version,
            registered_at: Utc::now(),
        });
        tracing::info!(service = %info.uuid, name = %info.name, "service added");

        let name = info.name.clone();
        let mut events = vec![TableEvent::ServiceAdded(info.clone())];
        if self.group(&name).is_some() {
            events.extend(self.update_group(&name));
        } else {
            let group = ServiceGroup {
                name: name.clone(),
                leader: info.uuid,
                version: info.version,
                system_version: self.system_version,
                metadata_version: None,
                metadata: None,
            };
            tracing::info!(group = %name, leader = %group.leader, "group created");
            self.groups.push(group.clone());
            events.push(TableEvent::GroupUpdated(group));
            events.push(self.update_system());
        }
        events.push(TableEvent::MembersChanged(name));
        events
    }

    /// Apply a heartbeat: registers unknown services, refreshes the ttl of
    /// known ones and recomputes the group when the reported system version
    /// changed.
    pub fn heartbeat(&mut self, heartbeat: Heartbeat) -> Vec<TableEvent> {
        let Heartbeat {
            service,
            system_version,
        } = heartbeat;
        let metadata = match (&service.metadata_version, &service.metadata) {
            (Some(version), Some(metadata)) => Some(GroupMetadataMessage {
                name: service.name.clone(),
                metadata_version: version.clone(),
                metadata: metadata.clone(),
            }),
            _ => None,
        };

        if self.service(&service.uuid).is_none() {
            let mut events = self.register(service.info());
            if let Some(metadata) = metadata {
                if self.accepts_metadata_from(&service.uuid, &metadata.name) {
                    events.extend(self.apply_metadata(metadata));
                }
            }
            return events;
        }

        let mut events = Vec::new();
        if let Some(metadata) = metadata {
            if self.accepts_metadata_from(&service.uuid, &metadata.name) {
                events.extend(self.apply_metadata(metadata));
            }
        }

        let max_ttl = self.max_ttl;
        let mut changed_group = None;
        if let Some(managed) = self.services.iter_mut().find(|s| s.uuid == service.uuid) {
            managed.ttl = (managed.ttl + 1).min(max_ttl);
            if managed.system_version != system_version {
                managed.system_version = system_version;
                changed_group = Some(managed.name.clone());
            }
        }
        if let Some(name) = changed_group {
            events.extend(self.update_group(&name));
        }
        events
    }

    /// Heartbeat metadata is taken from the group leader, or from anyone
    /// while the group has none yet.
    fn accepts_metadata_from(&self, uuid: &ServiceId, group: &str) -> bool {
        self.group(group)
            .is_some_and(|g| &g.leader == uuid || g.metadata_version.is_none())
    }

    /// Store group metadata when its version differs from the recorded one.
    pub fn apply_metadata(&mut self, message: GroupMetadataMessage) -> Vec<TableEvent> {
        let Some(group) = self.groups.iter_mut().find(|g| g.name == message.name) else {
            tracing::warn!(group = %message.name, "metadata for unknown group");
            return Vec::new();
        };
        if group.metadata_version.as_deref() == Some(message.metadata_version.as_str()) {
            return Vec::new();
        }
        group.metadata_version = Some(message.metadata_version.clone());
        group.metadata = Some(message.metadata.clone());
        tracing::info!(
            group = %message.name,
            metadata_version = %message.metadata_version,
            "group metadata updated"
        );
        vec![TableEvent::GroupMetadata(message), self.update_system()]
    }

    /// Remove a service and recompute its group.
    pub fn remove(&mut self, uuid: &ServiceId) -> Vec<TableEvent> {
        let Some(index) = self.services.iter().position(|s| &s.uuid == uuid) else {
            return Vec::new();
        };
        let removed = self.services.remove(index);
        tracing::info!(service = %removed.uuid, name = %removed.name, "service removed");
        let name = removed.name.clone();
        let mut events = vec![TableEvent::ServiceRemoved(removed)];
        events.extend(self.update_group(&name));
        events.push(TableEvent::MembersChanged(name));
        events
    }

    /// Decrement every ttl and return the services that ran out.
    pub fn tick(&mut self) -> Vec<ServiceId> {
        self.services
            .iter_mut()
            .filter_map(|s| {
                s.ttl = s.ttl.saturating_sub(1);
                (s.ttl == 0).then(|| s.uuid.clone())
            })
            .collect()
    }

    /// Insert or replace a group as broadcast by the leader.
    pub fn upsert_group(&mut self, group: ServiceGroup) {
        match self.groups.iter_mut().find(|g| g.name == group.name) {
            Some(existing) => *existing = group,
            None => self.groups.push(group),
        }
    }

    /// Recompute a group after its membership or member versions changed.
    ///
    /// The group adopts a version or system version only when every member
    /// agrees on it. A dead leader is replaced by the first remaining member.
    /// An empty group is deleted.
    #[instrument(level = "debug", skip(self), fields(system_version = self.system_version))]
    pub fn update_group(&mut self, name: &str) -> Vec<TableEvent> {
        let members: Vec<&ManagedService> =
            self.services.iter().filter(|s| s.name == name).collect();

        let Some(first) = members.first() else {
            self.groups.retain(|g| g.name != name);
            tracing::info!(group = %name, "group removed");
            return vec![TableEvent::GroupRemoved(name.to_string()), self.update_system()];
        };

        let common_version = members
            .iter()
            .all(|s| s.version == first.version)
            .then(|| first.version.clone());
        let common_system_version = members
            .iter()
            .all(|s| s.system_version == first.system_version)
            .then_some(first.system_version);
        let first_uuid = first.uuid.clone();
        let live: Vec<ServiceId> = members.iter().map(|s| s.uuid.clone()).collect();

        let Some(group) = self.groups.iter_mut().find(|g| g.name == name) else {
            return Vec::new();
        };

        let mut updated = false;
        let mut system_updated = false;

        if let Some(version) = common_system_version {
            if group.system_version != version {
                group.system_version = version;
                updated = true;
                tracing::debug!(group = %name, system_version = version, "group system version updated");
            }
        }

        if let Some(version) = common_version {
            if group.version != version {
                tracing::info!(group = %name, version = %version, "group version updated");
                group.version = version;
                updated = true;
                system_updated = true;
            }
        }

        if !live.contains(&group.leader) {
            tracing::info!(group = %name, old = %group.leader, new = %first_uuid, "group leader reassigned");
            group.leader = first_uuid;
            updated = true;
            system_updated = true;
        }

        let mut events = Vec::new();
        if updated {
            events.push(TableEvent::GroupUpdated(group.clone()));
            if system_updated {
                events.push(self.update_system());
            }
        }
        events
    }

    fn update_system(&mut self) -> TableEvent {
        self.system_version += 1;
        tracing::debug!(system_version = self.system_version, "system version updated");
        TableEvent::SystemUpdated(self.system_version)
    }
}
