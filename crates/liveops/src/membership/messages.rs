use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LiveOpsError;
use crate::routing::SerializedActionMappingSet;
use crate::types::ServiceId;

/// Named broadcast kind carrying a partition table.
pub const LOCK_ALLOCATION: &str = "lock-allocation";
pub const CHANNEL_JOIN: &str = "channel-join";
pub const CHANNEL_LEAVE: &str = "channel-leave";

/// Bus scope shared by coordinators and service instances.
pub fn services_scope(prefix: &str) -> String {
    format!("{prefix}:service-manager:nrp")
}

/// Bus scope used only between coordinators.
pub fn managers_scope(prefix: &str) -> String {
    format!("{prefix}:service-manager:nrp-managers")
}

pub fn leader_lock_key(prefix: &str) -> String {
    format!("{prefix}:service-manager:leader")
}

/// Identity a service announces on registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub uuid: ServiceId,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatService {
    pub uuid: ServiceId,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub metadata_version: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl HeartbeatService {
    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            uuid: self.uuid.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub service: HeartbeatService,
    pub system_version: u64,
}

/// A live service as tracked by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedService {
    pub uuid: ServiceId,
    pub name: String,
    pub version: String,
    /// Coordinator ticks left before the service is considered dead.
    pub ttl: u32,
    pub system_version: u64,
    pub registered_at: DateTime<Utc>,
}

/// All live services sharing one logical name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceGroup {
    pub name: String,
    pub leader: ServiceId,
    pub version: String,
    pub system_version: u64,
    #[serde(default)]
    pub metadata_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMetadataMessage {
    pub name: String,
    pub metadata_version: String,
    pub metadata: Value,
}

/// What a service publishes as its group metadata: its resource mappings
/// and the queue segment it serves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMetadata {
    #[serde(flatten)]
    pub resources: SerializedActionMappingSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<String>,
}

impl ServiceMetadata {
    pub fn to_value(&self) -> Result<Value, LiveOpsError> {
        serde_json::to_value(self).map_err(|e| LiveOpsError::malformed("failed to encode service metadata", e))
    }

    pub fn from_value(value: &Value) -> Result<Self, LiveOpsError> {
        Self::deserialize(value).map_err(|e| LiveOpsError::malformed("failed to decode service metadata", e))
    }
}

/// Full coordinator snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub system_version: u64,
    pub services: Vec<ManagedService>,
    pub groups: Vec<ServiceGroup>,
}

/// Arbitrary named event relayed to every listener without interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedBroadcast {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Payload of a [`LOCK_ALLOCATION`] broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockAllocation {
    pub group: String,
    pub partition_table: BTreeMap<ServiceId, Vec<u32>>,
}

/// Payload of [`CHANNEL_JOIN`] and [`CHANNEL_LEAVE`] broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelChange {
    pub session: String,
    pub channel: Vec<String>,
}

/// Everything that travels over the coordinator buses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum BusMessage {
    ServiceAdd(ServiceInfo),
    ServiceHeartbeat(Heartbeat),
    ServiceRemove(ServiceId),
    GroupUpdate(ServiceGroup),
    GroupMetadata(GroupMetadataMessage),
    /// Sent by a newly elected coordinator; carries its id.
    SystemSetup(ServiceId),
    SystemUpdate(u64),
    SystemStatus(SystemStatus),
    SystemStatusRequest,
    ServiceBroadcast(NamedBroadcast),
    ManagerBroadcast(NamedBroadcast),
}

impl BusMessage {
    pub fn encode(&self) -> Result<String, LiveOpsError> {
        serde_json::to_string(self).map_err(|e| LiveOpsError::malformed("failed to encode bus message", e))
    }

    pub fn decode(raw: &str) -> Result<Self, LiveOpsError> {
        serde_json::from_str(raw).map_err(|e| LiveOpsError::malformed("failed to decode bus message", e))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BusMessage::ServiceAdd(_) => "service-add",
            BusMessage::ServiceHeartbeat(_) => "service-heartbeat",
            BusMessage::ServiceRemove(_) => "service-remove",
            BusMessage::GroupUpdate(_) => "group-update",
            BusMessage::GroupMetadata(_) => "group-metadata",
            BusMessage::SystemSetup(_) => "system-setup",
            BusMessage::SystemUpdate(_) => "system-update",
            BusMessage::SystemStatus(_) => "system-status",
            BusMessage::SystemStatusRequest => "system-status-request",
            BusMessage::ServiceBroadcast(_) => "service-broadcast",
            BusMessage::ManagerBroadcast(_) => "manager-broadcast",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn heartbeat_wire_shape() {
        let msg = BusMessage::ServiceHeartbeat(Heartbeat {
            service: HeartbeatService {
                uuid: ServiceId::new("u1"),
                name: "shop".into(),
                version: "1.0.0".into(),
                metadata_version: Some("1.0.0.0".into()),
                metadata: Some(json!({ "mappings": [] })),
            },
            system_version: 4,
        });
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "service-heartbeat",
                "data": {
                    "service": {
                        "uuid": "u1",
                        "name": "shop",
                        "version": "1.0.0",
                        "metadataVersion": "1.0.0.0",
                        "metadata": { "mappings": [] }
                    },
                    "systemVersion": 4
                }
            })
        );
    }

    #[test]
    fn unit_and_scalar_variants_round_trip() {
        for msg in [
            BusMessage::SystemStatusRequest,
            BusMessage::SystemUpdate(9),
            BusMessage::ServiceRemove(ServiceId::new("u1")),
        ] {
            let raw = msg.encode().unwrap();
            assert_eq!(BusMessage::decode(&raw).unwrap(), msg);
        }
        let raw = BusMessage::SystemUpdate(9).encode().unwrap();
        assert_eq!(raw, r#"{"type":"system-update","data":9}"#);
    }

    #[test]
    fn lock_allocation_wire_shape() {
        let mut table = BTreeMap::new();
        table.insert(ServiceId::new("a"), vec![0, 1]);
        let data = serde_json::to_value(LockAllocation {
            group: "shop".into(),
            partition_table: table,
        })
        .unwrap();
        assert_eq!(data, json!({ "group": "shop", "partitionTable": { "a": [0, 1] } }));
    }

    #[test]
    fn unknown_message_type_is_malformed() {
        let err = BusMessage::decode(r#"{"type":"bogus","data":1}"#).unwrap_err();
        assert!(matches!(err, LiveOpsError::MalformedAction { .. }));
    }

    #[test]
    fn kind_matches_wire_tag() {
        let msg = BusMessage::ServiceBroadcast(NamedBroadcast {
            kind: LOCK_ALLOCATION.into(),
            data: json!({}),
        });
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], msg.kind());
        assert_eq!(value["data"]["type"], "lock-allocation");
    }

    #[test]
    fn service_metadata_is_flat() {
        let metadata = ServiceMetadata {
            resources: SerializedActionMappingSet::default(),
            segment: Some("eu".into()),
        };
        let value = metadata.to_value().unwrap();
        assert_eq!(value, json!({ "mappings": [], "segment": "eu" }));
        assert_eq!(ServiceMetadata::from_value(&value).unwrap(), metadata);
    }

    #[test]
    fn scopes() {
        assert_eq!(services_scope("lo"), "lo:service-manager:nrp");
        assert_eq!(managers_scope("lo"), "lo:service-manager:nrp-managers");
        assert_eq!(leader_lock_key("lo"), "lo:service-manager:leader");
    }
}
