use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::action::Action;
use crate::error::LiveOpsError;
use crate::membership::messages::{ServiceGroup, ServiceMetadata};
use crate::queue::ShardedWorkQueue;
use crate::routing::ActionMappingSet;
use crate::types::BucketKey;

/// Resource mapping shared between the component that rebuilds it from group
/// metadata and every emitter reading it.
pub type SharedResourceMapping = Arc<ArcSwap<ActionMappingSet>>;

pub fn shared_resource_mapping(set: ActionMappingSet) -> SharedResourceMapping {
    Arc::new(ArcSwap::from_pointee(set))
}

/// Merge the resource mappings of every group that published metadata, in
/// group order, and collect the segments they serve.
///
/// Metadata that does not decode or holds an invalid mapping is logged and
/// skipped; the other groups still contribute.
pub fn resource_mapping_from_groups(groups: &[ServiceGroup]) -> (ActionMappingSet, BTreeSet<String>) {
    let mut set = ActionMappingSet::new();
    let mut segments = BTreeSet::new();
    for group in groups {
        let Some(value) = &group.metadata else {
            continue;
        };
        let metadata = match ServiceMetadata::from_value(value) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(group = %group.name, error = %e, "ignoring undecodable group metadata");
                continue;
            }
        };
        if let Err(e) = set.merge(&metadata.resources) {
            tracing::warn!(group = %group.name, error = %e, "ignoring invalid group resource mapping");
            continue;
        }
        if let Some(segment) = metadata.segment {
            segments.insert(segment);
        }
    }
    (set, segments)
}

/// Puts actions on the work queue, routed by their resource.
///
/// Every action must resolve to exactly one resource through the current
/// resource mapping; the segment comes from the action type.
#[derive(Clone)]
pub struct ActionEmitter {
    queue: Arc<ShardedWorkQueue>,
    resource_mapping: SharedResourceMapping,
}

impl ActionEmitter {
    pub fn new(queue: Arc<ShardedWorkQueue>, resource_mapping: SharedResourceMapping) -> Self {
        Self {
            queue,
            resource_mapping,
        }
    }

    pub fn queue(&self) -> &Arc<ShardedWorkQueue> {
        &self.queue
    }

    pub fn resource_mapping(&self) -> Arc<ActionMappingSet> {
        self.resource_mapping.load_full()
    }

    pub fn set_resource_mapping(&self, set: ActionMappingSet) {
        self.resource_mapping.store(Arc::new(set));
    }

    /// Enqueue `action` on the bucket of its resource.
    ///
    /// Fails with a configuration error when the action type is unmapped or
    /// resolves to zero or several resources, and with a store error when the
    /// push fails.
    pub async fn enqueue(&self, action: Action) -> Result<BucketKey, LiveOpsError> {
        let resource = self.resource_mapping.load().resolve_resource(&action)?;
        let segment = action.action_type.segment();
        self.queue
            .enqueue(action.client.clone(), action, &resource, segment.as_deref())
            .await
    }

    /// Enqueue `action` on behalf of `client`.
    pub async fn enqueue_client(&self, client: &str, action: Action) -> Result<BucketKey, LiveOpsError> {
        if client.is_empty() {
            return Err(LiveOpsError::MalformedAction {
                reason: format!("client-based actions require a client: {}", action.action_type),
                source: None,
            });
        }
        self.enqueue(action.with_client(client)).await
    }
}
