//! The service surface: declare actions with their routing, reducer and
//! triggers, then run them as one member of a service group.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::action::Action;
use crate::channels::BroadcastChannelMembership;
use crate::config::LiveOpsConfig;
use crate::emitter::{resource_mapping_from_groups, shared_resource_mapping, ActionEmitter};
use crate::error::LiveOpsError;
use crate::instance::{InstanceEvent, MetadataProvider, ServiceInstance};
use crate::membership::messages::ServiceMetadata;
use crate::metrics::LiveOpsMetrics;
use crate::queue::{ShardedWorkQueue, SideEffectQueue};
use crate::reducer::{ActionReducer, ChannelPolicy, ReducerFn};
use crate::routing::mapping::{ActionMapping, CustomMapper};
use crate::routing::rule::MappingRule;
use crate::routing::{ActionMappingSet, SerializedActionMappingSet};
use crate::side_effects::{SideEffectProcessor, TriggerFn};
use crate::store::SharedStore;
use crate::tasks::BackgroundTasks;
use crate::types::ActionType;

pub const DEFAULT_RESOURCE: &str = "account:{client}";

/// Channels an action is delivered on.
#[derive(Clone)]
pub enum ChannelSpec {
    /// No channel, even when a resource is given.
    Disabled,
    Templates(Vec<String>),
    Custom(CustomMapper),
}

/// Declaration of one action type.
///
/// Without an explicit channel the action is delivered on its explicit
/// resource; the default `account:{client}` resource is never used as a
/// channel.
#[derive(Clone, Default)]
pub struct ActionDescriptor {
    resource: Option<String>,
    channel: Option<ChannelSpec>,
    reducer: Option<ReducerFn>,
    triggers: Vec<TriggerFn>,
    auto_join: bool,
    auto_leave: bool,
    segment: Option<String>,
}

impl ActionDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource(mut self, template: impl Into<String>) -> Self {
        self.resource = Some(template.into());
        self
    }

    pub fn channel(mut self, channel: ChannelSpec) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn channels<I>(self, templates: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.channel(ChannelSpec::Templates(
            templates.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn custom_channel<F>(self, mapper: F) -> Self
    where
        F: Fn(&Action) -> Vec<String> + Send + Sync + 'static,
    {
        self.channel(ChannelSpec::Custom(Arc::new(mapper)))
    }

    pub fn no_channel(self) -> Self {
        self.channel(ChannelSpec::Disabled)
    }

    pub fn reducer(mut self, reducer: ReducerFn) -> Self {
        self.reducer = Some(reducer);
        self
    }

    pub fn trigger(mut self, trigger: TriggerFn) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn auto_join(mut self) -> Self {
        self.auto_join = true;
        self
    }

    pub fn auto_leave(mut self) -> Self {
        self.auto_leave = true;
        self
    }

    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = Some(segment.into());
        self
    }
}

/// A declared action after defaults are applied.
struct DeclaredAction {
    name: ActionType,
    resource: Option<String>,
    channel: Option<ActionMapping>,
    reducer: Option<ReducerFn>,
    triggers: Vec<TriggerFn>,
    policy: ChannelPolicy,
}

impl DeclaredAction {
    fn resolve(
        name: ActionType,
        descriptor: ActionDescriptor,
        service_segment: Option<&str>,
    ) -> Result<Self, LiveOpsError> {
        let segment = descriptor.segment.clone().or_else(|| name.segment());
        let routed = descriptor.reducer.is_some() || segment.as_deref() == service_segment;

        let (resource, channel) = if routed {
            let resource = descriptor
                .resource
                .clone()
                .unwrap_or_else(|| DEFAULT_RESOURCE.to_string());
            // A resource must be a single, well-formed template.
            MappingRule::parse(resource.as_str())?;
            let channel = match descriptor.channel {
                Some(ChannelSpec::Disabled) => None,
                Some(ChannelSpec::Templates(templates)) if templates.is_empty() => None,
                Some(ChannelSpec::Templates(templates)) => {
                    Some(ActionMapping::from_rules([name.clone()], templates)?)
                }
                Some(ChannelSpec::Custom(mapper)) => {
                    Some(ActionMapping::custom([name.clone()], move |a: &Action| mapper(a))?)
                }
                None => match &descriptor.resource {
                    Some(resource) => Some(ActionMapping::from_rules([name.clone()], [resource.clone()])?),
                    None => None,
                },
            };
            (Some(resource), channel)
        } else {
            (None, None)
        };

        Ok(Self {
            name,
            resource,
            channel,
            reducer: descriptor.reducer,
            triggers: descriptor.triggers,
            policy: ChannelPolicy {
                auto_join: descriptor.auto_join,
                auto_leave: descriptor.auto_leave,
            },
        })
    }
}

/// Options of a [`ResourceScope`].
#[derive(Debug, Clone)]
pub struct ResourceScopeOptions {
    pub extra_channels: Vec<String>,
    /// Also deliver every action on the resource itself.
    pub use_as_channel: bool,
}

impl Default for ResourceScopeOptions {
    fn default() -> Self {
        Self {
            extra_channels: Vec::new(),
            use_as_channel: true,
        }
    }
}

/// Declares several actions routed to one resource.
pub struct ResourceScope<'a> {
    service: &'a mut LiveOpsService,
    resource: String,
    options: ResourceScopeOptions,
}

impl<'a> ResourceScope<'a> {
    pub fn action(
        self,
        name: impl Into<ActionType>,
        mut descriptor: ActionDescriptor,
    ) -> Result<Self, LiveOpsError> {
        let channel = match descriptor.channel.take() {
            Some(ChannelSpec::Custom(mapper)) => Some(ChannelSpec::Custom(mapper)),
            declared => {
                let mut channels = match declared {
                    Some(ChannelSpec::Templates(templates)) => templates,
                    _ => Vec::new(),
                };
                channels.extend(self.options.extra_channels.iter().cloned());
                if self.options.use_as_channel {
                    channels.push(self.resource.clone());
                }
                Some(ChannelSpec::Templates(channels))
            }
        };
        descriptor.channel = channel;
        descriptor.resource = Some(self.resource.clone());
        self.service.action(name, descriptor)?;
        Ok(self)
    }

    /// Switch to another resource.
    pub fn resource(self, resource: impl Into<String>, options: ResourceScopeOptions) -> ResourceScope<'a> {
        ResourceScope {
            service: self.service,
            resource: resource.into(),
            options,
        }
    }

    pub fn end(self) -> &'a mut LiveOpsService {
        self.service
    }
}

/// The action declarations of one service, not yet running.
///
/// ```ignore
/// let mut service = LiveOpsService::new(store, config);
/// service.action("SHOP/BUY", ActionDescriptor::new().reducer(buy))?;
/// let running = service.start("shop", "1.0.0").await?;
/// ```
pub struct LiveOpsService {
    store: Arc<dyn SharedStore>,
    config: LiveOpsConfig,
    actions: BTreeMap<ActionType, DeclaredAction>,
    metrics: Arc<LiveOpsMetrics>,
}

impl LiveOpsService {
    pub fn new(store: Arc<dyn SharedStore>, config: LiveOpsConfig) -> Self {
        Self {
            store,
            config,
            actions: BTreeMap::new(),
            metrics: Arc::new(LiveOpsMetrics::unregistered()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<LiveOpsMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn segment(&self) -> Option<&str> {
        self.config.segment.as_deref()
    }

    /// Declare an action. Each name may be declared once.
    pub fn action(
        &mut self,
        name: impl Into<ActionType>,
        descriptor: ActionDescriptor,
    ) -> Result<&mut Self, LiveOpsError> {
        let name = name.into();
        if self.actions.contains_key(&name) {
            return Err(LiveOpsError::DuplicateAction { action_type: name });
        }
        let declared = DeclaredAction::resolve(name.clone(), descriptor, self.segment())?;
        self.actions.insert(name, declared);
        Ok(self)
    }

    pub fn resource(&mut self, resource: impl Into<String>, options: ResourceScopeOptions) -> ResourceScope<'_> {
        ResourceScope {
            service: self,
            resource: resource.into(),
            options,
        }
    }

    /// Resources of the declared actions, as published in group metadata.
    pub fn resource_mapping(&self) -> Result<ActionMappingSet, LiveOpsError> {
        let mut set = ActionMappingSet::new();
        for action in self.actions.values() {
            if let Some(resource) = &action.resource {
                set.add_rules(action.name.as_str(), [resource.clone()])?;
            }
        }
        Ok(set)
    }

    pub fn channel_mapping(&self) -> ActionMappingSet {
        let mut set = ActionMappingSet::new();
        for action in self.actions.values() {
            if let Some(channel) = &action.channel {
                set.add(channel.clone());
            }
        }
        set
    }

    pub fn metadata(&self) -> Result<ServiceMetadata, LiveOpsError> {
        Ok(ServiceMetadata {
            resources: self.resource_mapping()?.serialize()?,
            segment: self.config.segment.clone(),
        })
    }

    /// Register as a member of group `name` and start reducing and
    /// triggering.
    pub async fn start(
        self,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<RunningService, LiveOpsError> {
        self.config.validate()?;
        let own_resources = self.resource_mapping()?.serialize()?;
        let metadata = self.metadata()?.to_value()?;
        let provider: MetadataProvider = Arc::new(move || {
            let metadata = metadata.clone();
            async move { Ok(metadata) }.boxed()
        });

        let instance = Arc::new(
            ServiceInstance::new(Arc::clone(&self.store), self.config.clone(), name, version, provider)?,
        );

        let queue = Arc::new(ShardedWorkQueue::new(
            Arc::clone(&self.store),
            self.config.prefix.clone(),
            self.config.bucket_count,
        ));
        let mapping = ActionMappingSet::from_serialized(&own_resources)?;
        let emitter = ActionEmitter::new(Arc::clone(&queue), shared_resource_mapping(mapping));
        let side_effect_queue = Arc::new(SideEffectQueue::new(
            Arc::clone(&self.store),
            &self.config.prefix,
            self.config.segment.as_deref(),
        ));
        let channels = Arc::new(BroadcastChannelMembership::new(
            Arc::clone(&self.store),
            &self.config.prefix,
        ));

        let channel_mapping = self.channel_mapping();
        let mut reducer = ActionReducer::new(
            Arc::clone(&self.store),
            self.config.clone(),
            emitter.clone(),
            side_effect_queue.clone(),
            channels,
        )
        .with_metrics(Arc::clone(&self.metrics))
        .with_channel_mapping(channel_mapping);
        let side_effects = SideEffectProcessor::new(side_effect_queue, emitter.clone(), &self.config)
            .with_metrics(Arc::clone(&self.metrics));

        for action in self.actions.into_values() {
            if let Some(handler) = action.reducer {
                reducer = reducer.reducer(action.name.as_str(), handler);
            }
            if action.policy != ChannelPolicy::default() {
                reducer = reducer.channel_policy(action.name.as_str(), action.policy);
            }
            for trigger in action.triggers {
                side_effects.on(action.name.clone(), trigger);
            }
        }

        let running = RunningService {
            instance,
            emitter,
            reducer: Arc::new(reducer),
            side_effects: Arc::new(side_effects),
            shutdown_timeout: self.config.shutdown_timeout,
            cancel: CancellationToken::new(),
            background_tasks: BackgroundTasks::default(),
        };
        let follower = GroupFollower {
            instance: Arc::clone(&running.instance),
            emitter: running.emitter.clone(),
            own_resources,
            segment: self.config.segment,
            metrics: self.metrics,
        };
        running.start(follower).await?;
        Ok(running)
    }
}

/// A started service: its group membership, reducer and trigger processor.
pub struct RunningService {
    instance: Arc<ServiceInstance>,
    emitter: ActionEmitter,
    reducer: Arc<ActionReducer>,
    side_effects: Arc<SideEffectProcessor>,
    shutdown_timeout: std::time::Duration,
    cancel: CancellationToken,
    background_tasks: BackgroundTasks,
}

impl RunningService {
    async fn start(&self, follower: GroupFollower) -> Result<(), LiveOpsError> {
        // Subscribe before the instance announces itself, so the first
        // allocation is not missed.
        let events = self.instance.subscribe();
        let cancel = self.cancel.clone();
        self.background_tasks
            .push(tokio::spawn(follower.run(events, cancel)))
            .await;
        self.instance.start().await?;
        self.reducer.start().await;
        self.side_effects.start().await;
        Ok(())
    }

    pub fn instance(&self) -> &Arc<ServiceInstance> {
        &self.instance
    }

    pub fn emitter(&self) -> &ActionEmitter {
        &self.emitter
    }

    pub fn queue(&self) -> &Arc<ShardedWorkQueue> {
        self.emitter.queue()
    }

    pub fn reducer(&self) -> &Arc<ActionReducer> {
        &self.reducer
    }

    pub fn side_effects(&self) -> &Arc<SideEffectProcessor> {
        &self.side_effects
    }

    /// Leave the group, then stop the processors.
    pub async fn shutdown(&self) -> Result<(), LiveOpsError> {
        self.cancel.cancel();
        self.instance.shutdown().await?;
        self.reducer.shutdown().await;
        self.side_effects.shutdown().await;
        self.background_tasks.join_all(self.shutdown_timeout).await;
        tracing::info!(service = %self.instance.id(), "service stopped");
        Ok(())
    }
}

/// Applies the instance's allocation and group changes to the queue and
/// the emitter.
struct GroupFollower {
    instance: Arc<ServiceInstance>,
    emitter: ActionEmitter,
    own_resources: SerializedActionMappingSet,
    segment: Option<String>,
    metrics: Arc<LiveOpsMetrics>,
}

impl GroupFollower {
    async fn run(self, mut events: broadcast::Receiver<InstanceEvent>, cancel: CancellationToken) {
        self.refresh_mapping();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(InstanceEvent::PartitionAssigned(partition)) => self.allocate(&partition),
                Ok(InstanceEvent::GroupsChanged) => self.refresh_mapping(),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(service = %self.instance.id(), skipped, "instance events lagged, resyncing");
                    self.allocate(&self.instance.partition());
                    self.refresh_mapping();
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn allocate(&self, partition: &[u32]) {
        if partition.is_empty() {
            return;
        }
        let queue = self.emitter.queue();
        queue.allocate_buckets(partition, self.segment.as_deref());
        self.metrics
            .owned_buckets
            .set(queue.owned_buckets().len() as i64);
    }

    /// Resources of every known group, with this service's own declarations
    /// taking precedence.
    fn refresh_mapping(&self) {
        let (mut mapping, _) = resource_mapping_from_groups(&self.instance.groups());
        if let Err(e) = mapping.merge(&self.own_resources) {
            tracing::warn!(error = %e, "failed to merge own resource mapping");
            return;
        }
        self.emitter.set_resource_mapping(mapping);
    }
}
