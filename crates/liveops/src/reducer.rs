//! The reduction engine: pops actions from owned buckets, runs their reducer
//! and drives transactions forward, to completion or through compensation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::action::{Action, ActionContext, ActionPayload, QueueItem};
use crate::channels::ChannelMembership;
use crate::config::LiveOpsConfig;
use crate::emitter::ActionEmitter;
use crate::error::LiveOpsError;
use crate::metrics::LiveOpsMetrics;
use crate::queue::{ShardedWorkQueue, TransactionLog, TriggerSink};
use crate::routing::ActionMappingSet;
use crate::store::SharedStore;
use crate::tasks::BackgroundTasks;

/// Outcome of one reducer invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Reduction {
    /// Success. The action's own `next` runs if it has one.
    Done,
    /// Failure; the transaction is compensated.
    Failed,
    /// Success, followed by this action instead of the declared `next`.
    FollowUp(Action),
}

impl From<bool> for Reduction {
    fn from(ok: bool) -> Self {
        if ok {
            Reduction::Done
        } else {
            Reduction::Failed
        }
    }
}

impl From<()> for Reduction {
    fn from(_: ()) -> Self {
        Reduction::Done
    }
}

impl From<Action> for Reduction {
    fn from(action: Action) -> Self {
        Reduction::FollowUp(action)
    }
}

/// What a reducer gets to work with.
#[derive(Clone)]
pub struct ReducerContext {
    pub client: Option<String>,
    /// Empty when the action carries no session.
    pub session: String,
    pub action: Action,
    pub emitter: ActionEmitter,
}

impl ReducerContext {
    pub fn context(&self) -> &ActionContext {
        &self.action.context
    }

    pub fn payload<P: ActionPayload>(&self) -> Result<P, LiveOpsError> {
        self.action.decode()
    }
}

pub type ReducerFn =
    Arc<dyn Fn(ReducerContext) -> BoxFuture<'static, Result<Reduction, LiveOpsError>> + Send + Sync>;

/// Box an async closure as a [`ReducerFn`].
pub fn reducer_fn<F, Fut>(f: F) -> ReducerFn
where
    F: Fn(ReducerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reduction, LiveOpsError>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Whether resolving an action's channel also changes the session's
/// channel membership.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelPolicy {
    pub auto_join: bool,
    pub auto_leave: bool,
}

pub struct ActionReducer {
    queue: Arc<ShardedWorkQueue>,
    emitter: ActionEmitter,
    log: TransactionLog,
    triggers: Arc<dyn TriggerSink>,
    channels: Arc<dyn ChannelMembership>,
    reducers: HashMap<String, ReducerFn>,
    channel_policies: HashMap<String, ChannelPolicy>,
    channel_mapping: ActionMappingSet,
    metrics: Arc<LiveOpsMetrics>,
    config: LiveOpsConfig,
    cancel: CancellationToken,
    background_tasks: BackgroundTasks,
}

impl ActionReducer {
    /// The reducer polls `emitter`'s queue, logs transactions in `store` and
    /// hands completed actions to `triggers`.
    pub fn new(
        store: Arc<dyn SharedStore>,
        config: LiveOpsConfig,
        emitter: ActionEmitter,
        triggers: Arc<dyn TriggerSink>,
        channels: Arc<dyn ChannelMembership>,
    ) -> Self {
        Self {
            queue: Arc::clone(emitter.queue()),
            log: TransactionLog::new(store, config.prefix.clone(), config.max_revert_steps),
            emitter,
            triggers,
            channels,
            reducers: HashMap::new(),
            channel_policies: HashMap::new(),
            channel_mapping: ActionMappingSet::new(),
            metrics: Arc::new(LiveOpsMetrics::unregistered()),
            config,
            cancel: CancellationToken::new(),
            background_tasks: BackgroundTasks::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<LiveOpsMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_channel_mapping(mut self, mapping: ActionMappingSet) -> Self {
        self.channel_mapping = mapping;
        self
    }

    pub fn reducer(mut self, action_type: impl Into<String>, reducer: ReducerFn) -> Self {
        self.reducers.insert(action_type.into(), reducer);
        self
    }

    pub fn channel_policy(mut self, action_type: impl Into<String>, policy: ChannelPolicy) -> Self {
        self.channel_policies.insert(action_type.into(), policy);
        self
    }

    pub fn queue(&self) -> &Arc<ShardedWorkQueue> {
        &self.queue
    }

    pub async fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.background_tasks
            .push(tokio::spawn(async move { this.poll_loop().await }))
            .await;
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.background_tasks
            .join_all(self.config.shutdown_timeout)
            .await;
    }

    async fn poll_loop(self: Arc<Self>) {
        loop {
            self.poll_once().await;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Pop one batch from the owned buckets and reduce it concurrently.
    /// Returns the number of items taken.
    pub async fn poll_once(&self) -> usize {
        let batch = self.queue.poll_owned().await;
        let count = batch.len();
        let tasks = batch.into_iter().map(|(bucket, item)| async move {
            let action_type = item.action.action_type.clone();
            if let Err(e) = self.reduce(item).await {
                tracing::warn!(bucket = %bucket, action_type = %action_type, error = %e, "failed to reduce action");
            }
        });
        futures::future::join_all(tasks).await;
        count
    }

    /// Reduce one queued action.
    ///
    /// An error leaves the action neither completed nor compensated.
    #[instrument(
        level = "debug",
        skip(self, item),
        fields(action_type = %item.action.action_type, transaction = ?item.action.transaction())
    )]
    pub async fn reduce(&self, item: QueueItem) -> Result<(), LiveOpsError> {
        let QueueItem { client, mut action } = item;
        self.resolve_channel(&mut action).await?;

        let reduction = if action.is_status_marker() {
            self.triggers.trigger(&action).await?;
            Reduction::Done
        } else {
            match self.reducers.get(action.action_type.as_str()) {
                Some(reducer) => {
                    let ctx = ReducerContext {
                        client,
                        session: action.session.clone().unwrap_or_default(),
                        action: action.clone(),
                        emitter: self.emitter.clone(),
                    };
                    reducer(ctx).await?
                }
                None => Reduction::Done,
            }
        };
        self.metrics.actions_reduced.inc();

        if action.reverting {
            return self.revert(&action).await;
        }
        match reduction {
            Reduction::Failed => {
                tracing::debug!(action_type = %action.action_type, "reducer failed, reverting");
                self.metrics.actions_failed.inc();
                self.revert(&action).await
            }
            Reduction::FollowUp(next) => self.follow_up(&action, next).await,
            Reduction::Done => match action.next.as_deref().cloned() {
                Some(next) => self.follow_up(&action, next).await,
                None => self.complete(&action).await,
            },
        }
    }

    async fn resolve_channel(&self, action: &mut Action) -> Result<(), LiveOpsError> {
        let Some(channels) = self.channel_mapping.try_apply(action)? else {
            return Ok(());
        };
        if channels.is_empty() {
            return Ok(());
        }
        if let Some(session) = action.session.as_deref() {
            let policy = self
                .channel_policies
                .get(action.action_type.as_str())
                .copied()
                .unwrap_or_default();
            if action.subscribe || policy.auto_join {
                self.channels.join(session, &channels).await?;
            } else if action.unsubscribe || policy.auto_leave {
                self.channels.leave(session, &channels).await?;
            }
        }
        action.channel = Some(channels);
        Ok(())
    }

    async fn follow_up(&self, action: &Action, mut next: Action) -> Result<(), LiveOpsError> {
        self.log.append(action).await?;
        next.inherit_from(action);
        tracing::debug!(
            action_type = %action.action_type,
            next = %next.action_type,
            "continuing transaction"
        );
        self.emitter.enqueue(next).await?;
        Ok(())
    }

    async fn complete(&self, action: &Action) -> Result<(), LiveOpsError> {
        let actions = self.log.complete(action).await?;
        tracing::debug!(
            transaction = ?action.transaction(),
            actions = actions.len(),
            "completed transaction, triggering"
        );
        for entry in actions.iter().filter(|a| !a.is_status_marker()) {
            self.triggers.trigger(entry).await?;
        }
        if action.transaction().is_some() {
            self.metrics.transactions_completed.inc();
        }
        Ok(())
    }

    async fn revert(&self, action: &Action) -> Result<(), LiveOpsError> {
        let Some(mut revert) = self.log.revert(action).await? else {
            return Ok(());
        };
        revert.context = action.context.clone();
        if revert.client.is_none() {
            revert.client = action.client.clone();
        }
        self.metrics.reverts_emitted.inc();
        self.emitter.enqueue(revert).await?;
        Ok(())
    }
}
