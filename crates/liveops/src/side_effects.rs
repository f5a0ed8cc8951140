use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::action::{Action, ActionContext, QueueItem};
use crate::config::LiveOpsConfig;
use crate::emitter::ActionEmitter;
use crate::error::LiveOpsError;
use crate::metrics::LiveOpsMetrics;
use crate::queue::SideEffectQueue;
use crate::tasks::BackgroundTasks;
use crate::types::ActionType;

/// Input of a trigger handler: the completed action and a way to emit more.
#[derive(Clone)]
pub struct TriggerContext {
    pub client: Option<String>,
    /// Empty when the action carries no session.
    pub session: String,
    pub payload: Value,
    pub context: ActionContext,
    pub action: Action,
    pub emitter: ActionEmitter,
}

pub type TriggerFn =
    Arc<dyn Fn(TriggerContext) -> BoxFuture<'static, Result<(), LiveOpsError>> + Send + Sync>;

/// Box an async closure as a [`TriggerFn`].
pub fn trigger_fn<F, Fut>(f: F) -> TriggerFn
where
    F: Fn(TriggerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), LiveOpsError>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Drains a side-effect queue and runs the trigger handlers registered for
/// each action's type.
///
/// Delivery is best effort: a failing handler is logged and never affects
/// its siblings, later items, or the originating transaction.
pub struct SideEffectProcessor {
    queue: Arc<SideEffectQueue>,
    emitter: ActionEmitter,
    handlers: DashMap<ActionType, Vec<TriggerFn>>,
    metrics: Arc<LiveOpsMetrics>,
    poll_interval: std::time::Duration,
    shutdown_timeout: std::time::Duration,
    cancel: CancellationToken,
    background_tasks: BackgroundTasks,
}

impl SideEffectProcessor {
    pub fn new(queue: Arc<SideEffectQueue>, emitter: ActionEmitter, config: &LiveOpsConfig) -> Self {
        Self {
            queue,
            emitter,
            handlers: DashMap::new(),
            metrics: Arc::new(LiveOpsMetrics::unregistered()),
            poll_interval: config.side_effect_poll_interval,
            shutdown_timeout: config.shutdown_timeout,
            cancel: CancellationToken::new(),
            background_tasks: BackgroundTasks::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<LiveOpsMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Add a handler for `action_type`. Handlers accumulate.
    pub fn on(&self, action_type: impl Into<ActionType>, handler: TriggerFn) -> &Self {
        self.handlers
            .entry(action_type.into())
            .or_default()
            .push(handler);
        self
    }

    pub fn handler_count(&self, action_type: &str) -> usize {
        self.handlers
            .get(&ActionType::new(action_type))
            .map(|h| h.len())
            .unwrap_or(0)
    }

    pub fn queue(&self) -> &Arc<SideEffectQueue> {
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
        self.background_tasks.join_all(self.shutdown_timeout).await;
    }

    async fn poll_loop(self: Arc<Self>) {
        loop {
            self.drain().await;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Process items until the queue is empty. Returns how many were taken.
    pub async fn drain(&self) -> usize {
        let mut processed = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.queue.pop().await {
                Ok(Some(item)) => {
                    self.process(item).await;
                    processed += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(queue = %self.queue.key(), error = %e, "failed to poll side-effect queue");
                    break;
                }
            }
        }
        processed
    }

    async fn process(&self, item: QueueItem) {
        let QueueItem { client, action } = item;
        // Clone out of the map so no shard lock is held across the awaits.
        let handlers = match self.handlers.get(&action.action_type) {
            Some(handlers) => handlers.clone(),
            None => return,
        };
        let action_type = action.action_type.clone();
        tracing::debug!(action_type = %action_type, handlers = handlers.len(), "running triggers");
        let ctx = TriggerContext {
            client,
            session: action.session.clone().unwrap_or_default(),
            payload: action.payload.clone(),
            context: action.context.clone(),
            action,
            emitter: self.emitter.clone(),
        };
        let runs = handlers.iter().map(|handler| {
            // A panicking handler is contained like an erroring one.
            std::panic::AssertUnwindSafe(handler(ctx.clone())).catch_unwind()
        });
        for outcome in futures::future::join_all(runs).await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.metrics.side_effect_failures.inc();
                    tracing::warn!(action_type = %action_type, error = %e, "trigger handler failed");
                }
                Err(_) => {
                    self.metrics.side_effect_failures.inc();
                    tracing::warn!(action_type = %action_type, "trigger handler panicked");
                }
            }
        }
    }
}
