//! Distributed action processing for live game services.
//!
//! Actions are routed by resource into a fixed set of shared-store buckets.
//! A coordinator elects group leaders and splits the buckets across the
//! members of each service group, so every resource has exactly one
//! consumer at a time. Each member reduces the actions of its buckets,
//! chaining follow-ups through a transaction log and compensating failed
//! chains with their declared reverts. Completed actions feed a best-effort
//! side-effect queue.

pub mod action;
pub mod channels;
pub mod config;
pub mod emitter;
pub mod error;
pub mod hash;
pub mod instance;
pub mod membership;
pub mod metrics;
pub mod queue;
pub mod reducer;
pub mod routing;
pub mod service;
pub mod side_effects;
pub mod storage;
pub mod store;
mod tasks;
pub mod testing;
pub mod types;

/// Prelude module for convenient glob imports.
///
/// ```text
/// use liveops::prelude::*;
///
/// let mut service = LiveOpsService::new(store, LiveOpsConfig::default());
/// service.action(
///     "SHOP/BUY",
///     ActionDescriptor::new().reducer(reducer_fn(|ctx| async move {
///         Ok(Reduction::Done)
///     })),
/// )?;
/// let running = service.start("shop", "1.0.0").await?;
/// ```
pub mod prelude {
    pub use crate::action::{transaction, transaction_with_status, Action, ActionContext, ActionPayload};
    pub use crate::config::LiveOpsConfig;
    pub use crate::emitter::ActionEmitter;
    pub use crate::error::LiveOpsError;
    pub use crate::membership::Coordinator;
    pub use crate::reducer::{reducer_fn, ReducerContext, Reduction};
    pub use crate::service::{ActionDescriptor, LiveOpsService, ResourceScopeOptions, RunningService};
    pub use crate::side_effects::{trigger_fn, TriggerContext};
    pub use crate::store::SharedStore;
}
