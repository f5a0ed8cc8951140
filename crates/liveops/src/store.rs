use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::error::LiveOpsError;

/// Stream of raw messages published on one bus scope.
pub type BusStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// The shared external store every process in a deployment talks to.
///
/// Lists are strict FIFO: `push_back` appends, `pop_front` takes the oldest
/// entry and `pop_back` the most recent one. All operations are atomic with
/// respect to each other and visible to every process sharing the store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Append a value to the tail of a list.
    async fn push_back(&self, key: &str, value: String) -> Result<(), LiveOpsError>;

    /// Remove and return the oldest value of a list, if any.
    async fn pop_front(&self, key: &str) -> Result<Option<String>, LiveOpsError>;

    /// Remove and return the most recently pushed value of a list, if any.
    async fn pop_back(&self, key: &str) -> Result<Option<String>, LiveOpsError>;

    /// All values of a list, oldest first.
    async fn range(&self, key: &str) -> Result<Vec<String>, LiveOpsError>;

    /// Delete a list or set.
    async fn remove(&self, key: &str) -> Result<(), LiveOpsError>;

    /// Add a member to a set. Returns `true` when it was not already present.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, LiveOpsError>;

    /// Remove a member from a set. Returns `true` when it was present.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, LiveOpsError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, LiveOpsError>;

    /// Publish a message to every current subscriber of `scope`.
    async fn publish(&self, scope: &str, message: String) -> Result<(), LiveOpsError>;

    /// Subscribe to messages published on `scope` from now on.
    async fn subscribe(&self, scope: &str) -> Result<BusStream, LiveOpsError>;

    /// Try to take or refresh the named lock for `ttl`.
    ///
    /// Returns `true` when `holder` owns the lock afterwards. A holder that
    /// already owns the lock has its ttl extended.
    async fn acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, LiveOpsError>;

    /// Release the named lock if `holder` owns it.
    async fn release_lock(&self, key: &str, holder: &str) -> Result<(), LiveOpsError>;
}
