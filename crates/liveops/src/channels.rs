//! Channel membership: which sessions listen on which channels.
//!
//! Reducers on service instances request joins and leaves through
//! [`BroadcastChannelMembership`], which relays them over the coordinator bus.
//! The coordinator applies them to the store-backed
//! [`StoreChannelMembership`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::LiveOpsError;
use crate::membership::messages::{
    services_scope, BusMessage, ChannelChange, NamedBroadcast, CHANNEL_JOIN, CHANNEL_LEAVE,
};
use crate::store::SharedStore;

#[async_trait]
pub trait ChannelMembership: Send + Sync {
    async fn join(&self, session: &str, channels: &[String]) -> Result<(), LiveOpsError>;

    async fn leave(&self, session: &str, channels: &[String]) -> Result<(), LiveOpsError>;
}

/// Sessions per channel as store sets at `"{prefix}:channel:{channel}"`.
pub struct StoreChannelMembership {
    store: Arc<dyn SharedStore>,
    prefix: String,
}

impl StoreChannelMembership {
    pub fn new(store: Arc<dyn SharedStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn key(&self, channel: &str) -> String {
        format!("{}:channel:{}", self.prefix, channel)
    }

    pub async fn sessions(&self, channel: &str) -> Result<Vec<String>, LiveOpsError> {
        self.store.set_members(&self.key(channel)).await
    }
}

#[async_trait]
impl ChannelMembership for StoreChannelMembership {
    async fn join(&self, session: &str, channels: &[String]) -> Result<(), LiveOpsError> {
        for channel in channels {
            if self.store.set_add(&self.key(channel), session).await? {
                tracing::debug!(session, channel = %channel, "session joined channel");
            }
        }
        Ok(())
    }

    async fn leave(&self, session: &str, channels: &[String]) -> Result<(), LiveOpsError> {
        for channel in channels {
            if self.store.set_remove(&self.key(channel), session).await? {
                tracing::debug!(session, channel = %channel, "session left channel");
            }
        }
        Ok(())
    }
}

/// Relays join and leave requests as `channel-join` / `channel-leave`
/// service broadcasts.
pub struct BroadcastChannelMembership {
    store: Arc<dyn SharedStore>,
    scope: String,
}

impl BroadcastChannelMembership {
    pub fn new(store: Arc<dyn SharedStore>, prefix: &str) -> Self {
        Self {
            store,
            scope: services_scope(prefix),
        }
    }

    async fn send(&self, kind: &str, session: &str, channels: &[String]) -> Result<(), LiveOpsError> {
        let change = ChannelChange {
            session: session.to_string(),
            channel: channels.to_vec(),
        };
        let data = serde_json::to_value(&change)
            .map_err(|e| LiveOpsError::malformed("failed to encode channel change", e))?;
        let message = BusMessage::ServiceBroadcast(NamedBroadcast {
            kind: kind.to_string(),
            data,
        });
        self.store.publish(&self.scope, message.encode()?).await
    }
}

#[async_trait]
impl ChannelMembership for BroadcastChannelMembership {
    async fn join(&self, session: &str, channels: &[String]) -> Result<(), LiveOpsError> {
        self.send(CHANNEL_JOIN, session, channels).await
    }

    async fn leave(&self, session: &str, channels: &[String]) -> Result<(), LiveOpsError> {
        self.send(CHANNEL_LEAVE, session, channels).await
    }
}

/// Apply a relayed channel request. Returns `Ok(false)` for broadcasts of
/// any other kind.
pub async fn apply_channel_broadcast(
    channels: &dyn ChannelMembership,
    broadcast: &NamedBroadcast,
) -> Result<bool, LiveOpsError> {
    let join = match broadcast.kind.as_str() {
        CHANNEL_JOIN => true,
        CHANNEL_LEAVE => false,
        _ => return Ok(false),
    };
    let change: ChannelChange = serde_json::from_value(broadcast.data.clone())
        .map_err(|e| LiveOpsError::malformed(format!("invalid {} payload", broadcast.kind), e))?;
    if join {
        channels.join(&change.session, &change.channel).await?;
    } else {
        channels.leave(&change.session, &change.channel).await?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_store::MemoryStore;
    use futures::StreamExt;
    use serde_json::json;

    fn channels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn store_membership_tracks_sessions() {
        let store = Arc::new(MemoryStore::new());
        let membership = StoreChannelMembership::new(store, "lo");
        membership.join("s1", &channels(&["guild:1", "world"])).await.unwrap();
        membership.join("s2", &channels(&["world"])).await.unwrap();
        membership.leave("s1", &channels(&["world"])).await.unwrap();

        assert_eq!(membership.key("world"), "lo:channel:world");
        assert_eq!(membership.sessions("guild:1").await.unwrap(), vec!["s1".to_string()]);
        assert_eq!(membership.sessions("world").await.unwrap(), vec!["s2".to_string()]);
    }

    #[tokio::test]
    async fn relayed_join_is_applied() {
        let store = Arc::new(MemoryStore::new());
        let mut bus = store.subscribe(&services_scope("lo")).await.unwrap();
        BroadcastChannelMembership::new(store.clone(), "lo")
            .join("s1", &channels(&["guild:1"]))
            .await
            .unwrap();

        let raw = bus.next().await.unwrap();
        let BusMessage::ServiceBroadcast(broadcast) = BusMessage::decode(&raw).unwrap() else {
            panic!("expected a service broadcast");
        };
        assert_eq!(broadcast.kind, CHANNEL_JOIN);
        assert_eq!(broadcast.data, json!({ "session": "s1", "channel": ["guild:1"] }));

        let membership = StoreChannelMembership::new(store, "lo");
        assert!(apply_channel_broadcast(&membership, &broadcast).await.unwrap());
        assert_eq!(membership.sessions("guild:1").await.unwrap(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn unrelated_broadcasts_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let membership = StoreChannelMembership::new(store, "lo");
        let broadcast = NamedBroadcast {
            kind: "lock-allocation".into(),
            data: json!({}),
        };
        assert!(!apply_channel_broadcast(&membership, &broadcast).await.unwrap());

        let bad = NamedBroadcast {
            kind: CHANNEL_LEAVE.into(),
            data: json!({ "session": 1 }),
        };
        assert!(apply_channel_broadcast(&membership, &bad).await.is_err());
    }
}
