//! The action data model.
//!
//! An [`Action`] describes one state change. Actions travel through the work
//! queue as JSON, so the struct mirrors the wire shape exactly: optional flags
//! are omitted when unset and `type` is the discriminating field.
//!
//! Payloads stay untyped (`serde_json::Value`) on the wire. Handlers that want
//! a typed view implement [`ActionPayload`] and call [`Action::decode`], which
//! checks the `type` field before decoding and fails with
//! [`LiveOpsError::MalformedAction`] instead of coercing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::LiveOpsError;
use crate::types::{ActionType, TransactionId};

/// Public and private context carried along a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionContext {
    #[serde(default = "empty_object")]
    pub public: Value,
    #[serde(default = "empty_object")]
    pub private: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl Default for ActionContext {
    fn default() -> Self {
        Self {
            public: empty_object(),
            private: empty_object(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionId>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A message describing a state change, possibly chained with a follow-up
/// (`next`) and a compensating inverse (`revert`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub context: ActionContext,
    #[serde(default)]
    pub meta: ActionMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<Action>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert: Option<Box<Action>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub reverting: bool,
    /// Transaction begin/end marker; never reaches a handler.
    #[serde(default, skip_serializing_if = "is_false")]
    pub status: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub subscribe: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unsubscribe: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub dispatched: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Vec<String>>,
}

impl Action {
    pub fn new(action_type: impl Into<ActionType>, payload: Value) -> Self {
        Self {
            action_type: action_type.into(),
            client: None,
            session: None,
            payload,
            context: ActionContext::default(),
            meta: ActionMeta::default(),
            next: None,
            revert: None,
            reverting: false,
            status: false,
            subscribe: false,
            unsubscribe: false,
            dispatched: false,
            error: false,
            channel: None,
        }
    }

    /// Build an action from a typed payload.
    pub fn from_payload<P: ActionPayload>(payload: &P) -> Result<Self, LiveOpsError> {
        let value = serde_json::to_value(payload)
            .map_err(|e| LiveOpsError::malformed(format!("failed to encode {}", P::TYPE), e))?;
        Ok(Self::new(P::TYPE, value))
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_revert(mut self, revert: Action) -> Self {
        self.revert = Some(Box::new(revert));
        self
    }

    pub fn with_next(mut self, next: Action) -> Self {
        self.next = Some(Box::new(next));
        self
    }

    pub fn with_context(mut self, context: ActionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_transaction(mut self, id: TransactionId) -> Self {
        self.meta.transaction = Some(id);
        self
    }

    pub fn subscribing(mut self) -> Self {
        self.subscribe = true;
        self
    }

    pub fn unsubscribing(mut self) -> Self {
        self.unsubscribe = true;
        self
    }

    pub fn transaction(&self) -> Option<&TransactionId> {
        self.meta.transaction.as_ref()
    }

    /// Assign a fresh transaction id unless one is already set.
    pub fn ensure_transaction(&mut self) -> &TransactionId {
        self.meta
            .transaction
            .get_or_insert_with(TransactionId::random)
    }

    /// Join `base`'s transaction, or start a new one when `base` has none.
    pub fn set_transaction_from(&mut self, base: &Action) {
        self.meta.transaction = Some(
            base.meta
                .transaction
                .clone()
                .unwrap_or_else(TransactionId::random),
        );
    }

    /// Prepare this action as the follow-up of `previous`: same transaction,
    /// inherited context, and `previous`'s client when this one has none.
    pub fn inherit_from(&mut self, previous: &Action) {
        self.set_transaction_from(previous);
        self.context = previous.context.clone();
        if self.client.is_none() {
            self.client = previous.client.clone();
        }
    }

    pub fn is_status_marker(&self) -> bool {
        self.status
    }

    /// JSON view used by the routing engine for placeholder lookups.
    pub fn to_value(&self) -> Result<Value, LiveOpsError> {
        serde_json::to_value(self)
            .map_err(|e| LiveOpsError::malformed(format!("failed to encode {}", self.action_type), e))
    }

    /// Decode the payload into its typed form. The action type must match
    /// `P::TYPE`.
    pub fn decode<P: ActionPayload>(&self) -> Result<P, LiveOpsError> {
        if self.action_type.as_str() != P::TYPE {
            return Err(LiveOpsError::MalformedAction {
                reason: format!(
                    "expected action type {}, got {}",
                    P::TYPE,
                    self.action_type
                ),
                source: None,
            });
        }
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            LiveOpsError::malformed(format!("payload of {} has the wrong shape", P::TYPE), e)
        })
    }
}

/// A typed payload bound to one action type name.
pub trait ActionPayload: Serialize + DeserializeOwned {
    const TYPE: &'static str;
}

/// One entry of a work or side-effect queue, as stored on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub client: Option<String>,
    pub action: Action,
}

impl QueueItem {
    pub fn new(client: Option<String>, action: Action) -> Self {
        Self { client, action }
    }

    pub fn encode(&self) -> Result<String, LiveOpsError> {
        serde_json::to_string(self).map_err(|e| {
            LiveOpsError::malformed(format!("failed to encode {}", self.action.action_type), e)
        })
    }

    pub fn decode(raw: &str) -> Result<Self, LiveOpsError> {
        serde_json::from_str(raw).map_err(|e| LiveOpsError::malformed("failed to decode queue item", e))
    }
}

fn merged_payload(base: Value, extra: &Value) -> Value {
    match (base, extra) {
        (Value::Object(mut base), Value::Object(extra)) => {
            for (k, v) in extra {
                base.entry(k.clone()).or_insert_with(|| v.clone());
            }
            Value::Object(base)
        }
        (base, _) => base,
    }
}

/// `SERVER/CHANGE_{TARGET}` by `amount`, reverted by the negated amount.
/// Fields of `extra` are added to both payloads.
///
/// Fails for `i64::MIN`, which has no negation.
pub fn change_numeric_value(
    client: Option<&str>,
    target: &str,
    amount: i64,
    extra: Value,
) -> Result<Action, LiveOpsError> {
    let action_type = format!("SERVER/CHANGE_{}", target.to_uppercase());
    let negated = amount.checked_neg().ok_or_else(|| LiveOpsError::MalformedAction {
        reason: format!("{action_type}: amount {amount} cannot be reverted"),
        source: None,
    })?;
    let mut revert = Action::new(
        action_type.as_str(),
        merged_payload(json!({ "amount": negated }), &extra),
    );
    let mut action = Action::new(
        action_type.as_str(),
        merged_payload(json!({ "amount": amount }), &extra),
    );
    revert.client = client.map(str::to_string);
    action.client = client.map(str::to_string);
    Ok(action.with_revert(revert))
}

/// `SERVER/SET_{TARGET}` from `prev_value` to `value`, reverted by the
/// swapped pair.
pub fn set_numeric_value(
    client: Option<&str>,
    target: &str,
    prev_value: i64,
    value: i64,
    extra: Value,
) -> Action {
    let action_type = format!("SERVER/SET_{}", target.to_uppercase());
    let mut revert = Action::new(
        action_type.as_str(),
        merged_payload(json!({ "prevValue": value, "value": prev_value }), &extra),
    );
    let mut action = Action::new(
        action_type.as_str(),
        merged_payload(json!({ "prevValue": prev_value, "value": value }), &extra),
    );
    revert.client = client.map(str::to_string);
    action.client = client.map(str::to_string);
    action.with_revert(revert)
}

/// Link `main` and `rest` into one chain through `next` and start a
/// transaction on the head.
pub fn transaction(mut main: Action, rest: Vec<Action>) -> Action {
    let mut chain: Option<Box<Action>> = None;
    for mut action in rest.into_iter().rev() {
        action.next = chain;
        chain = Some(Box::new(action));
    }
    main.next = chain;
    main.ensure_transaction();
    main
}

/// Status marker emitted to a session when a transaction fails.
pub fn status_error(session: &str, action_type: &str) -> Action {
    let mut action = Action::new(
        action_type,
        json!({ "status": "error", "error": "transaction_failure" }),
    )
    .with_session(session);
    action.status = true;
    action.error = true;
    action
}

/// Opening status marker; its revert reports the failure to the session.
pub fn status_begin(session: &str, action_type: &str) -> Action {
    let mut action = Action::new(action_type, json!({ "status": "begin" }))
        .with_session(session)
        .with_revert(status_error(session, action_type));
    action.status = true;
    action
}

pub fn status_end(session: &str, action_type: &str) -> Action {
    let mut action = Action::new(action_type, json!({ "status": "done" })).with_session(session);
    action.status = true;
    action
}

/// Wrap a chain in begin/done status markers reported under `action_type`.
pub fn transaction_with_status(
    session: &str,
    action_type: &str,
    main: Action,
    rest: Vec<Action>,
) -> Action {
    let mut chain = Vec::with_capacity(rest.len() + 2);
    chain.push(main);
    chain.extend(rest);
    chain.push(status_end(session, action_type));
    transaction(status_begin(session, action_type), chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct ChangeCoins {
        amount: i64,
    }

    impl ActionPayload for ChangeCoins {
        const TYPE: &'static str = "SERVER/CHANGE_COINS";
    }

    #[test]
    fn change_numeric_value_reverts_by_negation() {
        let action = change_numeric_value(Some("abc"), "coins", 5, json!({ "reason": "quest" })).unwrap();
        assert_eq!(action.action_type.as_str(), "SERVER/CHANGE_COINS");
        assert_eq!(action.payload, json!({ "amount": 5, "reason": "quest" }));
        let revert = action.revert.unwrap();
        assert_eq!(revert.payload, json!({ "amount": -5, "reason": "quest" }));
        assert_eq!(revert.client.as_deref(), Some("abc"));
    }

    #[test]
    fn change_numeric_value_rejects_unnegatable_amount() {
        let err = change_numeric_value(None, "coins", i64::MIN, json!({})).unwrap_err();
        assert!(matches!(err, LiveOpsError::MalformedAction { .. }));
        assert!(change_numeric_value(None, "coins", i64::MAX, json!({})).is_ok());
    }

    #[test]
    fn set_numeric_value_reverts_by_swap() {
        let action = set_numeric_value(None, "level", 2, 3, json!({}));
        assert_eq!(action.action_type.as_str(), "SERVER/SET_LEVEL");
        assert_eq!(action.payload, json!({ "prevValue": 2, "value": 3 }));
        assert_eq!(action.revert.unwrap().payload, json!({ "prevValue": 3, "value": 2 }));
    }

    #[test]
    fn wire_shape_omits_unset_flags() {
        let action = Action::new("GAME/PING", json!({})).with_client("abc");
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "GAME/PING");
        assert_eq!(value["client"], "abc");
        assert!(value.get("reverting").is_none());
        assert!(value.get("next").is_none());
        assert_eq!(value["context"]["public"], json!({}));
    }

    #[test]
    fn decodes_minimal_wire_action() {
        let action: Action = serde_json::from_str(r#"{"type":"GAME/PING"}"#).unwrap();
        assert_eq!(action.action_type.as_str(), "GAME/PING");
        assert_eq!(action.payload, Value::Null);
        assert_eq!(action.context, ActionContext::default());
        assert!(action.transaction().is_none());
    }

    #[test]
    fn queue_item_keeps_null_client() {
        let item = QueueItem::new(None, Action::new("GAME/PING", json!({})));
        let raw = item.encode().unwrap();
        assert!(raw.starts_with(r#"{"client":null,"#), "got: {raw}");
        assert_eq!(QueueItem::decode(&raw).unwrap(), item);
    }

    #[test]
    fn malformed_queue_item_is_an_error() {
        let err = QueueItem::decode("{not json").unwrap_err();
        assert!(matches!(err, LiveOpsError::MalformedAction { .. }));
    }

    #[test]
    fn typed_payload_round_trip() {
        let action = Action::from_payload(&ChangeCoins { amount: 5 }).unwrap();
        assert_eq!(action.decode::<ChangeCoins>().unwrap(), ChangeCoins { amount: 5 });
    }

    #[test]
    fn typed_payload_rejects_wrong_type() {
        let action = Action::new("SERVER/OTHER", json!({ "amount": 5 }));
        assert!(matches!(
            action.decode::<ChangeCoins>(),
            Err(LiveOpsError::MalformedAction { .. })
        ));
    }

    #[test]
    fn typed_payload_rejects_wrong_shape() {
        let action = Action::new(ChangeCoins::TYPE, json!({ "amount": "lots" }));
        assert!(matches!(
            action.decode::<ChangeCoins>(),
            Err(LiveOpsError::MalformedAction { .. })
        ));
    }

    #[test]
    fn transaction_links_chain_in_order() {
        let chain = transaction(
            Action::new("A", json!({})),
            vec![Action::new("B", json!({})), Action::new("C", json!({}))],
        );
        assert!(chain.transaction().is_some());
        let b = chain.next.as_ref().unwrap();
        assert_eq!(b.action_type.as_str(), "B");
        let c = b.next.as_ref().unwrap();
        assert_eq!(c.action_type.as_str(), "C");
        assert!(c.next.is_none());
    }

    #[test]
    fn follow_up_inherits_transaction_and_context() {
        let mut first = Action::new("A", json!({}));
        first.ensure_transaction();
        first.context.public = json!({ "score": 1 });

        let mut second = Action::new("B", json!({}));
        second.inherit_from(&first);
        assert_eq!(second.transaction(), first.transaction());
        assert_eq!(second.context.public, json!({ "score": 1 }));
    }

    #[test]
    fn follow_up_inherits_client_only_when_unset() {
        let first = Action::new("A", json!({})).with_client("abc");

        let mut marker = status_end("s1", "STATUS");
        marker.inherit_from(&first);
        assert_eq!(marker.client.as_deref(), Some("abc"));
        assert_eq!(marker.session.as_deref(), Some("s1"));

        let mut other = Action::new("B", json!({})).with_client("xyz");
        other.inherit_from(&first);
        assert_eq!(other.client.as_deref(), Some("xyz"));
    }

    #[test]
    fn set_transaction_from_untracked_base_starts_new_one() {
        let base = Action::new("A", json!({}));
        let mut follow = Action::new("B", json!({}));
        follow.set_transaction_from(&base);
        assert!(follow.transaction().is_some());
    }

    #[test]
    fn status_chain_is_bracketed_by_markers() {
        let chain = transaction_with_status(
            "sess-1",
            "SHOP/BUY",
            Action::new("SERVER/CHANGE_COINS", json!({ "amount": -5 })),
            vec![],
        );
        assert!(chain.is_status_marker());
        assert_eq!(chain.payload["status"], "begin");
        let revert = chain.revert.as_ref().unwrap();
        assert!(revert.status && revert.error);

        let main = chain.next.as_ref().unwrap();
        assert!(!main.is_status_marker());
        let end = main.next.as_ref().unwrap();
        assert!(end.is_status_marker());
        assert_eq!(end.payload["status"], "done");
        assert_eq!(end.session.as_deref(), Some("sess-1"));
    }
}
