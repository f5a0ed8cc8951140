use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::error::LiveOpsError;
use crate::routing::mapping::{ActionMapping, SerializedActionMapping};

/// Wire form of a mapping set, as carried in group metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedActionMappingSet {
    pub mappings: Vec<SerializedActionMapping>,
}

/// Mappings indexed by action type.
///
/// When two mappings name the same action type, the one added last wins the
/// lookup.
#[derive(Debug, Clone, Default)]
pub struct ActionMappingSet {
    mappings: Vec<Arc<ActionMapping>>,
    lookup: HashMap<String, Arc<ActionMapping>>,
}

impl ActionMappingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_serialized(input: &SerializedActionMappingSet) -> Result<Self, LiveOpsError> {
        let mut set = Self::new();
        set.merge(input)?;
        Ok(set)
    }

    /// Add every mapping of `input`. Nothing is added if any entry is invalid.
    pub fn merge(&mut self, input: &SerializedActionMappingSet) -> Result<(), LiveOpsError> {
        let parsed = input
            .mappings
            .iter()
            .map(ActionMapping::from_serialized)
            .collect::<Result<Vec<_>, _>>()?;
        for mapping in parsed {
            self.add(mapping);
        }
        Ok(())
    }

    pub fn add(&mut self, mapping: ActionMapping) -> &mut Self {
        let mapping = Arc::new(mapping);
        for action in mapping.actions() {
            self.lookup.insert(action.to_string(), mapping.clone());
        }
        self.mappings.push(mapping);
        self
    }

    /// Shorthand for a rule-based mapping of one action type.
    pub fn add_rules<R>(&mut self, action: &str, rules: R) -> Result<&mut Self, LiveOpsError>
    where
        R: IntoIterator,
        R::Item: Into<String>,
    {
        let mapping = ActionMapping::from_rules([action], rules)?;
        Ok(self.add(mapping))
    }

    pub fn serialize(&self) -> Result<SerializedActionMappingSet, LiveOpsError> {
        Ok(SerializedActionMappingSet {
            mappings: self
                .mappings
                .iter()
                .map(|m| m.serialize())
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.lookup.contains_key(action_type)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Apply the mapping registered for `action`'s type.
    ///
    /// Returns `Ok(None)` when no mapping is registered for the type.
    pub fn try_apply(&self, action: &Action) -> Result<Option<Vec<String>>, LiveOpsError> {
        match self.lookup.get(action.action_type.as_str()) {
            Some(mapping) => mapping.apply(action).map(Some),
            None => Ok(None),
        }
    }

    /// Resolve the single resource key of `action`.
    pub fn resolve_resource(&self, action: &Action) -> Result<String, LiveOpsError> {
        let resolved = self
            .try_apply(action)?
            .ok_or_else(|| LiveOpsError::UnmappedAction {
                action_type: action.action_type.clone(),
            })?;
        let mut resolved = resolved.into_iter();
        match (resolved.next(), resolved.next()) {
            (Some(resource), None) => Ok(resource),
            (None, _) => Err(LiveOpsError::MissingResource {
                action_type: action.action_type.clone(),
            }),
            (Some(first), Some(second)) => {
                let mut all = vec![first, second];
                all.extend(resolved);
                Err(LiveOpsError::AmbiguousResource {
                    action_type: action.action_type.clone(),
                    resolved: all,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_set() -> ActionMappingSet {
        let mut set = ActionMappingSet::new();
        set.add_rules("SHOP/BUY", ["account:{client}"]).unwrap();
        set.add_rules("GUILD/JOIN", ["guild:{payload.guild}", "account:{client}"])
            .unwrap();
        set
    }

    #[test]
    fn unmapped_type_is_not_an_error() {
        let set = sample_set();
        let out = set.try_apply(&Action::new("OTHER/THING", json!({}))).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn resolves_single_resource() {
        let set = sample_set();
        let action = Action::new("SHOP/BUY", json!({})).with_client("abc");
        assert_eq!(set.resolve_resource(&action).unwrap(), "account:abc");
    }

    #[test]
    fn multiple_resources_are_ambiguous() {
        let set = sample_set();
        let action = Action::new("GUILD/JOIN", json!({ "guild": "g" })).with_client("abc");
        let err = set.resolve_resource(&action).unwrap_err();
        assert!(matches!(
            err,
            LiveOpsError::AmbiguousResource { ref resolved, .. } if resolved.len() == 2
        ));
        assert!(err.is_config_error());
    }

    #[test]
    fn empty_custom_result_is_missing_resource() {
        let mut set = ActionMappingSet::new();
        set.add(ActionMapping::custom(["X"], |_: &Action| Vec::new()).unwrap());
        let err = set.resolve_resource(&Action::new("X", json!({}))).unwrap_err();
        assert!(matches!(err, LiveOpsError::MissingResource { .. }));
    }

    #[test]
    fn unmapped_resource_is_reported() {
        let set = ActionMappingSet::new();
        let err = set.resolve_resource(&Action::new("X", json!({}))).unwrap_err();
        assert!(matches!(err, LiveOpsError::UnmappedAction { .. }));
    }

    #[test]
    fn serialize_round_trip_preserves_results() {
        let set = sample_set();
        let rebuilt = ActionMappingSet::from_serialized(&set.serialize().unwrap()).unwrap();
        let actions = [
            Action::new("SHOP/BUY", json!({})).with_client("a"),
            Action::new("GUILD/JOIN", json!({ "guild": 3 })).with_client("b"),
            Action::new("NOPE", json!({})),
        ];
        for action in &actions {
            assert_eq!(
                set.try_apply(action).unwrap(),
                rebuilt.try_apply(action).unwrap()
            );
        }
    }

    #[test]
    fn serializing_custom_mapping_fails() {
        let mut set = sample_set();
        set.add(ActionMapping::custom(["X"], |_: &Action| vec!["x".into()]).unwrap());
        assert!(matches!(
            set.serialize(),
            Err(LiveOpsError::NotSerializable { .. })
        ));
    }

    #[test]
    fn later_mapping_wins_lookup() {
        let mut set = ActionMappingSet::new();
        set.add_rules("A", ["first"]).unwrap();
        set.add_rules("A", ["second"]).unwrap();
        let out = set.try_apply(&Action::new("A", json!({}))).unwrap();
        assert_eq!(out, Some(vec!["second".to_string()]));
    }

    #[test]
    fn merge_is_all_or_nothing() {
        let mut set = ActionMappingSet::new();
        let input = SerializedActionMappingSet {
            mappings: vec![
                SerializedActionMapping {
                    actions: vec!["A".into()],
                    rules: vec!["a".into()],
                },
                SerializedActionMapping {
                    actions: vec!["B".into()],
                    rules: vec![],
                },
            ],
        };
        assert!(set.merge(&input).is_err());
        assert!(set.is_empty());
    }

    #[test]
    fn wire_shape_matches_group_metadata() {
        let wire = serde_json::to_value(sample_set().serialize().unwrap()).unwrap();
        assert_eq!(
            wire,
            json!({ "mappings": [
                { "actions": ["SHOP/BUY"], "rules": ["account:{client}"] },
                { "actions": ["GUILD/JOIN"], "rules": ["guild:{payload.guild}", "account:{client}"] },
            ]})
        );
    }
}
