use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::error::LiveOpsError;
use crate::routing::rule::MappingRule;
use crate::types::ActionType;

/// Custom mapping function for values templates cannot express.
pub type CustomMapper = Arc<dyn Fn(&Action) -> Vec<String> + Send + Sync>;

/// Wire form of a rule-based mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedActionMapping {
    pub actions: Vec<String>,
    pub rules: Vec<String>,
}

#[derive(Clone)]
enum Mapper {
    Rules(Vec<MappingRule>),
    Custom(CustomMapper),
}

/// Binds one or more action types to a list of rules or to a custom function.
#[derive(Clone)]
pub struct ActionMapping {
    actions: Vec<ActionType>,
    mapper: Mapper,
}

impl ActionMapping {
    pub fn from_rules<A, R>(actions: A, rules: R) -> Result<Self, LiveOpsError>
    where
        A: IntoIterator,
        A::Item: Into<ActionType>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        let actions = collect_actions(actions)?;
        let rules = rules
            .into_iter()
            .map(MappingRule::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if rules.is_empty() {
            return Err(LiveOpsError::InvalidMapping {
                actions: actions.iter().map(|a| a.to_string()).collect(),
                reason: "each mapping requires at least one rule".to_string(),
            });
        }
        Ok(Self {
            actions,
            mapper: Mapper::Rules(rules),
        })
    }

    pub fn custom<A, F>(actions: A, mapper: F) -> Result<Self, LiveOpsError>
    where
        A: IntoIterator,
        A::Item: Into<ActionType>,
        F: Fn(&Action) -> Vec<String> + Send + Sync + 'static,
    {
        Ok(Self {
            actions: collect_actions(actions)?,
            mapper: Mapper::Custom(Arc::new(mapper)),
        })
    }

    pub fn from_serialized(mapping: &SerializedActionMapping) -> Result<Self, LiveOpsError> {
        Self::from_rules(mapping.actions.iter().cloned(), mapping.rules.iter().cloned())
    }

    pub fn actions(&self) -> &[ActionType] {
        &self.actions
    }

    pub fn is_custom(&self) -> bool {
        matches!(self.mapper, Mapper::Custom(_))
    }

    pub fn serialize(&self) -> Result<SerializedActionMapping, LiveOpsError> {
        match &self.mapper {
            Mapper::Rules(rules) => Ok(SerializedActionMapping {
                actions: self.actions.iter().map(|a| a.to_string()).collect(),
                rules: rules.iter().map(|r| r.template().to_string()).collect(),
            }),
            Mapper::Custom(_) => Err(LiveOpsError::NotSerializable {
                reason: format!(
                    "mapping for {:?} uses a custom mapper",
                    self.actions.iter().map(|a| a.as_str()).collect::<Vec<_>>()
                ),
            }),
        }
    }

    /// Resolve every rule against `action`, in rule order.
    pub fn apply(&self, action: &Action) -> Result<Vec<String>, LiveOpsError> {
        match &self.mapper {
            Mapper::Custom(f) => Ok(f(action)),
            Mapper::Rules(rules) => {
                let value = action.to_value()?;
                rules
                    .iter()
                    .map(|rule| rule.apply(&value, &action.action_type))
                    .collect()
            }
        }
    }
}

impl fmt::Debug for ActionMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ActionMapping");
        s.field("actions", &self.actions);
        match &self.mapper {
            Mapper::Rules(rules) => s.field("rules", rules),
            Mapper::Custom(_) => s.field("rules", &"<custom>"),
        };
        s.finish()
    }
}

fn collect_actions<A>(actions: A) -> Result<Vec<ActionType>, LiveOpsError>
where
    A: IntoIterator,
    A::Item: Into<ActionType>,
{
    let actions: Vec<ActionType> = actions.into_iter().map(Into::into).collect();
    if actions.is_empty() {
        return Err(LiveOpsError::InvalidMapping {
            actions: Vec::new(),
            reason: "a mapping must name at least one action".to_string(),
        });
    }
    Ok(actions)
}
