use serde::{Deserialize, Serialize};
use std::fmt;

/// The `type` field of an action, e.g. `"SERVER/EU/CHANGE_COINS"`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionType(pub String);

impl ActionType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Segment encoded in the type name.
    ///
    /// Types with at least three `/`-separated parts carry their segment in
    /// the second part (`"SERVER/EU/BUY"` → `"eu"`). Shorter names have none.
    pub fn segment(&self) -> Option<String> {
        let parts: Vec<&str> = self.0.split('/').collect();
        if parts.len() >= 3 && !parts[1].is_empty() {
            Some(parts[1].to_lowercase())
        } else {
            None
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ActionType {
    fn from(s: String) -> Self {
        Self(s)
    }
}
