use std::fmt;

use serde_json::Value;

use crate::error::LiveOpsError;
use crate::types::ActionType;

/// One step of a placeholder path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder { name: String, path: Vec<PathStep> },
}

/// A compiled string template such as `"account:{client}"` or
/// `"guild:{payload.guild.id}"`.
///
/// Placeholders are dotted field paths into the JSON form of an action.
/// Array elements are addressed either as `items.0` or `items[0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRule {
    template: String,
    segments: Vec<Segment>,
}

impl MappingRule {
    pub fn parse(template: impl Into<String>) -> Result<Self, LiveOpsError> {
        let template = template.into();
        if template.trim().is_empty() {
            return Err(invalid(&template, "empty template"));
        }

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut placeholder: Option<String> = None;

        for c in template.chars() {
            match (&mut placeholder, c) {
                (Some(_), '{') => return Err(invalid(&template, "invalid param name")),
                (Some(name), '}') => {
                    if name.is_empty() {
                        return Err(invalid(&template, "empty param name"));
                    }
                    let path = parse_path(&template, name)?;
                    segments.push(Segment::Placeholder {
                        name: std::mem::take(name),
                        path,
                    });
                    placeholder = None;
                }
                (Some(name), c) => name.push(c),
                (None, '{') => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    placeholder = Some(String::new());
                }
                (None, c) => literal.push(c),
            }
        }

        if placeholder.is_some() {
            return Err(invalid(&template, "unterminated param"));
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { template, segments })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Placeholder names in template order.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder { name, .. } => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute every placeholder from `action`, the JSON form of an action
    /// of type `action_type`.
    ///
    /// Missing and `null` fields are errors, so a successful result never
    /// contains an unreplaced placeholder.
    pub fn apply(&self, action: &Value, action_type: &ActionType) -> Result<String, LiveOpsError> {
        let mut out = String::with_capacity(self.template.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder { name, path } => {
                    let value = lookup(action, path)
                        .filter(|v| !v.is_null())
                        .ok_or_else(|| LiveOpsError::UnresolvedPlaceholder {
                            template: self.template.clone(),
                            placeholder: name.clone(),
                            action_type: action_type.clone(),
                        })?;
                    match value {
                        Value::String(s) => out.push_str(s),
                        other => out.push_str(&other.to_string()),
                    }
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for MappingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

fn invalid(template: &str, reason: &str) -> LiveOpsError {
    LiveOpsError::InvalidTemplate {
        template: template.to_string(),
        reason: reason.to_string(),
    }
}

/// Split `a.b[0].c` into steps.
fn parse_path(template: &str, name: &str) -> Result<Vec<PathStep>, LiveOpsError> {
    let mut steps = Vec::new();
    for part in name.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if key.is_empty() && rest.is_empty() {
            return Err(invalid(template, "empty path segment"));
        }
        if !key.is_empty() {
            steps.push(PathStep::Key(key.to_string()));
        }
        while !rest.is_empty() {
            let close = rest
                .find(']')
                .ok_or_else(|| invalid(template, "unterminated index"))?;
            let index = rest[1..close]
                .trim()
                .parse::<usize>()
                .map_err(|_| invalid(template, "array index must be a non-negative integer"))?;
            steps.push(PathStep::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(invalid(template, "unexpected characters after index"));
            }
        }
    }
    Ok(steps)
}

fn lookup<'a>(root: &'a Value, path: &[PathStep]) -> Option<&'a Value> {
    path.iter().try_fold(root, |current, step| match (current, step) {
        (Value::Object(map), PathStep::Key(key)) => map.get(key),
        (Value::Array(items), PathStep::Key(key)) => {
            key.parse::<usize>().ok().and_then(|i| items.get(i))
        }
        (Value::Array(items), PathStep::Index(i)) => items.get(*i),
        _ => None,
    })
}
