use crate::types::ActionType;

/// Errors that can occur in the live-ops system.
#[derive(Debug, thiserror::Error)]
pub enum LiveOpsError {
    #[error("invalid template string {template:?}: {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("invalid mapping for {actions:?}: {reason}")]
    InvalidMapping { actions: Vec<String>, reason: String },

    #[error("no mapping registered for action {action_type}")]
    UnmappedAction { action_type: ActionType },

    #[error("emitting actions without a resource is not supported: {action_type}")]
    MissingResource { action_type: ActionType },

    #[error("emitting multi resource actions is not supported: {action_type} resolved to {resolved:?}")]
    AmbiguousResource {
        action_type: ActionType,
        resolved: Vec<String>,
    },

    #[error("placeholder {{{placeholder}}} in {template:?} did not resolve for action {action_type}")]
    UnresolvedPlaceholder {
        template: String,
        placeholder: String,
        action_type: ActionType,
    },

    #[error("not serializable: {reason}")]
    NotSerializable { reason: String },

    #[error("invalid partition request: {reason}")]
    InvalidPartition { reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("duplicate action definitions are not allowed: {action_type}")]
    DuplicateAction { action_type: ActionType },

    #[error("malformed action: {reason}")]
    MalformedAction {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("store error: {reason}")]
    StoreError {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("node is shutting down")]
    ShuttingDown,
}

impl LiveOpsError {
    /// Wrap a serde failure at a decode boundary.
    pub(crate) fn malformed(reason: impl Into<String>, e: serde_json::Error) -> Self {
        LiveOpsError::MalformedAction {
            reason: format!("{}: {e}", reason.into()),
            source: Some(Box::new(e)),
        }
    }

    /// Whether this error is a setup-time configuration error.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            LiveOpsError::InvalidTemplate { .. }
                | LiveOpsError::InvalidMapping { .. }
                | LiveOpsError::MissingResource { .. }
                | LiveOpsError::AmbiguousResource { .. }
                | LiveOpsError::NotSerializable { .. }
                | LiveOpsError::InvalidPartition { .. }
                | LiveOpsError::InvalidConfig { .. }
                | LiveOpsError::DuplicateAction { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = LiveOpsError::MissingResource {
            action_type: ActionType::new("GAME/BUY"),
        };
        assert_eq!(
            err.to_string(),
            "emitting actions without a resource is not supported: GAME/BUY"
        );

        let err = LiveOpsError::UnresolvedPlaceholder {
            template: "account:{client}".into(),
            placeholder: "client".into(),
            action_type: ActionType::new("GAME/BUY"),
        };
        assert_eq!(
            err.to_string(),
            "placeholder {client} in \"account:{client}\" did not resolve for action GAME/BUY"
        );

        let err = LiveOpsError::StoreError {
            reason: "connection refused".into(),
            source: None,
        };
        assert_eq!(err.to_string(), "store error: connection refused");
    }

    #[test]
    fn config_errors_are_classified() {
        assert!(LiveOpsError::InvalidPartition {
            reason: "x".into()
        }
        .is_config_error());
        assert!(!LiveOpsError::ShuttingDown.is_config_error());
        assert!(!LiveOpsError::StoreError {
            reason: "x".into(),
            source: None
        }
        .is_config_error());
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LiveOpsError>();
    }
}
