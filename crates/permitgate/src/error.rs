//! Error types for permit and state transitions.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// What a caller was waiting for when a bounded or cancellable wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Acquiring a shared permit.
    Shared,
    /// Acquiring an exclusive permit.
    Exclusive,
    /// Draining outstanding permits before deactivation.
    Deactivate,
}

impl WaitMode {
    pub fn for_acquire(exclusive: bool) -> Self {
        if exclusive {
            WaitMode::Exclusive
        } else {
            WaitMode::Shared
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WaitMode::Shared => "acquire a shared permit on",
            WaitMode::Exclusive => "acquire an exclusive permit on",
            WaitMode::Deactivate => "deactivate",
        }
    }
}

impl fmt::Display for WaitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermitError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state for '{key}': {reason}")]
    InvalidState { key: String, reason: String },

    #[error("timed out after {timeout:?} waiting to {mode} '{key}'")]
    Timeout {
        key: String,
        mode: WaitMode,
        timeout: Duration,
    },

    #[error("permit for '{key}' was already released")]
    DoubleRelease { key: String },

    #[error("cancelled while waiting to {mode} '{key}'")]
    Cancelled { key: String, mode: WaitMode },
}

impl PermitError {
    pub(crate) fn invalid_state(key: &str, reason: impl Into<String>) -> Self {
        PermitError::InvalidState {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PermitError::Timeout { .. })
    }

    /// The key the error was raised for, when there is one.
    pub fn key(&self) -> Option<&str> {
        match self {
            PermitError::InvalidArgument(_) => None,
            PermitError::InvalidState { key, .. }
            | PermitError::Timeout { key, .. }
            | PermitError::DoubleRelease { key }
            | PermitError::Cancelled { key, .. } => Some(key),
        }
    }
}

pub type Result<T> = std::result::Result<T, PermitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_key_and_mode() {
        let err = PermitError::Timeout {
            key: "profile".to_string(),
            mode: WaitMode::Exclusive,
            timeout: Duration::from_millis(100),
        };
        assert_eq!(
            err.to_string(),
            "timed out after 100ms waiting to acquire an exclusive permit on 'profile'"
        );
        assert!(err.is_timeout());
        assert_eq!(err.key(), Some("profile"));
    }

    #[test]
    fn invalid_argument_has_no_key() {
        let err = PermitError::InvalidArgument("name must not be empty".to_string());
        assert_eq!(err.key(), None);
        assert!(!err.is_timeout());
    }

    #[test]
    fn wait_mode_for_acquire() {
        assert_eq!(WaitMode::for_acquire(true), WaitMode::Exclusive);
        assert_eq!(WaitMode::for_acquire(false), WaitMode::Shared);
    }

    #[test]
    fn wait_mode_serializes_snake_case() {
        insta::assert_json_snapshot!(
            [WaitMode::Shared, WaitMode::Exclusive, WaitMode::Deactivate],
            @r#"
        [
          "shared",
          "exclusive",
          "deactivate"
        ]
        "#
        );
    }
}
