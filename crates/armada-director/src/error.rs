//! Director error types.

use std::time::Duration;

use armada_core::CoreError;
use armada_cpi::CpiError;
use armada_journal::JournalError;
use armada_state::StateError;
use thiserror::Error;

use crate::agent::AgentError;

#[derive(Debug, Error)]
pub enum DirectorError {
    /// An instance-level step failed; carries the identity shown in events.
    #[error("'{instance}' failed to {action}: {source}")]
    InstanceFailed {
        instance: String,
        action: String,
        #[source]
        source: Box<DirectorError>,
    },

    #[error("canary '{instance}' of instance group '{group}' failed: {reason}")]
    CanaryFailed {
        group: String,
        instance: String,
        reason: String,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("timed out acquiring lock '{name}' after {timeout:?}")]
    LockTimeout { name: String, timeout: Duration },

    #[error("task cancelled")]
    Cancelled,

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{0}")]
    Conflict(String),

    #[error("'{instance}' is not running after update: {detail}")]
    Unhealthy { instance: String, detail: String },

    #[error("secret store error: {0}")]
    Secret(String),

    #[error(transparent)]
    Cpi(#[from] CpiError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type DirectorResult<T> = Result<T, DirectorError>;

impl DirectorError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        DirectorError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Wrap with the instance identity and the action that failed.
    pub fn for_instance(self, instance: &str, action: &str) -> Self {
        match self {
            // Already attributed.
            e @ DirectorError::InstanceFailed { .. } => e,
            e @ DirectorError::Cancelled => e,
            e => DirectorError::InstanceFailed {
                instance: instance.to_string(),
                action: action.to_string(),
                source: Box::new(e),
            },
        }
    }

    /// The innermost error, skipping instance attribution.
    pub fn root(&self) -> &DirectorError {
        match self {
            DirectorError::InstanceFailed { source, .. } => source.root(),
            e => e,
        }
    }
}

impl From<CoreError> for DirectorError {
    fn from(e: CoreError) -> Self {
        DirectorError::Validation(e.to_string())
    }
}

impl From<JournalError> for DirectorError {
    fn from(e: JournalError) -> Self {
        match e {
            JournalError::State(e) => DirectorError::State(e),
            JournalError::LockTimeout { name, timeout } => DirectorError::LockTimeout { name, timeout },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_attribution_is_applied_once() {
        let err = DirectorError::Cpi(CpiError::CpiNotFound {
            cpi: "cpi-name2".into(),
        })
        .for_instance("web/abc", "delete vm")
        .for_instance("web/abc", "recreate");
        assert_eq!(
            err.to_string(),
            "'web/abc' failed to delete vm: CPI 'cpi-name2' not found in cpi-config"
        );
        assert!(matches!(err.root(), DirectorError::Cpi(_)));
    }

    #[test]
    fn cancellation_is_never_wrapped() {
        let err = DirectorError::Cancelled.for_instance("web/0", "update");
        assert!(matches!(err, DirectorError::Cancelled));
    }
}
