//! Error types for manifest/config handling and desired-state resolution.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while parsing or resolving deployment documents.
///
/// Every variant is a validation failure: it is raised before the
/// director performs any mutating operation.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("invalid cloud config: {0}")]
    CloudConfig(String),

    #[error("invalid update policy: {0}")]
    UpdatePolicy(String),

    #[error("instance group '{group}': {message}")]
    InstanceGroup { group: String, message: String },

    #[error("unknown {kind} '{name}' referenced by instance group '{group}'")]
    UnknownReference {
        group: String,
        kind: &'static str,
        name: String,
    },

    #[error("invalid network definition: {0}")]
    Network(String),

    #[error("failed to parse document: {0}")]
    Parse(String),
}
