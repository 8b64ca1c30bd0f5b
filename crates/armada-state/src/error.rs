//! Error types for the Armada state store.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// Store failures. redb and serde errors are carried as strings.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("failed to encode record: {0}")]
    Serialize(String),

    #[error("failed to decode record: {0}")]
    Deserialize(String),

    /// A batch would leave a dangling reference, e.g. a disk owned by an
    /// instance that does not exist.
    #[error("conflict: {0}")]
    Conflict(String),
}
