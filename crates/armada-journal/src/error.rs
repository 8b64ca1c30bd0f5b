use std::time::Duration;

use thiserror::Error;

pub type JournalResult<T> = Result<T, JournalError>;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("state store error: {0}")]
    State(#[from] armada_state::StateError),

    #[error("timed out after {timeout:?} waiting for {name}")]
    LockTimeout { name: String, timeout: Duration },
}
