use thiserror::Error;

pub type CpiResult<T> = Result<T, CpiError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpiError {
    #[error("VM '{0}' not found")]
    VmNotFound(String),

    #[error("disk '{0}' not found")]
    DiskNotFound(String),

    #[error("no disk space: {0}")]
    NoDiskSpace(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("cloud error: {message}")]
    Cloud { message: String },

    #[error("CPI '{cpi}' not found in cpi-config")]
    CpiNotFound { cpi: String },

    #[error("Failed to load CPI for AZ '{az}': CPI '{cpi}' not found in cpi-config")]
    AzCpiNotFound { az: String, cpi: String },

    #[error("unknown CPI type '{0}'")]
    UnknownType(String),
}

impl CpiError {
    /// Target resource is already gone. Deletes and detaches treat this
    /// as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CpiError::VmNotFound(_) | CpiError::DiskNotFound(_))
    }

    pub fn cloud(message: impl Into<String>) -> Self {
        CpiError::Cloud {
            message: message.into(),
        }
    }
}
