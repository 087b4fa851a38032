//! Error types for storage resolution.

use tesbatch_model::FailureReason;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// A declared input cannot be transferred.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A declared output cannot be transferred.
    #[error("invalid output: {0}")]
    InvalidOutput(String),

    /// An external storage container entry is malformed.
    #[error("invalid external storage container '{entry}': {message}")]
    InvalidExternalContainer { entry: String, message: String },

    /// The account key is not valid base64.
    #[error("invalid key for storage account {0}")]
    InvalidAccountKey(String),

    /// The token expiry falls outside the representable time range.
    #[error("SAS lifetime of {hours} hours is out of range")]
    SasLifetimeOutOfRange { hours: i64 },

    /// The default storage account is not visible to the caller's identity.
    #[error("storage account {0} is not accessible")]
    AccountNotAccessible(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A storage collaborator call failed.
    #[error("storage access failed: {0}")]
    Access(#[from] anyhow::Error),
}

impl StorageError {
    /// The task failure this error maps to, if it is caused by the task's
    /// own declarations rather than by infrastructure.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::InvalidInput(_) => Some(FailureReason::InvalidInputFilePath),
            Self::InvalidOutput(_) => Some(FailureReason::InvalidOutputFilePath),
            _ => None,
        }
    }
}
