//! Error types for the scheduler.

use tesbatch_model::ModelError;
use tesbatch_storage::StorageError;
use thiserror::Error;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that escape `process_task`.
///
/// Task-level outcomes (failed validation, missing quota, node failures) are
/// recorded on the task instead and never show up here.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The resource requirement breaks its contract.
    #[error("invalid resource requirement: {0}")]
    InvalidRequirement(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Storage(StorageError),

    /// A backend, catalog, quota or registry call failed.
    #[error("backend call failed: {0}")]
    Backend(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ModelError> for SchedulerError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::InvalidRequirement(msg) => Self::InvalidRequirement(msg),
            other => Self::InvalidConfig(other.to_string()),
        }
    }
}

impl From<StorageError> for SchedulerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Access(e) => Self::Backend(e),
            other => Self::Storage(other),
        }
    }
}
