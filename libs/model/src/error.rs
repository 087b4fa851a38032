//! Error types for model validation.

use thiserror::Error;

/// Errors raised when a model value violates its contract.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    /// A resource requirement value is out of range.
    #[error("invalid resource requirement: {0}")]
    InvalidRequirement(String),

    /// The task state string is unknown.
    #[error("unknown task state: {0}")]
    UnknownState(String),
}
