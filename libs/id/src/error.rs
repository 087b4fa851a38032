//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    /// The ID is longer than the backend accepts.
    #[error("{kind} is too long: {actual} characters, at most {max} allowed")]
    TooLong {
        kind: &'static str,
        max: usize,
        actual: usize,
    },

    /// The ID contains a character outside `[A-Za-z0-9_-]`.
    #[error("{kind} contains invalid character {ch:?} at position {position}")]
    InvalidCharacter {
        kind: &'static str,
        ch: char,
        position: usize,
    },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty { .. })
    }
}
