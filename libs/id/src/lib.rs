//! # tesbatch-id
//!
//! Typed identifiers for the objects the batch scheduler juggles.
//!
//! ## Design Principles
//!
//! - Task ids are assigned by the caller; job ids come from the compute backend
//! - All IDs have a canonical string representation with strict parsing
//! - IDs are typed to prevent passing a task id where a job id is expected
//!
//! ## ID Format
//!
//! IDs are restricted to ASCII letters, digits, `-` and `_`, at most 64
//! characters, which is what the compute backend accepts for job and pool ids.
//!
//! Pool ids for externally managed pools are derived from the job id:
//! `{prefix}_{job_id}`, e.g. `TES_JobId-1`.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Maximum length of any identifier.
pub const MAX_ID_LEN: usize = 64;
