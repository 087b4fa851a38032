//! Reconciliation primitives for batch tasks.
//!
//! This library turns what the compute backend reports into what should
//! happen to a task next. Key concepts:
//!
//! - **Observation**: job, task and node state as seen by the backend.
//! - **Resolution**: the next step for the task, decided by [`resolve`].
//! - **Retry tracking**: allocation failures counted across attempts, read
//!   back from the task's attempt logs by [`RetryTracker`].
//!
//! # Invariants
//!
//! - [`resolve`] is pure: same inputs, same resolution
//! - Retry state is derived, never stored; replaying the attempt logs gives
//!   the same counter and exclusion set

mod retry;
mod state_machine;

pub use retry::{ExclusionSet, RetryTracker, DEFAULT_MAX_RETRIES};
pub use state_machine::{resolve, Failure, RequeueCause, Resolution};
