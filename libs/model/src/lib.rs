//! # tesbatch-model
//!
//! Data model shared by the scheduling crates.
//!
//! ## Design Principles
//!
//! - A `Task` owns its append-only list of `AttemptLog`s; retry and exclusion
//!   state is derived from that list, never stored beside it
//! - The latest attempt is the last element of the list
//! - Catalog rows (`VmInfo`) are immutable snapshots copied into the attempt
//!   that used them
//! - Backend observations are plain data; interpreting them is the job of
//!   `tesbatch-reconcile`
//!
//! ## Layout
//!
//! - [`task`]: tasks, resource requirements, inputs, outputs, executors
//! - [`attempt`]: attempt logs, failure reasons, warnings, node metrics
//! - [`observation`]: what the compute backend reports about a task
//! - [`vm`]: VM catalog rows

pub mod attempt;
mod error;
pub mod observation;
pub mod task;
pub mod vm;

pub use attempt::*;
pub use error::ModelError;
pub use observation::*;
pub use task::*;
pub use vm::*;
