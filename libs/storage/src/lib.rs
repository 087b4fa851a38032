//! # tesbatch-storage
//!
//! Turns the storage locations a task declares into URLs a compute node can
//! fetch from or write to, and records the result as transfer manifests.
//!
//! ## Location kinds
//!
//! - `/account/container/blob` and `file:///account/container/blob`:
//!   internal references, signed with a fresh SAS when the account is
//!   readable, otherwise matched against configured external containers
//! - `/cromwell-executions/...` (any execution root): rooted in the default
//!   storage account
//! - `https://{account}.{blob host}/...`: external container token, fresh SAS,
//!   or passed through
//! - any other `http(s)` URL: passed through untouched
//! - files under the local staging directory: uploaded from disk first
//!
//! Local paths written into manifests never carry a query string.

mod access;
mod config;
mod error;
mod manifest;
mod mock;
mod resolver;
pub mod sas;

pub use access::{StorageAccess, StorageAccountInfo};
pub use config::{ExternalStorageContainer, StorageConfig, MAX_SAS_LIFETIME_HOURS};
pub use error::{StorageError, StorageResult};
pub use manifest::{TransferEntry, TransferManifests, TransferMechanism};
pub use mock::{MockStorage, RecordedUpload, MOCK_ACCOUNT_KEY};
pub use resolver::{strip_query, StorageResolver, COMMAND_SCRIPT_INPUT};
pub use sas::AccessMode;
