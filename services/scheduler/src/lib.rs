//! tesbatch scheduler
//!
//! Maps task requests onto a batch compute account. For each task it picks a
//! VM size, checks quota, resolves storage locations into transfer manifests,
//! creates the pool and job, and then follows the backend until the task
//! reaches a terminal state.
//!
//! ## Architecture
//!
//! - **BatchScheduler**: one reconciliation step per `process_task` call
//! - **VmSelector**: cheapest qualifying VM, with low-priority fallback
//! - **QuotaVerifier**: permanent vs transient quota shortfalls
//! - **PoolOrTaskBuilder**: pool spec, task spec and node batch script
//!
//! The state machine and retry tracking live in `tesbatch-reconcile`, storage
//! resolution in `tesbatch-storage`. Collaborators are reached through the
//! traits in [`backend`].

pub mod backend;
pub mod config;
mod error;
pub mod metrics;
pub mod pool;
pub mod quota;
pub mod scheduler;
pub mod vm_selector;

pub use backend::{
    ActiveNodeCount, ComputeBackend, ContainerRegistryProvider, QuotaProvider, SkuCatalog,
    VmCoreQuota, VmFamilyCores, VmFamilyQuota,
};
pub use config::SchedulerConfig;
pub use error::{SchedulerError, SchedulerResult};
pub use pool::{ContainerRegistryInfo, PoolOrTaskBuilder, PoolRef, PoolSpec, TaskSpec};
pub use quota::{QuotaVerdict, QuotaVerifier};
pub use scheduler::BatchScheduler;
pub use vm_selector::{VmSelection, VmSelector};
