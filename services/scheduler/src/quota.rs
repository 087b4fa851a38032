//! Quota verification for a chosen VM.
//!
//! Static limits (the VM can never fit) are permanent. Limits reached only
//! because of current usage are transient: the task waits in the queue.

use std::fmt;

use tesbatch_model::VmInfo;
use tracing::debug;

use crate::backend::{ActiveNodeCount, ComputeBackend, QuotaProvider, VmFamilyQuota};
use crate::error::SchedulerResult;

/// Which limit was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDimension {
    TotalCores,
    FamilyCores,
    Pools,
    ActiveJobs,
}

impl fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TotalCores => "core quota",
            Self::FamilyCores => "VM family core quota",
            Self::Pools => "pool quota",
            Self::ActiveJobs => "active job quota",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaExceeded {
    pub dimension: QuotaDimension,
    pub limit: u32,
    pub current_usage: u32,
    pub requested: u32,
}

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Insufficient {}: limit {}, in use {}, requested {}",
            self.dimension, self.limit, self.current_usage, self.requested
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaVerdict {
    Sufficient,

    /// Current usage leaves no room; try again later.
    Exhausted(QuotaExceeded),

    /// The account can never run this VM.
    Insufficient(QuotaExceeded),
}

/// Usage snapshot taken from the backend.
#[derive(Debug, Clone, Default)]
pub struct QuotaUsage {
    pub active_nodes: Vec<ActiveNodeCount>,
    pub active_jobs: u32,
    pub active_pools: u32,
}

impl QuotaUsage {
    /// Cores in use in one category, optionally limited to a family.
    ///
    /// Sizes missing from the catalog are not counted.
    pub fn used_cores(&self, catalog: &[VmInfo], low_priority: bool, family: Option<&str>) -> u32 {
        self.active_nodes
            .iter()
            .filter_map(|count| {
                let vm = catalog.iter().find(|vm| vm.is_named(&count.vm_size))?;
                if family.is_some_and(|f| !vm.is_in_family(f)) {
                    return None;
                }
                Some(count.nodes(low_priority).saturating_mul(vm.cores))
            })
            .fold(0u32, u32::saturating_add)
    }
}

/// Checks a chosen VM against quota and usage.
///
/// Every attempt creates one pool and one job.
pub fn evaluate(
    vm: &VmInfo,
    quota: &VmFamilyQuota,
    usage: &QuotaUsage,
    catalog: &[VmInfo],
) -> QuotaVerdict {
    let required = vm.cores;

    if required > quota.total_cores {
        return QuotaVerdict::Insufficient(QuotaExceeded {
            dimension: QuotaDimension::TotalCores,
            limit: quota.total_cores,
            current_usage: 0,
            requested: required,
        });
    }

    if quota.family_quota_enforced && required > quota.family_cores {
        return QuotaVerdict::Insufficient(QuotaExceeded {
            dimension: QuotaDimension::FamilyCores,
            limit: quota.family_cores,
            current_usage: 0,
            requested: required,
        });
    }

    let used = usage.used_cores(catalog, vm.low_priority, None);
    if used.saturating_add(required) > quota.total_cores {
        return QuotaVerdict::Exhausted(QuotaExceeded {
            dimension: QuotaDimension::TotalCores,
            limit: quota.total_cores,
            current_usage: used,
            requested: required,
        });
    }

    if quota.family_quota_enforced {
        let family_used = usage.used_cores(catalog, vm.low_priority, Some(&vm.family));
        if family_used.saturating_add(required) > quota.family_cores {
            return QuotaVerdict::Exhausted(QuotaExceeded {
                dimension: QuotaDimension::FamilyCores,
                limit: quota.family_cores,
                current_usage: family_used,
                requested: required,
            });
        }
    }

    if usage.active_pools.saturating_add(1) > quota.pool_quota {
        return QuotaVerdict::Exhausted(QuotaExceeded {
            dimension: QuotaDimension::Pools,
            limit: quota.pool_quota,
            current_usage: usage.active_pools,
            requested: 1,
        });
    }

    if usage.active_jobs.saturating_add(1) > quota.active_job_quota {
        return QuotaVerdict::Exhausted(QuotaExceeded {
            dimension: QuotaDimension::ActiveJobs,
            limit: quota.active_job_quota,
            current_usage: usage.active_jobs,
            requested: 1,
        });
    }

    QuotaVerdict::Sufficient
}

/// Fetches a fresh quota and usage snapshot and evaluates it.
pub struct QuotaVerifier<'a> {
    quota: &'a dyn QuotaProvider,
    backend: &'a dyn ComputeBackend,
}

impl<'a> QuotaVerifier<'a> {
    pub fn new(quota: &'a dyn QuotaProvider, backend: &'a dyn ComputeBackend) -> Self {
        Self { quota, backend }
    }

    pub async fn verify(&self, vm: &VmInfo, catalog: &[VmInfo]) -> SchedulerResult<QuotaVerdict> {
        let quota = self
            .quota
            .quota_for_requirement(&vm.family, vm.low_priority, vm.cores)
            .await?;

        let usage = QuotaUsage {
            active_nodes: self.backend.active_node_counts_by_size().await?,
            active_jobs: self.backend.active_job_count().await?,
            active_pools: self.backend.active_pool_count().await?,
        };

        let verdict = evaluate(vm, &quota, &usage, catalog);
        debug!(
            vm_size = %vm.vm_size,
            low_priority = vm.low_priority,
            verdict = ?verdict,
            "Verified quota"
        );
        Ok(verdict)
    }
}
