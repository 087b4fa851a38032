//! Collaborator interfaces consumed by the scheduler.
//!
//! Implementations talk to the compute account, the price catalog, the quota
//! source and the container registries. I/O retries and caching belong in
//! the implementations, not in the scheduler.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tesbatch_id::{JobId, PoolId, TaskId};
use tesbatch_model::{Observation, VmInfo};
use tokio_util::sync::CancellationToken;

use crate::pool::{ContainerRegistryInfo, PoolRef, PoolSpec, TaskSpec};

/// Nodes currently allocated for one VM size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveNodeCount {
    pub vm_size: String,
    pub dedicated_nodes: u32,
    pub low_priority_nodes: u32,
}

impl ActiveNodeCount {
    pub fn nodes(&self, low_priority: bool) -> u32 {
        if low_priority {
            self.low_priority_nodes
        } else {
            self.dedicated_nodes
        }
    }
}

/// The compute account jobs and pools run in.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Current job, task and node state for a task.
    async fn fetch_observation(&self, task_id: &TaskId) -> Result<Observation>;

    /// Reserve the id of the next job for a task.
    async fn next_job_id(&self, task_id: &TaskId) -> Result<JobId>;

    /// Create a named pool.
    async fn create_pool(&self, spec: &PoolSpec) -> Result<PoolRef>;

    async fn create_job(&self, job_id: &JobId, task: &TaskSpec, pool: &PoolRef) -> Result<()>;

    /// Delete the job (and its auto pool) created for a task.
    async fn delete_job(&self, task_id: &TaskId, cancel: &CancellationToken) -> Result<()>;

    async fn delete_pool_if_exists(
        &self,
        pool_id: &PoolId,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn active_node_counts_by_size(&self) -> Result<Vec<ActiveNodeCount>>;

    async fn active_job_count(&self) -> Result<u32>;

    async fn active_pool_count(&self) -> Result<u32>;
}

/// VM sizes and prices offered in a region.
#[async_trait]
pub trait SkuCatalog: Send + Sync {
    async fn vm_sizes_and_prices(&self, region: &str) -> Result<Vec<VmInfo>>;
}

/// Core quota of one VM family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmFamilyCores {
    pub family: String,
    pub cores: u32,
}

/// Core quota for one category (dedicated or low-priority).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCoreQuota {
    pub number_of_cores: u32,
    pub low_priority: bool,

    /// Per-family limits apply. Only ever true for dedicated quota.
    pub family_quota_enforced: bool,

    #[serde(default)]
    pub family_quotas: Vec<VmFamilyCores>,

    pub pool_quota: u32,
    pub active_job_quota: u32,
}

impl VmCoreQuota {
    /// Narrows the snapshot to one VM family.
    ///
    /// When family limits do not apply the family quota equals the cores the
    /// caller needs, so family checks pass trivially.
    pub fn for_family(&self, family: &str, cores: u32) -> VmFamilyQuota {
        let enforced = self.family_quota_enforced && !self.low_priority;
        let family_cores = if enforced {
            self.family_quotas
                .iter()
                .find(|q| q.family.eq_ignore_ascii_case(family))
                .map_or(0, |q| q.cores)
        } else {
            cores
        };

        VmFamilyQuota {
            family: family.to_string(),
            low_priority: self.low_priority,
            total_cores: self.number_of_cores,
            family_cores,
            family_quota_enforced: enforced,
            pool_quota: self.pool_quota,
            active_job_quota: self.active_job_quota,
        }
    }
}

/// Quota that applies to one VM family in one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmFamilyQuota {
    pub family: String,
    pub low_priority: bool,
    pub total_cores: u32,
    pub family_cores: u32,
    pub family_quota_enforced: bool,
    pub pool_quota: u32,
    pub active_job_quota: u32,
}

/// Source of account quota.
#[async_trait]
pub trait QuotaProvider: Send + Sync {
    async fn vm_core_quota(&self, low_priority: bool) -> Result<VmCoreQuota>;

    async fn quota_for_requirement(
        &self,
        family: &str,
        low_priority: bool,
        cores: u32,
    ) -> Result<VmFamilyQuota> {
        Ok(self.vm_core_quota(low_priority).await?.for_family(family, cores))
    }
}

/// Looks up credentials for private registries.
#[async_trait]
pub trait ContainerRegistryProvider: Send + Sync {
    /// `None` for images on public registries.
    async fn registry_info_for_image(&self, image: &str) -> Result<Option<ContainerRegistryInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dedicated(enforced: bool) -> VmCoreQuota {
        VmCoreQuota {
            number_of_cores: 100,
            low_priority: false,
            family_quota_enforced: enforced,
            family_quotas: vec![VmFamilyCores {
                family: "VmFamily1".to_string(),
                cores: 9,
            }],
            pool_quota: 1,
            active_job_quota: 1,
        }
    }

    #[test]
    fn test_family_quota_lookup_is_case_insensitive() {
        let quota = dedicated(true).for_family("vmfamily1", 2);
        assert!(quota.family_quota_enforced);
        assert_eq!(quota.family_cores, 9);
        assert_eq!(quota.total_cores, 100);
    }

    #[test]
    fn test_unknown_family_has_no_quota() {
        let quota = dedicated(true).for_family("VmFamily2", 2);
        assert_eq!(quota.family_cores, 0);
    }

    #[test]
    fn test_family_quota_defaults_to_required_cores() {
        let quota = dedicated(false).for_family("VmFamily2", 4);
        assert!(!quota.family_quota_enforced);
        assert_eq!(quota.family_cores, 4);
    }

    #[test]
    fn test_low_priority_never_enforces_family_quota() {
        let quota = VmCoreQuota {
            low_priority: true,
            ..dedicated(true)
        }
        .for_family("VmFamily2", 2);
        assert!(!quota.family_quota_enforced);
        assert_eq!(quota.family_cores, 2);
    }

    #[test]
    fn test_active_node_count_by_category() {
        let count = ActiveNodeCount {
            vm_size: "VmSize1".to_string(),
            dedicated_nodes: 4,
            low_priority_nodes: 8,
        };
        assert_eq!(count.nodes(false), 4);
        assert_eq!(count.nodes(true), 8);
    }
}
