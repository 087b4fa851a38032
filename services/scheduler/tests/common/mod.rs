//! Shared fixtures: in-memory collaborators and a scheduler wired to them.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tesbatch_id::{JobId, PoolId, TaskId};
use tesbatch_model::{
    AttemptLog, Executor, Input, Observation, Output, ResourceRequirement, Task, TaskState, VmInfo,
};
use tesbatch_scheduler::{
    ActiveNodeCount, BatchScheduler, ComputeBackend, ContainerRegistryInfo,
    ContainerRegistryProvider, PoolRef, PoolSpec, QuotaProvider, SchedulerConfig,
    SchedulerResult, SkuCatalog, TaskSpec, VmCoreQuota, VmFamilyCores,
};
use tesbatch_storage::{MockStorage, COMMAND_SCRIPT_INPUT};
use tokio_util::sync::CancellationToken;

pub const TASK_ID: &str = "TestTaskId";
pub const JOB_ID: &str = "JobId-1";
pub const DEFAULT_ACCOUNT: &str = "defaultstorageaccount";

// =============================================================================
// Compute backend
// =============================================================================

#[derive(Debug, Clone)]
pub struct CreatedJob {
    pub job_id: JobId,
    pub task: TaskSpec,
    pub pool: PoolRef,
}

/// Records every mutation and answers observations from a settable value.
#[derive(Default)]
pub struct MockBackend {
    observation: Mutex<Observation>,
    node_counts: Mutex<Vec<ActiveNodeCount>>,
    active_jobs: AtomicU32,
    active_pools: AtomicU32,
    fail_fetch: AtomicBool,
    fail_create_job: AtomicBool,
    fetches: AtomicU32,
    jobs: Mutex<Vec<CreatedJob>>,
    pools: Mutex<Vec<PoolSpec>>,
    deleted_jobs: Mutex<Vec<(TaskId, bool)>>,
    deleted_pools: Mutex<Vec<(PoolId, bool)>>,
}

impl MockBackend {
    pub fn set_observation(&self, observation: Observation) {
        *self.observation.lock().unwrap() = observation;
    }

    pub fn set_node_counts(&self, counts: Vec<ActiveNodeCount>) {
        *self.node_counts.lock().unwrap() = counts;
    }

    pub fn set_active_counts(&self, jobs: u32, pools: u32) {
        self.active_jobs.store(jobs, Ordering::SeqCst);
        self.active_pools.store(pools, Ordering::SeqCst);
    }

    pub fn fail_fetch(&self) {
        self.fail_fetch.store(true, Ordering::SeqCst);
    }

    pub fn fail_create_job(&self) {
        self.fail_create_job.store(true, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn jobs(&self) -> Vec<CreatedJob> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn pools(&self) -> Vec<PoolSpec> {
        self.pools.lock().unwrap().clone()
    }

    /// Deleted task ids, with whether the token was cancelled at the time.
    pub fn deleted_jobs(&self) -> Vec<(TaskId, bool)> {
        self.deleted_jobs.lock().unwrap().clone()
    }

    pub fn deleted_pools(&self) -> Vec<(PoolId, bool)> {
        self.deleted_pools.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComputeBackend for MockBackend {
    async fn fetch_observation(&self, _task_id: &TaskId) -> Result<Observation> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            bail!("[MOCK] backend unavailable");
        }
        Ok(self.observation.lock().unwrap().clone())
    }

    async fn next_job_id(&self, _task_id: &TaskId) -> Result<JobId> {
        Ok(JobId::parse(JOB_ID)?)
    }

    async fn create_pool(&self, spec: &PoolSpec) -> Result<PoolRef> {
        let Some(pool_id) = spec.pool_id.clone() else {
            bail!("[MOCK] named pool without id");
        };
        self.pools.lock().unwrap().push(spec.clone());
        Ok(PoolRef::Named(pool_id))
    }

    async fn create_job(&self, job_id: &JobId, task: &TaskSpec, pool: &PoolRef) -> Result<()> {
        if self.fail_create_job.load(Ordering::SeqCst) {
            bail!("[MOCK] job creation failed");
        }
        self.jobs.lock().unwrap().push(CreatedJob {
            job_id: job_id.clone(),
            task: task.clone(),
            pool: pool.clone(),
        });
        Ok(())
    }

    async fn delete_job(&self, task_id: &TaskId, cancel: &CancellationToken) -> Result<()> {
        self.deleted_jobs
            .lock()
            .unwrap()
            .push((task_id.clone(), cancel.is_cancelled()));
        Ok(())
    }

    async fn delete_pool_if_exists(
        &self,
        pool_id: &PoolId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.deleted_pools
            .lock()
            .unwrap()
            .push((pool_id.clone(), cancel.is_cancelled()));
        Ok(())
    }

    async fn active_node_counts_by_size(&self) -> Result<Vec<ActiveNodeCount>> {
        Ok(self.node_counts.lock().unwrap().clone())
    }

    async fn active_job_count(&self) -> Result<u32> {
        Ok(self.active_jobs.load(Ordering::SeqCst))
    }

    async fn active_pool_count(&self) -> Result<u32> {
        Ok(self.active_pools.load(Ordering::SeqCst))
    }
}

// =============================================================================
// Catalog, quota and registry
// =============================================================================

pub struct MockCatalog(pub Vec<VmInfo>);

#[async_trait]
impl SkuCatalog for MockCatalog {
    async fn vm_sizes_and_prices(&self, _region: &str) -> Result<Vec<VmInfo>> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone)]
pub struct AccountQuotas {
    pub active_job_quota: u32,
    pub pool_quota: u32,
    pub dedicated_cores: u32,
    pub low_priority_cores: u32,
    pub family_enforced: bool,
    pub family_quotas: Vec<VmFamilyCores>,
}

impl Default for AccountQuotas {
    fn default() -> Self {
        Self {
            active_job_quota: 1,
            pool_quota: 1,
            dedicated_cores: 5,
            low_priority_cores: 10,
            family_enforced: false,
            family_quotas: Vec::new(),
        }
    }
}

pub struct MockQuota(pub AccountQuotas);

#[async_trait]
impl QuotaProvider for MockQuota {
    async fn vm_core_quota(&self, low_priority: bool) -> Result<VmCoreQuota> {
        let q = &self.0;
        Ok(VmCoreQuota {
            number_of_cores: if low_priority {
                q.low_priority_cores
            } else {
                q.dedicated_cores
            },
            low_priority,
            family_quota_enforced: !low_priority && q.family_enforced,
            family_quotas: q.family_quotas.clone(),
            pool_quota: q.pool_quota,
            active_job_quota: q.active_job_quota,
        })
    }
}

pub struct MockRegistry(pub Option<ContainerRegistryInfo>);

#[async_trait]
impl ContainerRegistryProvider for MockRegistry {
    async fn registry_info_for_image(&self, image: &str) -> Result<Option<ContainerRegistryInfo>> {
        Ok(self
            .0
            .as_ref()
            .filter(|info| image.starts_with(&info.registry_server))
            .cloned())
    }
}

pub fn registry() -> ContainerRegistryInfo {
    ContainerRegistryInfo {
        registry_server: "registryServer1".to_string(),
        username: "default".to_string(),
        password: "placeholder".to_string(),
    }
}

// =============================================================================
// Harness
// =============================================================================

pub fn vm(
    size: &str,
    family: &str,
    low_priority: bool,
    cores: u32,
    memory: f64,
    price: f64,
) -> VmInfo {
    VmInfo {
        vm_size: size.to_string(),
        family: family.to_string(),
        low_priority,
        cores,
        memory_gb: memory,
        disk_gb: memory * 5.0,
        price_per_hour: price,
    }
}

pub fn default_catalog() -> Vec<VmInfo> {
    vec![
        vm("VmSizeLowPri1", "VmFamily1", true, 1, 4.0, 1.0),
        vm("VmSizeLowPri2", "VmFamily2", true, 2, 8.0, 2.0),
        vm("VmSizeDedicated1", "VmFamily1", false, 1, 4.0, 11.0),
        vm("VmSizeDedicated2", "VmFamily2", false, 2, 8.0, 22.0),
    ]
}

pub struct Setup {
    pub config: SchedulerConfig,
    pub catalog: Vec<VmInfo>,
    pub quotas: AccountQuotas,
    pub registry: Option<ContainerRegistryInfo>,
    pub storage: MockStorage,
}

impl Default for Setup {
    fn default() -> Self {
        let host = "blob.core.windows.net";
        Self {
            config: SchedulerConfig::new(DEFAULT_ACCOUNT),
            catalog: default_catalog(),
            quotas: AccountQuotas::default(),
            registry: None,
            storage: MockStorage::new(host)
                .with_account(DEFAULT_ACCOUNT)
                .with_account("storageaccount1"),
        }
    }
}

impl Setup {
    pub fn build(self) -> Harness {
        let backend = Arc::new(MockBackend::default());
        let storage = Arc::new(self.storage);
        let scheduler = BatchScheduler::new(
            self.config,
            backend.clone(),
            Arc::new(MockCatalog(self.catalog)),
            Arc::new(MockQuota(self.quotas)),
            storage.clone(),
            Arc::new(MockRegistry(self.registry)),
        );
        Harness {
            backend,
            storage,
            scheduler,
        }
    }
}

pub struct Harness {
    pub backend: Arc<MockBackend>,
    pub storage: Arc<MockStorage>,
    pub scheduler: BatchScheduler,
}

impl Harness {
    pub fn new() -> Self {
        Setup::default().build()
    }

    pub async fn process(&self, task: &mut Task) -> SchedulerResult<()> {
        self.scheduler
            .process_task(task, &CancellationToken::new())
            .await
    }

    /// Processes a task against `observation`.
    pub async fn process_with(
        &self,
        task: &mut Task,
        observation: Observation,
    ) -> SchedulerResult<()> {
        self.backend.set_observation(observation);
        self.process(task).await
    }

    /// Text of the scheduler file uploaded for the test task.
    pub fn internal_file(&self, name: &str) -> Option<String> {
        self.storage
            .uploaded_text(&format!("/tes-internal/{TASK_ID}/{name}"))
    }
}

// =============================================================================
// Tasks
// =============================================================================

pub fn task_id() -> TaskId {
    TaskId::parse(TASK_ID).unwrap()
}

/// A queued task with a command script and one output.
pub fn task() -> Task {
    let mut task = Task::new(
        task_id(),
        vec![Executor::new("ubuntu", ["/bin/sh", "-c", "echo hello"])],
    );
    task.resources = ResourceRequirement {
        cpu_cores: 1,
        ram_gb: 1.0,
        disk_gb: 0.0,
        preemptible: true,
        ..ResourceRequirement::default()
    };
    task.inputs = vec![Input::from_content(
        "/cromwell-executions/workflow1/workflowId1/call-Task1/execution/script",
        "echo hello",
    )
    .named(COMMAND_SCRIPT_INPUT)];
    task.outputs = vec![Output::new(
        "/cromwell-executions/workflow1/workflowId1/call-Task1/execution/stdout",
        "/cromwell-executions/workflow1/workflowId1/call-Task1/execution/stdout",
    )];
    task
}

/// A task that already has a submitted, open attempt.
pub fn task_in(state: TaskState) -> Task {
    let mut task = task();
    let mut attempt = AttemptLog::new(chrono::Utc::now());
    attempt.vm = default_catalog().into_iter().next();
    attempt.job_id = Some(JobId::parse(JOB_ID).unwrap());
    task.logs.push(attempt);
    task.state = state;
    task
}
