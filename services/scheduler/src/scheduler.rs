//! Task orchestration.
//!
//! `process_task` runs one reconciliation step for one task: observe the
//! backend, resolve the next step, act on it, record the outcome on the task.
//! Calls for different tasks are independent; calls for the same task must be
//! serialized by the caller.

use std::sync::Arc;

use chrono::Utc;
use tesbatch_id::TaskId;
use tesbatch_model::{AttemptLog, FailureReason, Task, TaskState};
use tesbatch_reconcile::{resolve, Failure, RequeueCause, Resolution, RetryTracker};
use tesbatch_storage::{
    strip_query, AccessMode, StorageAccess, StorageError, StorageResolver, COMMAND_SCRIPT_INPUT,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::{ComputeBackend, ContainerRegistryProvider, QuotaProvider, SkuCatalog};
use crate::config::SchedulerConfig;
use crate::error::SchedulerResult;
use crate::metrics::{parse_metrics, ParsedMetrics};
use crate::pool::{
    PoolOrTaskBuilder, PoolRef, BATCH_SCRIPT, DOWNLOAD_MANIFEST, METRICS_FILE, UPLOAD_MANIFEST,
};
use crate::quota::{QuotaVerdict, QuotaVerifier};
use crate::vm_selector::{no_vm_available_detail, VmSelection, VmSelector};

/// Drives tasks through their lifecycle on a batch compute account.
pub struct BatchScheduler {
    config: SchedulerConfig,
    backend: Arc<dyn ComputeBackend>,
    catalog: Arc<dyn SkuCatalog>,
    quota: Arc<dyn QuotaProvider>,
    storage: Arc<dyn StorageAccess>,
    registry: Arc<dyn ContainerRegistryProvider>,
}

impl BatchScheduler {
    pub fn new(
        config: SchedulerConfig,
        backend: Arc<dyn ComputeBackend>,
        catalog: Arc<dyn SkuCatalog>,
        quota: Arc<dyn QuotaProvider>,
        storage: Arc<dyn StorageAccess>,
        registry: Arc<dyn ContainerRegistryProvider>,
    ) -> Self {
        Self {
            config,
            backend,
            catalog,
            quota,
            storage,
            registry,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Runs one reconciliation step.
    ///
    /// Task outcomes are recorded on `task` and return `Ok(())`. Errors mean
    /// the step could not complete; the task is left as it was and the next
    /// call retries.
    #[instrument(skip(self, task, cancel), fields(task_id = %task.id, state = %task.state))]
    pub async fn process_task(
        &self,
        task: &mut Task,
        cancel: &CancellationToken,
    ) -> SchedulerResult<()> {
        if task.state.is_terminal() && !task.cancel_requested {
            debug!("Task is terminal, nothing to do");
            return Ok(());
        }

        let observation = self.backend.fetch_observation(&task.id).await?;
        let resolution = resolve(
            task.state,
            task.cancel_requested,
            task.has_live_attempt(),
            &observation,
        );
        debug!(resolution = ?resolution, "Resolved next step");

        match resolution {
            Resolution::Cancel => self.cancel(task, cancel).await,
            Resolution::Schedule => self.schedule(task, cancel).await,
            Resolution::Requeue(cause) => self.requeue(task, cause, cancel).await,
            Resolution::AllocationFailed => self.allocation_failed(task, cancel).await,
            Resolution::Advance(state) => {
                set_state(task, state);
                Ok(())
            }
            Resolution::Completed { exit_code } => {
                self.complete(task, exit_code, cancel).await;
                Ok(())
            }
            Resolution::Fail(failure) => {
                self.fail(task, failure, cancel).await;
                Ok(())
            }
            Resolution::Unchanged { warning } => {
                warn!(%warning, "Backend state does not match any transition");
                Ok(())
            }
        }
    }

    /// The VM the next attempt for `task` would use.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn select_vm_for_task(&self, task: &Task) -> SchedulerResult<Option<VmSelection>> {
        let mut resources = task.resources.clone();
        resources.apply_backend_parameters();

        let catalog = self.catalog.vm_sizes_and_prices(&self.config.region).await?;
        let tracker =
            RetryTracker::from_attempts(&task.logs, self.config.max_allocation_retries);
        VmSelector::new(&self.config).select(&resources, &catalog, tracker.excluded())
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    async fn schedule(&self, task: &mut Task, cancel: &CancellationToken) -> SchedulerResult<()> {
        if task.executors.is_empty() {
            record_failure(
                task,
                TaskState::SystemError,
                FailureReason::NoExecutorDefined,
                vec!["Task has no executors".to_string()],
            );
            return Ok(());
        }
        task.resources.apply_backend_parameters();
        task.resources.validate()?;

        let catalog = self.catalog.vm_sizes_and_prices(&self.config.region).await?;
        let tracker = RetryTracker::from_attempts(&task.logs, self.config.max_allocation_retries);
        let Some(selection) =
            VmSelector::new(&self.config).select(&task.resources, &catalog, tracker.excluded())?
        else {
            let detail = no_vm_available_detail(&task.resources, catalog.len(), tracker.excluded());
            record_failure(
                task,
                TaskState::SystemError,
                FailureReason::NoVmSizeAvailable,
                vec![detail],
            );
            return Ok(());
        };

        match QuotaVerifier::new(self.quota.as_ref(), self.backend.as_ref())
            .verify(&selection.vm, &catalog)
            .await?
        {
            QuotaVerdict::Sufficient => {}
            QuotaVerdict::Exhausted(exceeded) => {
                info!(
                    vm_size = %selection.vm.vm_size,
                    reason = %exceeded,
                    "Quota in use, task stays queued"
                );
                return Ok(());
            }
            QuotaVerdict::Insufficient(exceeded) => {
                record_failure(
                    task,
                    TaskState::SystemError,
                    FailureReason::InsufficientBatchQuota,
                    vec![exceeded.to_string()],
                );
                return Ok(());
            }
        }

        let job_id = self.backend.next_job_id(&task.id).await?;
        let resolver = StorageResolver::new(&self.config.storage, self.storage.as_ref());

        let manifests = match resolver
            .build_manifests(&task.id, &task.inputs, &task.outputs)
            .await
        {
            Ok(manifests) => manifests,
            Err(err) => {
                let Some(reason) = err.failure_reason() else {
                    return Err(err.into());
                };
                record_failure(task, TaskState::SystemError, reason, vec![failure_detail(err)]);
                return Ok(());
            }
        };

        let mut registry = None;
        for executor in &task.executors {
            if let Some(info) = self.registry.registry_info_for_image(&executor.image).await? {
                registry = Some(info);
                break;
            }
        }

        let builder = PoolOrTaskBuilder::new(&self.config);
        let metrics_url = resolver
            .internal_url(&task.id, METRICS_FILE, AccessMode::Write)
            .await?;
        let script = builder.batch_script(&task.executors, registry.is_some(), &metrics_url);

        let script_url = self
            .upload_internal(&resolver, &task.id, BATCH_SCRIPT, &script)
            .await?;
        let download_url = self
            .upload_internal(&resolver, &task.id, DOWNLOAD_MANIFEST, &manifests.download_json()?)
            .await?;
        let upload_url = self
            .upload_internal(&resolver, &task.id, UPLOAD_MANIFEST, &manifests.upload_json()?)
            .await?;

        let task_spec = builder.task_spec(&task.id, script_url, download_url, upload_url);
        let pool_spec = builder.pool_spec(
            &job_id,
            &selection.vm,
            &task.resources,
            &task.executors,
            registry.as_ref(),
        )?;

        let pool = if let Some(pool_id) = pool_spec.pool_id.clone() {
            let pool = self.backend.create_pool(&pool_spec).await?;
            info!(pool_id = %pool_id, vm_size = %pool_spec.vm_size, "Created batch pool");
            pool
        } else {
            PoolRef::Ephemeral(pool_spec)
        };

        if let Err(e) = self.backend.create_job(&job_id, &task_spec, &pool).await {
            if let Some(pool_id) = pool.pool_id() {
                if let Err(cleanup) = self.backend.delete_pool_if_exists(pool_id, cancel).await {
                    warn!(
                        pool_id = %pool_id,
                        error = %cleanup,
                        "Failed to delete pool after job creation failed"
                    );
                }
            }
            return Err(e.into());
        }

        let mut attempt = AttemptLog::new(Utc::now());
        attempt.vm = Some(selection.vm.clone());
        attempt.job_id = Some(job_id.clone());
        attempt.pool_id = pool.pool_id().cloned();
        attempt.warnings.extend(selection.warning);
        task.logs.push(attempt);

        info!(
            job_id = %job_id,
            vm_size = %selection.vm.vm_size,
            low_priority = selection.vm.low_priority,
            "Created batch job"
        );
        set_state(task, TaskState::Initializing);
        Ok(())
    }

    /// Uploads a scheduler file to the internal container and returns a
    /// read URL for it.
    async fn upload_internal(
        &self,
        resolver: &StorageResolver<'_>,
        task_id: &TaskId,
        file_name: &str,
        text: &str,
    ) -> SchedulerResult<String> {
        let write_url = resolver.internal_url(task_id, file_name, AccessMode::Write).await?;
        self.storage.upload_text(&write_url, text).await?;
        Ok(resolver.internal_url(task_id, file_name, AccessMode::Read).await?)
    }

    // =========================================================================
    // Retries, requeues and cancellation
    // =========================================================================

    async fn allocation_failed(
        &self,
        task: &mut Task,
        cancel: &CancellationToken,
    ) -> SchedulerResult<()> {
        let mut tracker =
            RetryTracker::from_attempts(&task.logs, self.config.max_allocation_retries);
        let failed_size = task
            .latest_attempt()
            .and_then(|attempt| attempt.vm.as_ref())
            .map(|vm| vm.vm_size.clone());
        let exhausted = tracker.record_allocation_failure(failed_size.as_deref());

        let catalog = self.catalog.vm_sizes_and_prices(&self.config.region).await?;
        let next =
            VmSelector::new(&self.config).select(&task.resources, &catalog, tracker.excluded())?;

        self.delete_job_and_pool(task, cancel).await?;

        warn!(
            vm_size = failed_size.as_deref().unwrap_or("unknown"),
            allocation_failures = tracker.allocation_failures(),
            "Node allocation failed"
        );

        let attempt = task.open_attempt_mut();
        attempt.allocation_failed = true;

        if next.is_none() {
            let detail = no_vm_available_detail(&task.resources, catalog.len(), tracker.excluded());
            record_failure(
                task,
                TaskState::SystemError,
                FailureReason::NoVmSizeAvailable,
                vec![detail],
            );
        } else if exhausted {
            let detail = format!(
                "Node allocation failed {} times, exceeding the limit of {} retries",
                tracker.allocation_failures(),
                self.config.max_allocation_retries
            );
            record_failure(
                task,
                TaskState::ExecutorError,
                FailureReason::RetryCountExceeded,
                vec![detail],
            );
        } else {
            attempt.close(Utc::now());
            set_state(task, TaskState::Queued);
        }
        Ok(())
    }

    async fn requeue(
        &self,
        task: &mut Task,
        cause: RequeueCause,
        cancel: &CancellationToken,
    ) -> SchedulerResult<()> {
        self.delete_job_and_pool(task, cancel).await?;
        if let Some(attempt) = task.logs.last_mut() {
            attempt.close(Utc::now());
        }
        info!(cause = ?cause, "Requeued task");
        set_state(task, TaskState::Queued);
        Ok(())
    }

    async fn cancel(&self, task: &mut Task, cancel: &CancellationToken) -> SchedulerResult<()> {
        self.backend.delete_job(&task.id, cancel).await?;
        if let Some(pool_id) = task.latest_attempt().and_then(|a| a.pool_id.clone()) {
            if let Err(e) = self.backend.delete_pool_if_exists(&pool_id, cancel).await {
                warn!(pool_id = %pool_id, error = %e, "Failed to delete pool of canceled task");
            }
        }

        if let Some(attempt) = task.logs.last_mut() {
            attempt.close(Utc::now());
        }
        task.cancel_requested = false;
        // A task that already finished keeps its outcome.
        if !task.state.is_terminal() {
            set_state(task, TaskState::Canceled);
        }
        info!(state = %task.state, "Canceled task");
        Ok(())
    }

    async fn delete_job_and_pool(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> SchedulerResult<()> {
        self.backend.delete_job(&task.id, cancel).await?;
        if let Some(pool_id) = task.latest_attempt().and_then(|a| a.pool_id.as_ref()) {
            self.backend.delete_pool_if_exists(pool_id, cancel).await?;
        }
        Ok(())
    }

    async fn cleanup_best_effort(&self, task: &Task, cancel: &CancellationToken) {
        if let Err(e) = self.delete_job_and_pool(task, cancel).await {
            warn!(error = %e, "Failed to delete job of finished task");
        }
    }

    // =========================================================================
    // Terminal outcomes
    // =========================================================================

    async fn complete(&self, task: &mut Task, exit_code: i32, cancel: &CancellationToken) {
        let metrics = self.fetch_metrics(&task.id).await;
        let result_code = self.fetch_result_code(task).await;

        let attempt = task.open_attempt_mut();
        attempt.executor_mut().exit_code = Some(exit_code);
        attempt.cromwell_result_code = result_code;
        apply_metrics(attempt, metrics);
        attempt.close(Utc::now());
        task.cromwell_result_code = result_code;
        set_state(task, TaskState::Complete);

        self.cleanup_best_effort(task, cancel).await;
    }

    async fn fail(&self, task: &mut Task, failure: Failure, cancel: &CancellationToken) {
        let metrics = match failure.reason {
            FailureReason::TaskFailed => self.fetch_metrics(&task.id).await,
            _ => None,
        };
        let reason = failure.reason;

        let attempt = task.open_attempt_mut();
        if let Some(exit_code) = failure.exit_code {
            attempt.executor_mut().exit_code = Some(exit_code);
        }
        apply_metrics(attempt, metrics);
        record_failure(task, failure.state, reason, failure.system_logs);

        if !matches!(reason, FailureReason::JobNotFound | FailureReason::MoreThanOneJobFound) {
            self.cleanup_best_effort(task, cancel).await;
        }
    }

    /// Reads the node's metrics file. Missing or unreadable files are logged
    /// and skipped.
    async fn fetch_metrics(&self, task_id: &TaskId) -> Option<ParsedMetrics> {
        let resolver = StorageResolver::new(&self.config.storage, self.storage.as_ref());
        let result: SchedulerResult<Option<ParsedMetrics>> = async {
            let url = resolver.internal_url(task_id, METRICS_FILE, AccessMode::Read).await?;
            if !self.storage.blob_exists(&url).await? {
                debug!("No metrics file");
                return Ok(None);
            }
            let text = self.storage.download_text(&url).await?;
            Ok(Some(parse_metrics(&text)))
        }
        .await;

        result.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read node metrics");
            None
        })
    }

    /// Reads the `rc` file the workflow engine's script leaves next to the
    /// command script.
    async fn fetch_result_code(&self, task: &Task) -> Option<i32> {
        let script = task
            .inputs
            .iter()
            .find(|input| input.name.as_deref() == Some(COMMAND_SCRIPT_INPUT))?;
        let (dir, _) = strip_query(&script.path).rsplit_once('/')?;
        let rc_path = format!("{dir}/rc");

        let resolver = StorageResolver::new(&self.config.storage, self.storage.as_ref());
        let result: SchedulerResult<Option<String>> = async {
            let Some(url) = resolver.resolve_url(&rc_path, AccessMode::Read).await? else {
                return Ok(None);
            };
            if !self.storage.blob_exists(&url).await? {
                debug!(path = %rc_path, "No result code file");
                return Ok(None);
            }
            Ok(Some(self.storage.download_text(&url).await?))
        }
        .await;

        match result {
            Ok(text) => text.and_then(|text| match text.trim().parse::<i32>() {
                Ok(code) => Some(code),
                Err(_) => {
                    warn!(path = %rc_path, content = %text.trim(), "Result code is not a number");
                    None
                }
            }),
            Err(e) => {
                warn!(path = %rc_path, error = %e, "Failed to read result code");
                None
            }
        }
    }
}

/// Records a failure on the open attempt (starting one if needed), closes it
/// and moves the task to `state`.
fn record_failure(task: &mut Task, state: TaskState, reason: FailureReason, detail: Vec<String>) {
    let attempt = task.open_attempt_mut();
    attempt.record_failure(reason, detail);
    attempt.close(Utc::now());
    warn!(reason = %reason, "Task failed");
    set_state(task, state);
}

fn set_state(task: &mut Task, state: TaskState) {
    if task.state != state {
        info!(from = %task.state, to = %state, "Task state changed");
        task.state = state;
    }
}

fn apply_metrics(attempt: &mut AttemptLog, metrics: Option<ParsedMetrics>) {
    let Some(parsed) = metrics else {
        return;
    };
    attempt.metrics = Some(parsed.metrics);
    let executor = attempt.executor_mut();
    if parsed.executor_start.is_some() {
        executor.start_time = parsed.executor_start;
    }
    if parsed.executor_end.is_some() {
        executor.end_time = parsed.executor_end;
    }
}

/// The user-facing part of a declaration error.
fn failure_detail(err: StorageError) -> String {
    match err {
        StorageError::InvalidInput(message) | StorageError::InvalidOutput(message) => message,
        other => other.to_string(),
    }
}
