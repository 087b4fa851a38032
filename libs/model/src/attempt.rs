//! Attempt logs: one per scheduling attempt of a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tesbatch_id::{JobId, PoolId};

use crate::VmInfo;

// =============================================================================
// Failure Reasons and Warnings
// =============================================================================

/// Why an attempt ended in an error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    JobNotFound,
    MoreThanOneJobFound,
    TaskNotFound,
    DiskFull,
    ImageDownloadFailed,
    TaskFailed,
    RetryCountExceeded,
    NoVmSizeAvailable,
    InsufficientBatchQuota,
    InvalidInputFilePath,
    InvalidOutputFilePath,
    NoExecutorDefined,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobNotFound => "JobNotFound",
            Self::MoreThanOneJobFound => "MoreThanOneJobFound",
            Self::TaskNotFound => "TaskNotFound",
            Self::DiskFull => "DiskFull",
            Self::ImageDownloadFailed => "ImageDownloadFailed",
            Self::TaskFailed => "TaskFailed",
            Self::RetryCountExceeded => "RetryCountExceeded",
            Self::NoVmSizeAvailable => "NoVmSizeAvailable",
            Self::InsufficientBatchQuota => "InsufficientBatchQuota",
            Self::InvalidInputFilePath => "InvalidInputFilePath",
            Self::InvalidOutputFilePath => "InvalidOutputFilePath",
            Self::NoExecutorDefined => "NoExecutorDefined",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-fatal notes attached to an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Warning {
    UsedLowPriorityInsteadOfDedicatedVm,
}

impl Warning {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UsedLowPriorityInsteadOfDedicatedVm => "UsedLowPriorityInsteadOfDedicatedVm",
        }
    }
}

// =============================================================================
// Executor Log and Node Metrics
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorLog {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

/// Timings and sizes reported by the node after the task ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMetrics {
    pub blobxfer_image_pull_duration_secs: Option<f64>,
    pub executor_image_pull_duration_secs: Option<f64>,
    pub executor_image_size_gb: Option<f64>,
    pub file_download_duration_secs: Option<f64>,
    pub executor_duration_secs: Option<f64>,
    pub file_upload_duration_secs: Option<f64>,
    pub disk_used_gb: Option<f64>,
    pub disk_used_percent: Option<f64>,
    pub file_download_size_gb: Option<f64>,
    pub file_upload_size_gb: Option<f64>,
}

// =============================================================================
// Attempt Log
// =============================================================================

/// Record of one scheduling attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptLog {
    /// VM chosen for this attempt, if selection got that far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm: Option<VmInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,

    /// Set only for named pools; ephemeral pools live and die with the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<PoolId>,

    pub start_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub warnings: Vec<Warning>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,

    /// First line is always the failure reason when one is set.
    #[serde(default)]
    pub system_logs: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorLog>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<NodeMetrics>,

    /// The backend could not allocate a node for this attempt.
    #[serde(default)]
    pub allocation_failed: bool,

    /// Exit code the workflow engine's wrapper script wrote to `rc`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cromwell_result_code: Option<i32>,
}

impl AttemptLog {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            vm: None,
            job_id: None,
            pool_id: None,
            start_time,
            end_time: None,
            warnings: Vec::new(),
            failure_reason: None,
            system_logs: Vec::new(),
            executor: None,
            metrics: None,
            allocation_failed: false,
            cromwell_result_code: None,
        }
    }

    /// A submitted attempt that has not been closed.
    pub fn is_live(&self) -> bool {
        self.job_id.is_some() && self.end_time.is_none()
    }

    /// Records a failure. The reason becomes the first system log line.
    pub fn record_failure<I, S>(&mut self, reason: FailureReason, detail: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failure_reason = Some(reason);
        self.system_logs.clear();
        self.system_logs.push(reason.as_str().to_string());
        self.system_logs.extend(detail.into_iter().map(Into::into));
    }

    pub fn close(&mut self, at: DateTime<Utc>) {
        if self.end_time.is_none() {
            self.end_time = Some(at);
        }
    }

    pub fn executor_mut(&mut self) -> &mut ExecutorLog {
        self.executor.get_or_insert_with(ExecutorLog::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_serialization() {
        assert_eq!(
            serde_json::to_string(&FailureReason::InvalidInputFilePath).unwrap(),
            "\"InvalidInputFilePath\""
        );
        assert_eq!(FailureReason::NoVmSizeAvailable.to_string(), "NoVmSizeAvailable");
    }

    #[test]
    fn test_record_failure_puts_reason_first() {
        let mut log = AttemptLog::new(Utc::now());
        log.record_failure(FailureReason::DiskFull, ["node ran out of disk"]);

        assert_eq!(log.failure_reason, Some(FailureReason::DiskFull));
        assert_eq!(log.system_logs, vec!["DiskFull", "node ran out of disk"]);
    }

    #[test]
    fn test_live_attempt_requires_job() {
        let mut log = AttemptLog::new(Utc::now());
        assert!(!log.is_live());

        log.job_id = Some(JobId::parse("job-1").unwrap());
        assert!(log.is_live());

        log.close(Utc::now());
        assert!(!log.is_live());
    }

    #[test]
    fn test_close_keeps_first_end_time() {
        let mut log = AttemptLog::new(Utc::now());
        let first = Utc::now();
        log.close(first);
        log.close(first + chrono::Duration::seconds(10));
        assert_eq!(log.end_time, Some(first));
    }
}
