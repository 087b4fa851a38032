//! Tasks and their declared resources, inputs, outputs and executors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tesbatch_id::TaskId;
use tracing::debug;

use crate::{AttemptLog, ModelError};

// =============================================================================
// Task State
// =============================================================================

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Queued,
    Initializing,
    Running,
    Complete,
    ExecutorError,
    SystemError,
    Canceled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
            Self::ExecutorError => "EXECUTOR_ERROR",
            Self::SystemError => "SYSTEM_ERROR",
            Self::Canceled => "CANCELED",
        }
    }

    /// Returns true once no further scheduling calls can change the state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::ExecutorError | Self::SystemError | Self::Canceled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "INITIALIZING" => Ok(Self::Initializing),
            "RUNNING" => Ok(Self::Running),
            "COMPLETE" => Ok(Self::Complete),
            "EXECUTOR_ERROR" => Ok(Self::ExecutorError),
            "SYSTEM_ERROR" => Ok(Self::SystemError),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(ModelError::UnknownState(other.to_string())),
        }
    }
}

// =============================================================================
// Resources
// =============================================================================

/// Backend parameter key selecting an explicit VM size.
pub const VM_SIZE_PARAMETER: &str = "vm_size";

/// Backend parameter key carrying a workflow execution identity.
pub const WORKFLOW_EXECUTION_IDENTITY_PARAMETER: &str = "workflow_execution_identity";

/// Recognized entries of the free-form backend parameter map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendParameters {
    pub vm_size: Option<String>,
    pub workflow_execution_identity: Option<String>,
}

impl BackendParameters {
    /// Picks the recognized keys out of a backend parameter map.
    ///
    /// Keys are matched case-insensitively. Unrecognized keys are ignored.
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let mut params = Self::default();

        for (key, value) in map {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }

            if key.eq_ignore_ascii_case(VM_SIZE_PARAMETER) {
                params.vm_size = Some(value.to_string());
            } else if key.eq_ignore_ascii_case(WORKFLOW_EXECUTION_IDENTITY_PARAMETER) {
                params.workflow_execution_identity = Some(value.to_string());
            } else {
                debug!(key = %key, "Ignoring unrecognized backend parameter");
            }
        }

        params
    }
}

/// Resources a task asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirement {
    pub cpu_cores: u32,
    pub ram_gb: f64,
    pub disk_gb: f64,
    pub preemptible: bool,

    /// Explicit VM size. Bypasses cpu/memory/disk matching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_size: Option<String>,

    /// Identity the task must run as. Forces a named pool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_execution_identity: Option<String>,

    /// Sizes or families this task may use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_vm_sizes: Option<Vec<String>>,

    /// Free-form backend hints as submitted with the task.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub backend_parameters: BTreeMap<String, String>,
}

impl Default for ResourceRequirement {
    fn default() -> Self {
        Self {
            cpu_cores: 1,
            ram_gb: 2.0,
            disk_gb: 10.0,
            preemptible: true,
            vm_size: None,
            workflow_execution_identity: None,
            allowed_vm_sizes: None,
            backend_parameters: BTreeMap::new(),
        }
    }
}

impl ResourceRequirement {
    /// Overlays the recognized entries of `backend_parameters` onto the
    /// typed fields.
    pub fn apply_backend_parameters(&mut self) {
        let params = BackendParameters::from_map(&self.backend_parameters);
        if params.vm_size.is_some() {
            self.vm_size = params.vm_size;
        }
        if params.workflow_execution_identity.is_some() {
            self.workflow_execution_identity = params.workflow_execution_identity;
        }
    }

    /// Checks the values are usable for VM matching.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.cpu_cores == 0 {
            return Err(ModelError::InvalidRequirement(
                "cpu_cores must be at least 1".to_string(),
            ));
        }
        if !self.ram_gb.is_finite() || self.ram_gb < 0.0 {
            return Err(ModelError::InvalidRequirement(format!(
                "ram_gb must be a non-negative number, got {}",
                self.ram_gb
            )));
        }
        if !self.disk_gb.is_finite() || self.disk_gb < 0.0 {
            return Err(ModelError::InvalidRequirement(format!(
                "disk_gb must be a non-negative number, got {}",
                self.disk_gb
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Inputs, Outputs, Executors
// =============================================================================

/// Declared kind of an input or output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    #[default]
    File,
    Directory,
}

/// A file the task needs before it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Local path inside the execution root.
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Inline content, materialized at `path` without a remote fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, rename = "type")]
    pub kind: FileType,
}

impl Input {
    /// Input fetched from a URL.
    pub fn from_url(path: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Input materialized from inline content.
    pub fn from_content(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: Some(content.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A file or directory the task produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: FileType,
}

impl Output {
    pub fn new(path: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            url: Some(url.into()),
            ..Self::default()
        }
    }
}

/// One container invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executor {
    pub image: String,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
}

impl Executor {
    pub fn new<I, S>(image: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            image: image.into(),
            command: command.into_iter().map(Into::into).collect(),
            workdir: None,
        }
    }
}

// =============================================================================
// Task
// =============================================================================

/// A unit of work submitted by a workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,
    #[serde(default)]
    pub resources: ResourceRequirement,
    #[serde(default)]
    pub inputs: Vec<Input>,
    #[serde(default)]
    pub outputs: Vec<Output>,
    #[serde(default)]
    pub executors: Vec<Executor>,

    /// Append-only. The last element is the latest attempt.
    #[serde(default)]
    pub logs: Vec<AttemptLog>,

    #[serde(default)]
    pub cancel_requested: bool,

    /// Result code of the latest completed attempt, when the node left one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cromwell_result_code: Option<i32>,
}

impl Task {
    /// Creates a queued task with default resources.
    pub fn new(id: TaskId, executors: Vec<Executor>) -> Self {
        Self {
            id,
            state: TaskState::Queued,
            resources: ResourceRequirement::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            executors,
            logs: Vec::new(),
            cancel_requested: false,
            cromwell_result_code: None,
        }
    }

    pub fn latest_attempt(&self) -> Option<&AttemptLog> {
        self.logs.last()
    }

    /// Returns true if the latest attempt submitted a job that has not been
    /// closed yet.
    pub fn has_live_attempt(&self) -> bool {
        self.latest_attempt().is_some_and(AttemptLog::is_live)
    }

    /// Returns the latest attempt if it is still open, otherwise starts a new
    /// one so an outcome never lands on a closed attempt.
    pub fn open_attempt_mut(&mut self) -> &mut AttemptLog {
        let needs_new = self.logs.last().is_none_or(|log| log.end_time.is_some());
        if needs_new {
            self.logs.push(AttemptLog::new(chrono::Utc::now()));
        }
        let last = self.logs.len() - 1;
        &mut self.logs[last]
    }
}
