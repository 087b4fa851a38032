//! What the compute backend reports about a task's job, task and node.

use serde::{Deserialize, Serialize};

/// State of the backend job(s) matching a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    NotFound,
    Active,
    Completed,
    MultipleFound,
}

/// State of the backend task inside the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchTaskState {
    Active,
    Preparing,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Preempted,
    Other,
}

/// Node error codes the state machine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorCode {
    DiskFull,
    ImagePullFailure,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub code: NodeErrorCode,
    #[serde(default)]
    pub messages: Vec<String>,
}

/// Snapshot of the backend for one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Observation {
    pub job_state: JobState,

    /// `None` when the job exists but holds no task.
    pub task_state: Option<BatchTaskState>,
    pub node_state: Option<NodeState>,
    pub node_error: Option<NodeError>,
    pub node_allocation_failed: bool,
    pub active_job_with_missing_auto_pool: bool,
    pub task_exit_code: Option<i32>,
    pub task_failure_message: Option<String>,
}

impl Observation {
    pub fn job_not_found() -> Self {
        Self::default()
    }

    pub fn task(job_state: JobState, task_state: BatchTaskState) -> Self {
        Self {
            job_state,
            task_state: Some(task_state),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_error_deserializes() {
        let obs: Observation = serde_json::from_str(
            r#"{"job_state":"active","node_error":{"code":"image_pull_failure"}}"#,
        )
        .unwrap();
        let error = obs.node_error.unwrap();
        assert_eq!(error.code, NodeErrorCode::ImagePullFailure);
        assert!(error.messages.is_empty());
    }

    #[test]
    fn test_observation_deserializes_sparse_json() {
        let obs: Observation =
            serde_json::from_str(r#"{"job_state":"active","node_allocation_failed":true}"#)
                .unwrap();
        assert_eq!(obs.job_state, JobState::Active);
        assert!(obs.node_allocation_failed);
        assert!(obs.task_state.is_none());
    }
}
