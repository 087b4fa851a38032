//! Task state machine.
//!
//! Rules are evaluated in a fixed priority order; the first match wins.

use tesbatch_model::{
    BatchTaskState, FailureReason, JobState, NodeErrorCode, NodeState, Observation, TaskState,
};
use tracing::debug;

/// Why a task goes back to the queue without touching the retry counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueCause {
    /// The job is active but its auto pool is gone.
    MissingAutoPool,

    /// The node running the task was reclaimed.
    NodePreempted,
}

/// A terminal error outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub state: TaskState,
    pub reason: FailureReason,

    /// Detail lines, without the reason itself.
    pub system_logs: Vec<String>,

    pub exit_code: Option<i32>,
}

impl Failure {
    fn system(reason: FailureReason) -> Self {
        Self {
            state: TaskState::SystemError,
            reason,
            system_logs: Vec::new(),
            exit_code: None,
        }
    }

    fn executor(reason: FailureReason, system_logs: Vec<String>) -> Self {
        Self {
            state: TaskState::ExecutorError,
            reason,
            system_logs,
            exit_code: None,
        }
    }
}

/// What should happen to a task next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Cancel the task and delete its job.
    Cancel,

    /// No job exists yet: start a new attempt.
    Schedule,

    /// Close the attempt, delete the job and go back to QUEUED.
    Requeue(RequeueCause),

    /// Node allocation failed; the retry policy decides the outcome.
    AllocationFailed,

    /// Non-terminal progress.
    Advance(TaskState),

    /// The task finished with exit code 0.
    Completed { exit_code: i32 },

    Fail(Failure),

    /// Nothing matched; the state is left as it is.
    Unchanged { warning: String },
}

/// Resolves the next step for a task from its current state and the backend
/// observation.
///
/// `has_live_attempt` is true when the latest attempt submitted a job that
/// has not been closed. A pending cancel is honored in every state so the
/// backend job is always cleaned up; otherwise terminal tasks are left alone.
pub fn resolve(
    current: TaskState,
    cancel_requested: bool,
    has_live_attempt: bool,
    observation: &Observation,
) -> Resolution {
    if cancel_requested {
        return Resolution::Cancel;
    }

    if current.is_terminal() {
        return Resolution::Unchanged {
            warning: format!("task is already {current}"),
        };
    }

    match observation.job_state {
        JobState::NotFound => {
            if current == TaskState::Queued && !has_live_attempt {
                return Resolution::Schedule;
            }
            return Resolution::Fail(Failure::system(FailureReason::JobNotFound));
        }
        JobState::MultipleFound => {
            return Resolution::Fail(Failure::system(FailureReason::MoreThanOneJobFound));
        }
        JobState::Active | JobState::Completed => {}
    }

    if observation.active_job_with_missing_auto_pool {
        return Resolution::Requeue(RequeueCause::MissingAutoPool);
    }

    if observation.node_allocation_failed {
        return Resolution::AllocationFailed;
    }

    if observation.node_state == Some(NodeState::Preempted) {
        return Resolution::Requeue(RequeueCause::NodePreempted);
    }

    if let Some(error) = &observation.node_error {
        match error.code {
            NodeErrorCode::DiskFull => {
                return Resolution::Fail(Failure::executor(
                    FailureReason::DiskFull,
                    error.messages.clone(),
                ));
            }
            NodeErrorCode::ImagePullFailure
                if matches!(current, TaskState::Queued | TaskState::Initializing) =>
            {
                return Resolution::Fail(Failure::executor(
                    FailureReason::ImageDownloadFailed,
                    error.messages.clone(),
                ));
            }
            _ => debug!(code = ?error.code, "Node error does not decide the task state"),
        }
    }

    match observation.task_state {
        Some(BatchTaskState::Active | BatchTaskState::Preparing) => {
            if current == TaskState::Running {
                Resolution::Advance(TaskState::Running)
            } else {
                Resolution::Advance(TaskState::Initializing)
            }
        }
        Some(BatchTaskState::Running) => Resolution::Advance(TaskState::Running),
        Some(BatchTaskState::Completed) if observation.task_exit_code == Some(0) => {
            Resolution::Completed { exit_code: 0 }
        }
        Some(BatchTaskState::Completed | BatchTaskState::Failed) => {
            Resolution::Fail(task_failed(observation))
        }
        None if observation.job_state == JobState::Active => match current {
            TaskState::Queued => Resolution::Advance(TaskState::Queued),
            _ => Resolution::Fail(Failure::system(FailureReason::TaskNotFound)),
        },
        None => Resolution::Unchanged {
            warning: format!(
                "no rule matches job state {:?} without a task while {current}",
                observation.job_state
            ),
        },
    }
}

fn task_failed(observation: &Observation) -> Failure {
    let mut system_logs = Vec::new();
    if let Some(message) = &observation.task_failure_message {
        system_logs.push(message.clone());
    }
    if let Some(code) = observation.task_exit_code {
        system_logs.push(format!("Exit code: {code}"));
    }

    Failure {
        exit_code: observation.task_exit_code,
        ..Failure::executor(FailureReason::TaskFailed, system_logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use tesbatch_model::NodeError;

    fn active(task_state: BatchTaskState) -> Observation {
        Observation::task(JobState::Active, task_state)
    }

    fn completed(exit_code: i32) -> Observation {
        Observation {
            task_exit_code: Some(exit_code),
            ..Observation::task(JobState::Completed, BatchTaskState::Completed)
        }
    }

    fn node_error(code: NodeErrorCode) -> Observation {
        Observation {
            job_state: JobState::Active,
            node_error: Some(NodeError {
                code,
                messages: vec!["node said no".to_string()],
            }),
            ..Observation::default()
        }
    }

    fn failure_reason(resolution: &Resolution) -> Option<(TaskState, FailureReason)> {
        match resolution {
            Resolution::Fail(f) => Some((f.state, f.reason)),
            _ => None,
        }
    }

    #[rstest]
    #[case(TaskState::Queued, active(BatchTaskState::Active), TaskState::Initializing)]
    #[case(TaskState::Queued, active(BatchTaskState::Preparing), TaskState::Initializing)]
    #[case(TaskState::Initializing, active(BatchTaskState::Active), TaskState::Initializing)]
    #[case(TaskState::Running, active(BatchTaskState::Active), TaskState::Running)]
    #[case(TaskState::Initializing, active(BatchTaskState::Running), TaskState::Running)]
    #[case(
        TaskState::Queued,
        Observation { job_state: JobState::Active, ..Observation::default() },
        TaskState::Queued
    )]
    fn test_progress_transitions(
        #[case] current: TaskState,
        #[case] observation: Observation,
        #[case] expected: TaskState,
    ) {
        assert_eq!(
            resolve(current, false, true, &observation),
            Resolution::Advance(expected)
        );
    }

    #[rstest]
    #[case(
        TaskState::Initializing,
        Observation::job_not_found(),
        TaskState::SystemError,
        FailureReason::JobNotFound
    )]
    #[case(
        TaskState::Running,
        Observation { job_state: JobState::MultipleFound, ..Observation::default() },
        TaskState::SystemError,
        FailureReason::MoreThanOneJobFound
    )]
    #[case(
        TaskState::Initializing,
        node_error(NodeErrorCode::DiskFull),
        TaskState::ExecutorError,
        FailureReason::DiskFull
    )]
    #[case(
        TaskState::Running,
        node_error(NodeErrorCode::DiskFull),
        TaskState::ExecutorError,
        FailureReason::DiskFull
    )]
    #[case(
        TaskState::Queued,
        node_error(NodeErrorCode::ImagePullFailure),
        TaskState::ExecutorError,
        FailureReason::ImageDownloadFailed
    )]
    #[case(
        TaskState::Initializing,
        node_error(NodeErrorCode::ImagePullFailure),
        TaskState::ExecutorError,
        FailureReason::ImageDownloadFailed
    )]
    #[case(TaskState::Running, completed(-1), TaskState::ExecutorError, FailureReason::TaskFailed)]
    #[case(
        TaskState::Running,
        Observation { job_state: JobState::Active, ..Observation::default() },
        TaskState::SystemError,
        FailureReason::TaskNotFound
    )]
    #[case(
        TaskState::Initializing,
        Observation { job_state: JobState::Active, ..Observation::default() },
        TaskState::SystemError,
        FailureReason::TaskNotFound
    )]
    fn test_failure_transitions(
        #[case] current: TaskState,
        #[case] observation: Observation,
        #[case] state: TaskState,
        #[case] reason: FailureReason,
    ) {
        let resolution = resolve(current, false, true, &observation);
        assert_eq!(failure_reason(&resolution), Some((state, reason)));
    }

    #[test]
    fn test_running_task_completes() {
        assert_eq!(
            resolve(TaskState::Running, false, true, &completed(0)),
            Resolution::Completed { exit_code: 0 }
        );
    }

    #[test]
    fn test_nonzero_exit_code_is_recorded() {
        let Resolution::Fail(failure) = resolve(TaskState::Running, false, true, &completed(3))
        else {
            panic!("expected failure");
        };
        assert_eq!(failure.exit_code, Some(3));
        assert_eq!(failure.system_logs, vec!["Exit code: 3"]);
    }

    #[test]
    fn test_image_pull_failure_ignored_once_running() {
        let resolution = resolve(
            TaskState::Running,
            false,
            true,
            &Observation {
                task_state: Some(BatchTaskState::Running),
                ..node_error(NodeErrorCode::ImagePullFailure)
            },
        );
        assert_eq!(resolution, Resolution::Advance(TaskState::Running));
    }

    #[rstest]
    #[case(false, Resolution::Schedule)]
    #[case(true, Resolution::Fail(Failure::system(FailureReason::JobNotFound)))]
    fn test_missing_job_while_queued(#[case] live: bool, #[case] expected: Resolution) {
        assert_eq!(
            resolve(TaskState::Queued, false, live, &Observation::job_not_found()),
            expected
        );
    }

    #[test]
    fn test_requeue_causes() {
        let missing_pool = Observation {
            job_state: JobState::Active,
            active_job_with_missing_auto_pool: true,
            ..Observation::default()
        };
        assert_eq!(
            resolve(TaskState::Initializing, false, true, &missing_pool),
            Resolution::Requeue(RequeueCause::MissingAutoPool)
        );

        let preempted = Observation {
            node_state: Some(NodeState::Preempted),
            ..active(BatchTaskState::Running)
        };
        assert_eq!(
            resolve(TaskState::Running, false, true, &preempted),
            Resolution::Requeue(RequeueCause::NodePreempted)
        );
    }

    #[test]
    fn test_allocation_failure_beats_preemption() {
        let observation = Observation {
            job_state: JobState::Active,
            node_allocation_failed: true,
            node_state: Some(NodeState::Preempted),
            ..Observation::default()
        };
        assert_eq!(
            resolve(TaskState::Initializing, false, true, &observation),
            Resolution::AllocationFailed
        );
    }

    #[test]
    fn test_terminal_task_is_left_alone() {
        let resolution = resolve(TaskState::Complete, false, false, &completed(0));
        assert!(matches!(resolution, Resolution::Unchanged { .. }));
    }

    #[rstest]
    #[case(TaskState::Canceled)]
    #[case(TaskState::Complete)]
    #[case(TaskState::SystemError)]
    fn test_cancel_honored_after_terminal_state(#[case] current: TaskState) {
        let observation = Observation {
            job_state: JobState::Active,
            ..Observation::default()
        };
        assert_eq!(resolve(current, true, true, &observation), Resolution::Cancel);
    }

    #[test]
    fn test_completed_job_without_task_is_unmatched() {
        let observation = Observation {
            job_state: JobState::Completed,
            ..Observation::default()
        };
        assert!(matches!(
            resolve(TaskState::Running, false, true, &observation),
            Resolution::Unchanged { .. }
        ));
    }

    fn any_observation() -> impl Strategy<Value = Observation> {
        let job_state = prop_oneof![
            Just(JobState::NotFound),
            Just(JobState::Active),
            Just(JobState::Completed),
            Just(JobState::MultipleFound),
        ];
        let task_state = proptest::option::of(prop_oneof![
            Just(BatchTaskState::Active),
            Just(BatchTaskState::Preparing),
            Just(BatchTaskState::Running),
            Just(BatchTaskState::Completed),
            Just(BatchTaskState::Failed),
        ]);
        (
            job_state,
            task_state,
            any::<bool>(),
            any::<bool>(),
            proptest::option::of(-2i32..3),
        )
            .prop_map(
                |(job_state, task_state, allocation_failed, missing_pool, exit_code)| {
                    Observation {
                        job_state,
                        task_state,
                        node_allocation_failed: allocation_failed,
                        active_job_with_missing_auto_pool: missing_pool,
                        task_exit_code: exit_code,
                        ..Observation::default()
                    }
                },
            )
    }

    fn any_active_state() -> impl Strategy<Value = TaskState> {
        prop_oneof![
            Just(TaskState::Queued),
            Just(TaskState::Initializing),
            Just(TaskState::Running),
        ]
    }

    fn any_state() -> impl Strategy<Value = TaskState> {
        prop_oneof![
            any_active_state(),
            Just(TaskState::Complete),
            Just(TaskState::ExecutorError),
            Just(TaskState::SystemError),
            Just(TaskState::Canceled),
        ]
    }

    proptest! {
        #[test]
        fn prop_cancel_overrides_everything(
            current in any_state(),
            live in any::<bool>(),
            observation in any_observation(),
        ) {
            prop_assert_eq!(resolve(current, true, live, &observation), Resolution::Cancel);
        }

        #[test]
        fn prop_resolution_is_deterministic(
            current in any_active_state(),
            live in any::<bool>(),
            observation in any_observation(),
        ) {
            prop_assert_eq!(
                resolve(current, false, live, &observation),
                resolve(current, false, live, &observation)
            );
        }
    }
}
