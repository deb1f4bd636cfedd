//! Error types for task failures and caller-facing orchestration errors.
//!
//! - [`TaskFailure`]: why a single task ended up `failed`. Its `Display`
//!   output is exactly what gets stored in the task's `error_message`.
//! - [`OrchestratorError`]: errors returned to callers of the public API.
//!
//! Task failures never surface as run-level errors; the reconciler folds them
//! into the run's terminal status instead.

use thiserror::Error;

use crate::job::SourceId;
use crate::run::{RunId, RunStatus};
use crate::task::TaskId;

/// Reasons a task is finalized as `failed` by the orchestrator itself.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// The worker pool rejected the job synchronously.
    #[error("dispatch failed: {cause}")]
    SubmissionFailure {
        /// Rendered cause chain from the submitter.
        cause: String,
    },

    /// The source had nothing to fetch for this run.
    #[error("no scoped work for source {source_id}")]
    NoScopedWork {
        /// The source that was short-circuited.
        source_id: SourceId,
    },

    /// No terminal update arrived within the stuck timeout.
    #[error("stuck beyond timeout; likely lost job or executor crash")]
    StuckTimeout,
}

impl TaskFailure {
    /// Short stable label (snake_case) for logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskFailure::SubmissionFailure { .. } => "submission_failure",
            TaskFailure::NoScopedWork { .. } => "no_scoped_work",
            TaskFailure::StuckTimeout => "stuck_timeout",
        }
    }

    /// Build a submission failure from any error, keeping its cause chain.
    pub fn submission(err: &anyhow::Error) -> Self {
        TaskFailure::SubmissionFailure {
            cause: format!("{err:#}"),
        }
    }
}

/// Errors returned by the orchestrator's public operations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// A run was requested without any sources.
    #[error("a run needs at least one source")]
    EmptySources,

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    /// Tasks can only be created while the run is still `pending`.
    #[error("run {run_id} is {status}, expected pending")]
    RunNotPending {
        run_id: RunId,
        status: RunStatus,
    },

    /// The registry or another collaborator failed.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn as_label(&self) -> &'static str {
        match self {
            OrchestratorError::EmptySources => "empty_sources",
            OrchestratorError::RunNotFound(_) => "run_not_found",
            OrchestratorError::TaskNotFound(_) => "task_not_found",
            OrchestratorError::RunNotPending { .. } => "run_not_pending",
            OrchestratorError::Storage(_) => "storage",
        }
    }
}
