use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::TaskFailure;
use crate::job::{JobHandle, JobSpec, SourceId};
use crate::run::RunId;

/// Unique identifier of a per-source task.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a task.
///
/// `pending -> dispatched -> {completed, failed}` and `pending -> failed`.
/// Terminal states are never left.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Failed,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Failed => "failed",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Completed)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "dispatched" => Ok(TaskStatus::Dispatched),
            "failed" => Ok(TaskStatus::Failed),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(anyhow::anyhow!("invalid task status: {}", other)),
        }
    }
}

/// Persisted lifecycle record of one source's work within a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub run_id: RunId,
    pub source_id: SourceId,
    pub status: TaskStatus,
    /// Set in the same write that moves the task to `dispatched`.
    pub job_handle: Option<JobHandle>,
    pub created_at: DateTime<Utc>,
    /// Stamped by the executing job, not by the orchestrator.
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Task {
    /// A new task awaiting dispatch.
    pub fn pending(run_id: RunId, source_id: SourceId, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            run_id,
            source_id,
            status: TaskStatus::Pending,
            job_handle: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// A task that is terminal from the moment it is created.
    pub fn failed(
        run_id: RunId,
        source_id: SourceId,
        failure: &TaskFailure,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: TaskStatus::Failed,
            completed_at: Some(now),
            error_message: Some(failure.to_string()),
            ..Self::pending(run_id, source_id, now)
        }
    }

    pub fn job_spec(&self) -> JobSpec {
        JobSpec::new(self.run_id, self.id, self.source_id.clone())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Terminal status reported by an executing job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Failed,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Completed => "completed",
            TaskOutcome::Failed => "failed",
        }
    }
}

/// A single conditional write applied to a task by the registry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TaskTransition {
    /// `-> dispatched`, recording the pool's handle.
    Dispatched { handle: JobHandle },
    /// `-> completed`.
    Completed,
    /// `-> failed` with a diagnostic message.
    Failed { message: String },
}

impl TaskTransition {
    pub fn target(&self) -> TaskStatus {
        match self {
            TaskTransition::Dispatched { .. } => TaskStatus::Dispatched,
            TaskTransition::Completed => TaskStatus::Completed,
            TaskTransition::Failed { .. } => TaskStatus::Failed,
        }
    }

    /// Whether a task in `from` may take this transition.
    ///
    /// Tasks only move forward: `pending -> dispatched -> completed`, and
    /// `failed` from either open status. Terminal tasks never move again.
    pub fn allowed_from(&self, from: TaskStatus) -> bool {
        matches!(
            (from, self),
            (TaskStatus::Pending, TaskTransition::Dispatched { .. })
                | (TaskStatus::Dispatched, TaskTransition::Completed)
                | (
                    TaskStatus::Pending | TaskStatus::Dispatched,
                    TaskTransition::Failed { .. }
                )
        )
    }

    /// Apply the transition to an in-memory record. Callers check the prior status.
    pub fn apply(&self, task: &mut Task, now: DateTime<Utc>) {
        match self {
            TaskTransition::Dispatched { handle } => {
                task.status = TaskStatus::Dispatched;
                task.job_handle = Some(handle.clone());
            }
            TaskTransition::Completed => {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(now);
            }
            TaskTransition::Failed { message } => {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(now);
                task.error_message = Some(message.clone());
            }
        }
    }
}

/// Result of a job callback: a start stamp or a completion report.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ReportOutcome {
    /// The callback was applied.
    Accepted,
    /// Nothing was written; `current` is the status the task was found in.
    Rejected { current: TaskStatus },
}

impl ReportOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ReportOutcome::Accepted)
    }
}
