use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::run::{Run, RunId, RunStatus};
use crate::task::{Task, TaskId, TaskStatus, TaskTransition};

/// Result of inserting a run keyed by its request key.
#[derive(Clone, Debug)]
pub enum RunInsert {
    /// No run existed for the key; this one was stored.
    Created(Run),
    /// A run with the same request key already exists.
    Existing(Run),
}

impl RunInsert {
    pub fn into_run(self) -> Run {
        match self {
            RunInsert::Created(run) | RunInsert::Existing(run) => run,
        }
    }
}

/// Persistence for run lifecycle records.
///
/// Every status write is conditional on the expected prior status, so
/// concurrent writers never need a lock: the losing write is a no-op.
#[async_trait]
pub trait RunRegistry: Send + Sync {
    /// Store a run unless one with the same request key exists.
    async fn insert_run(&self, run: Run) -> anyhow::Result<RunInsert>;

    /// Fetch a run by id.
    async fn get_run(&self, run_id: RunId) -> anyhow::Result<Option<Run>>;

    /// Set `started_at` if it is still unset. Status is untouched.
    async fn stamp_run_started(
        &self,
        run_id: RunId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// `running -> status` with `completed_at = now`.
    ///
    /// Returns `false` if the run was not `running` (already final or never
    /// started), in which case nothing changed.
    async fn finalize_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Ids of all runs currently in `status`.
    async fn runs_with_status(&self, status: RunStatus) -> anyhow::Result<Vec<RunId>>;
}

/// Persistence for per-source task records.
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    /// Insert all tasks of a run and move the run `pending -> running`, atomically.
    ///
    /// Returns `false` without inserting anything if the run is not `pending`.
    async fn insert_tasks(&self, run_id: RunId, tasks: Vec<Task>) -> anyhow::Result<bool>;

    /// Fetch a task by id.
    async fn get_task(&self, task_id: TaskId) -> anyhow::Result<Option<Task>>;

    /// All tasks of a run, in creation order.
    async fn tasks_for_run(&self, run_id: RunId) -> anyhow::Result<Vec<Task>>;

    /// Apply `transition` only if the task is currently `expected`.
    ///
    /// Returns `true` if this write won. A missing task loses like any other.
    /// Errors without writing if `transition` is not allowed from `expected`
    /// (see [`TaskTransition::allowed_from`]).
    async fn transition_task(
        &self,
        task_id: TaskId,
        expected: TaskStatus,
        transition: TaskTransition,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Stamp `started_at` on a `dispatched` task that has not been stamped yet.
    async fn mark_task_started(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;
}

/// Reclaims tasks that never reached a terminal state.
///
/// Implementors fail every `pending` or `dispatched` task of the run created
/// before `cutoff`, one conditional write per task.
#[async_trait]
pub trait StuckTaskScanner: Send + Sync {
    /// Returns the ids of the tasks this call moved to `failed`.
    async fn reclaim_stuck(
        &self,
        run_id: RunId,
        cutoff: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<TaskId>>;
}

/// Everything the orchestrator needs from its store.
pub trait Registry: RunRegistry + TaskRegistry + StuckTaskScanner {}

impl<T> Registry for T where T: RunRegistry + TaskRegistry + StuckTaskScanner {}
