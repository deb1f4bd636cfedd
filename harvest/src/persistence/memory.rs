use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::registry::{RunInsert, RunRegistry, StuckTaskScanner, TaskRegistry};
use crate::run::{Run, RunId, RunStatus};
use crate::task::{Task, TaskId, TaskStatus, TaskTransition};

/// Process-local registry backed by hash maps.
///
/// Each operation runs under one short critical section, which gives every
/// conditional write compare-and-set semantics.
#[derive(Clone, Default, Debug)]
pub struct InMemoryRegistry {
    inner: Arc<Mutex<State>>,
}

#[derive(Default, Debug)]
struct State {
    runs: HashMap<RunId, Run>,
    run_keys: HashMap<String, RunId>,
    tasks: HashMap<TaskId, Task>,
    run_tasks: HashMap<RunId, Vec<TaskId>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs.
    pub async fn run_count(&self) -> usize {
        self.inner.lock().await.runs.len()
    }

    /// Number of stored tasks across all runs.
    pub async fn task_count(&self) -> usize {
        self.inner.lock().await.tasks.len()
    }
}

#[async_trait]
impl RunRegistry for InMemoryRegistry {
    async fn insert_run(&self, run: Run) -> anyhow::Result<RunInsert> {
        let mut guard = self.inner.lock().await;

        if let Some(existing_id) = guard.run_keys.get(&run.request_key).copied() {
            let existing = guard
                .runs
                .get(&existing_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("run key index points at missing run {}", existing_id))?;
            return Ok(RunInsert::Existing(existing));
        }

        guard.run_keys.insert(run.request_key.clone(), run.id);
        guard.runs.insert(run.id, run.clone());
        Ok(RunInsert::Created(run))
    }

    async fn get_run(&self, run_id: RunId) -> anyhow::Result<Option<Run>> {
        Ok(self.inner.lock().await.runs.get(&run_id).cloned())
    }

    async fn stamp_run_started(
        &self,
        run_id: RunId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(run) = guard.runs.get_mut(&run_id) {
            run.started_at.get_or_insert(now);
        }
        Ok(())
    }

    async fn finalize_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        if !status.is_terminal() {
            anyhow::bail!("cannot finalize run {} as {}", run_id, status);
        }

        let mut guard = self.inner.lock().await;
        match guard.runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Running => {
                run.status = status;
                run.completed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn runs_with_status(&self, status: RunStatus) -> anyhow::Result<Vec<RunId>> {
        let guard = self.inner.lock().await;
        let mut runs: Vec<&Run> = guard.runs.values().filter(|r| r.status == status).collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs.into_iter().map(|r| r.id).collect())
    }
}

#[async_trait]
impl TaskRegistry for InMemoryRegistry {
    async fn insert_tasks(&self, run_id: RunId, tasks: Vec<Task>) -> anyhow::Result<bool> {
        if let Some(stray) = tasks.iter().find(|t| t.run_id != run_id) {
            anyhow::bail!("task {} belongs to run {}, not {}", stray.id, stray.run_id, run_id);
        }

        let mut guard = self.inner.lock().await;

        match guard.runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Pending => {
                run.status = RunStatus::Running;
            }
            Some(_) => return Ok(false),
            None => anyhow::bail!("run {} not found", run_id),
        }

        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        for task in tasks {
            guard.tasks.insert(task.id, task);
        }
        guard.run_tasks.entry(run_id).or_default().extend(ids);
        Ok(true)
    }

    async fn get_task(&self, task_id: TaskId) -> anyhow::Result<Option<Task>> {
        Ok(self.inner.lock().await.tasks.get(&task_id).cloned())
    }

    async fn tasks_for_run(&self, run_id: RunId) -> anyhow::Result<Vec<Task>> {
        let guard = self.inner.lock().await;
        let Some(ids) = guard.run_tasks.get(&run_id) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| guard.tasks.get(id).cloned()).collect())
    }

    async fn transition_task(
        &self,
        task_id: TaskId,
        expected: TaskStatus,
        transition: TaskTransition,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        if !transition.allowed_from(expected) {
            anyhow::bail!(
                "illegal task transition {} -> {}",
                expected,
                transition.target()
            );
        }

        let mut guard = self.inner.lock().await;
        let Some(task) = guard.tasks.get_mut(&task_id) else {
            return Ok(false);
        };

        if task.status != expected {
            debug!(
                task_id = %task_id,
                expected = %expected,
                current = %task.status,
                "task transition lost compare-and-set"
            );
            return Ok(false);
        }

        transition.apply(task, now);
        Ok(true)
    }

    async fn mark_task_started(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut guard = self.inner.lock().await;
        match guard.tasks.get_mut(&task_id) {
            Some(task) if task.status == TaskStatus::Dispatched && task.started_at.is_none() => {
                task.started_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl StuckTaskScanner for InMemoryRegistry {
    async fn reclaim_stuck(
        &self,
        run_id: RunId,
        cutoff: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<TaskId>> {
        let mut guard = self.inner.lock().await;
        let ids = guard.run_tasks.get(&run_id).cloned().unwrap_or_default();

        let mut reclaimed = Vec::new();
        for id in ids {
            let Some(task) = guard.tasks.get_mut(&id) else {
                continue;
            };
            let reclaimable = matches!(task.status, TaskStatus::Pending | TaskStatus::Dispatched);
            if reclaimable && task.created_at < cutoff {
                TaskTransition::Failed {
                    message: message.to_string(),
                }
                .apply(task, now);
                reclaimed.push(id);
            }
        }

        Ok(reclaimed)
    }
}
