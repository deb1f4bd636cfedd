use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::error::{OrchestratorError, TaskFailure};
use crate::job::{JobHandle, SourceId};
use crate::registry::Registry;
use crate::run::{RunId, RunStatus};
use crate::submit::{JobSubmitter, ScopeProbe};
use crate::task::{Task, TaskStatus, TaskTransition};
use crate::telemetry;

/// What happened to a single task's dispatch attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchOutcome {
    /// The pool accepted the job.
    Dispatched(JobHandle),
    /// The pool rejected the job; the task is now `failed` with this message.
    Failed(String),
    /// The task was no longer `pending`; nothing was submitted.
    Skipped,
}

/// Per-outcome counts for one `dispatch_all` pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub dispatched: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl DispatchSummary {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Dispatched(_) => self.dispatched += 1,
            DispatchOutcome::Failed(_) => self.failed += 1,
            DispatchOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn attempted(&self) -> usize {
        self.dispatched + self.failed
    }
}

/// Turns runs into task records and hands one job per task to the pool.
///
/// Every failure mode ends in a recorded state: a rejected submission is
/// written as `failed` before `dispatch` returns, and a source without scoped
/// work never gets a pending task at all.
pub struct Dispatcher<R: Registry> {
    registry: Arc<R>,
    submitter: Arc<dyn JobSubmitter>,
    probe: Arc<dyn ScopeProbe>,
}

impl<R: Registry> Clone for Dispatcher<R> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            submitter: Arc::clone(&self.submitter),
            probe: Arc::clone(&self.probe),
        }
    }
}

impl<R: Registry> std::fmt::Debug for Dispatcher<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry_type", &std::any::type_name::<R>())
            .finish_non_exhaustive()
    }
}

impl<R: Registry> Dispatcher<R> {
    pub fn new(
        registry: Arc<R>,
        submitter: Arc<dyn JobSubmitter>,
        probe: Arc<dyn ScopeProbe>,
    ) -> Self {
        Self {
            registry,
            submitter,
            probe,
        }
    }

    /// Create one task per source and move the run to `running`.
    ///
    /// Sources the probe reports as empty get a task that is already
    /// `failed` with the no-scoped-work message. A probe error counts as
    /// "has work" so the source still gets a chance to run.
    pub async fn create_tasks(
        &self,
        run_id: RunId,
        source_ids: &[SourceId],
    ) -> Result<Vec<Task>, OrchestratorError> {
        if source_ids.is_empty() {
            return Err(OrchestratorError::EmptySources);
        }

        let run = self
            .registry
            .get_run(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(run_id))?;
        if run.status != RunStatus::Pending {
            return Err(OrchestratorError::RunNotPending {
                run_id,
                status: run.status,
            });
        }

        let now = Utc::now();
        let mut tasks = Vec::with_capacity(source_ids.len());
        for source_id in source_ids {
            let scoped = match self.probe.has_scoped_work(run_id, source_id).await {
                Ok(scoped) => scoped,
                Err(err) => {
                    tracing::warn!(
                        run_id = %run_id,
                        source_id = %source_id,
                        "scope probe failed, assuming work: {err:#}"
                    );
                    true
                }
            };

            if scoped {
                tasks.push(Task::pending(run_id, source_id.clone(), now));
            } else {
                let failure = TaskFailure::NoScopedWork {
                    source_id: source_id.clone(),
                };
                telemetry::record_task_failed(source_id, failure.as_label());
                tasks.push(Task::failed(run_id, source_id.clone(), &failure, now));
            }
        }

        // A concurrent launch can win the pending -> running write.
        if !self.registry.insert_tasks(run_id, tasks.clone()).await? {
            let status = self
                .registry
                .get_run(run_id)
                .await?
                .map(|run| run.status)
                .unwrap_or(RunStatus::Running);
            return Err(OrchestratorError::RunNotPending { run_id, status });
        }

        tracing::info!(run_id = %run_id, tasks = tasks.len(), "tasks created");
        Ok(tasks)
    }

    /// Submit one pending task and record the result.
    ///
    /// Only registry errors surface as `Err`; a rejected submission is a
    /// `DispatchOutcome::Failed`.
    pub async fn dispatch(&self, task: &Task) -> anyhow::Result<DispatchOutcome> {
        if task.status != TaskStatus::Pending {
            return Ok(DispatchOutcome::Skipped);
        }

        self.dispatch_pending(task)
            .instrument(telemetry::dispatch_span(task.run_id, task.id, &task.source_id))
            .await
    }

    async fn dispatch_pending(&self, task: &Task) -> anyhow::Result<DispatchOutcome> {
        match self.submitter.submit(task.job_spec()).await {
            Ok(handle) => {
                let now = Utc::now();
                let won = self
                    .registry
                    .transition_task(
                        task.id,
                        TaskStatus::Pending,
                        TaskTransition::Dispatched {
                            handle: handle.clone(),
                        },
                        now,
                    )
                    .await?;
                if !won {
                    // Reclaimed while the submission was in flight.
                    tracing::warn!(
                        task_id = %task.id,
                        handle = %handle,
                        "task left pending during submission"
                    );
                    return Ok(DispatchOutcome::Skipped);
                }

                self.registry.stamp_run_started(task.run_id, now).await?;
                telemetry::record_task_dispatched(&task.source_id);
                Ok(DispatchOutcome::Dispatched(handle))
            }
            Err(err) => {
                let failure = TaskFailure::submission(&err);
                let message = failure.to_string();
                let won = self
                    .registry
                    .transition_task(
                        task.id,
                        TaskStatus::Pending,
                        TaskTransition::Failed {
                            message: message.clone(),
                        },
                        Utc::now(),
                    )
                    .await?;
                if !won {
                    return Ok(DispatchOutcome::Skipped);
                }

                telemetry::record_task_failed(&task.source_id, failure.as_label());
                Ok(DispatchOutcome::Failed(message))
            }
        }
    }

    /// Dispatch every task of the run that is still `pending`.
    ///
    /// A registry error on one task is logged and counted as skipped; the
    /// remaining tasks are still attempted.
    pub async fn dispatch_all(&self, run_id: RunId) -> anyhow::Result<DispatchSummary> {
        let tasks = self.registry.tasks_for_run(run_id).await?;
        let mut summary = DispatchSummary::default();

        for task in tasks.iter().filter(|t| t.status == TaskStatus::Pending) {
            let outcome = match self.dispatch(task).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(task_id = %task.id, "dispatch bookkeeping failed: {err:#}");
                    DispatchOutcome::Skipped
                }
            };
            summary.record(&outcome);
        }

        tracing::info!(
            run_id = %run_id,
            dispatched = summary.dispatched,
            failed = summary.failed,
            skipped = summary.skipped,
            "run dispatched"
        );
        Ok(summary)
    }
}
