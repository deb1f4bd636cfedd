use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::error::TaskFailure;
use crate::registry::Registry;
use crate::run::{RunId, RunStatus};
use crate::task::{Task, TaskStatus};
use crate::telemetry;

/// How a run's terminal status is derived once every task is terminal.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// One completed task is enough for the run to complete.
    #[default]
    AnySuccess,
    /// The run completes only if every task completed.
    AllSucceeded,
}

impl CompletionPolicy {
    /// Terminal status for the run, or `None` while any task is still open.
    ///
    /// A run without tasks is `failed`: nothing will ever report for it.
    pub fn decide(&self, tasks: &[Task]) -> Option<RunStatus> {
        if tasks.iter().any(|t| !t.is_terminal()) {
            return None;
        }

        let completed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();

        let succeeded = match self {
            CompletionPolicy::AnySuccess => completed > 0,
            CompletionPolicy::AllSucceeded => !tasks.is_empty() && completed == tasks.len(),
        };

        Some(if succeeded {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        })
    }
}

/// What a single reconciliation cycle did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub runs_examined: usize,
    pub tasks_reclaimed: usize,
    pub runs_finalized: usize,
}

impl ReconcileReport {
    fn absorb(&mut self, run: RunReconcile) {
        self.runs_examined += 1;
        self.tasks_reclaimed += run.reclaimed;
        if run.finalized.is_some() {
            self.runs_finalized += 1;
        }
    }
}

/// Outcome of reconciling one run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunReconcile {
    pub reclaimed: usize,
    /// Status this cycle wrote, if it finalized the run.
    pub finalized: Option<RunStatus>,
}

/// Periodic liveness enforcement over the registries.
///
/// Each cycle reclaims tasks that outlived the stuck timeout and finalizes
/// runs whose tasks are all terminal. Every write is conditional, so a cycle
/// racing a job report or another reconciler is safe.
pub struct Reconciler<R: Registry> {
    registry: Arc<R>,
    stuck_timeout: Duration,
    policy: CompletionPolicy,
}

impl<R: Registry> std::fmt::Debug for Reconciler<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("registry_type", &std::any::type_name::<R>())
            .field("stuck_timeout", &self.stuck_timeout)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<R: Registry> Reconciler<R> {
    pub fn new(registry: Arc<R>, stuck_timeout: Duration, policy: CompletionPolicy) -> Self {
        Self {
            registry,
            stuck_timeout,
            policy,
        }
    }

    pub fn stuck_timeout(&self) -> Duration {
        self.stuck_timeout
    }

    pub fn policy(&self) -> CompletionPolicy {
        self.policy
    }

    /// Run one cycle against the wall clock.
    pub async fn reconcile_once(&self) -> anyhow::Result<ReconcileReport> {
        self.reconcile_at(Utc::now()).await
    }

    /// Run one cycle as if the current instant were `now`.
    ///
    /// A failure on one run is logged and the cycle moves on to the next.
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> anyhow::Result<ReconcileReport> {
        let run_ids = self.registry.runs_with_status(RunStatus::Running).await?;
        let mut report = ReconcileReport::default();

        for run_id in run_ids {
            match self
                .reconcile_run_at(run_id, now)
                .instrument(telemetry::reconcile_span(run_id))
                .await
            {
                Ok(run) => report.absorb(run),
                Err(err) => {
                    tracing::warn!(run_id = %run_id, "reconcile failed: {err:#}");
                }
            }
        }

        if report.tasks_reclaimed > 0 || report.runs_finalized > 0 {
            tracing::info!(
                runs_examined = report.runs_examined,
                tasks_reclaimed = report.tasks_reclaimed,
                runs_finalized = report.runs_finalized,
                "reconcile cycle complete"
            );
        } else {
            tracing::debug!(runs_examined = report.runs_examined, "reconcile cycle idle");
        }

        Ok(report)
    }

    /// Reclaim stuck tasks of one run, then finalize it if every task is terminal.
    pub async fn reconcile_run_at(
        &self,
        run_id: RunId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RunReconcile> {
        let cutoff = now.checked_sub_signed(self.stuck_timeout).ok_or_else(|| {
            anyhow::anyhow!(
                "stuck timeout {} reaches before the earliest representable instant",
                self.stuck_timeout
            )
        })?;
        let message = TaskFailure::StuckTimeout.to_string();
        let reclaimed = self
            .registry
            .reclaim_stuck(run_id, cutoff, &message, now)
            .await?;

        let tasks = self.registry.tasks_for_run(run_id).await?;

        if !reclaimed.is_empty() {
            let label = TaskFailure::StuckTimeout.as_label();
            for task in tasks.iter().filter(|t| reclaimed.contains(&t.id)) {
                tracing::debug!(task_id = %task.id, "task reclaimed as stuck");
                telemetry::record_task_failed(&task.source_id, label);
            }
            telemetry::record_tasks_reclaimed(run_id, reclaimed.len());
        }
        let Some(status) = self.policy.decide(&tasks) else {
            return Ok(RunReconcile {
                reclaimed: reclaimed.len(),
                finalized: None,
            });
        };

        if tasks.is_empty() {
            tracing::warn!(run_id = %run_id, "running run has no tasks");
        }

        let won = self.registry.finalize_run(run_id, status, now).await?;
        if won {
            telemetry::record_run_finalized(run_id, status.as_str());
        }

        Ok(RunReconcile {
            reclaimed: reclaimed.len(),
            finalized: won.then_some(status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobHandle, SourceId};
    use crate::persistence::InMemoryRegistry;
    use crate::registry::{RunRegistry, TaskRegistry};
    use crate::run::{Run, RunRequest};
    use crate::task::TaskTransition;

    fn task(status: TaskStatus) -> Task {
        let mut task = Task::pending(RunId::new(), SourceId::new("rss"), Utc::now());
        task.status = status;
        task
    }

    #[test]
    fn test_any_success_policy() {
        let policy = CompletionPolicy::AnySuccess;
        assert_eq!(
            policy.decide(&[task(TaskStatus::Failed), task(TaskStatus::Completed)]),
            Some(RunStatus::Completed)
        );
        assert_eq!(
            policy.decide(&[task(TaskStatus::Failed), task(TaskStatus::Failed)]),
            Some(RunStatus::Failed)
        );
        assert_eq!(
            policy.decide(&[task(TaskStatus::Completed), task(TaskStatus::Dispatched)]),
            None
        );
        assert_eq!(policy.decide(&[]), Some(RunStatus::Failed));
    }

    #[test]
    fn test_all_succeeded_policy() {
        let policy = CompletionPolicy::AllSucceeded;
        assert_eq!(
            policy.decide(&[task(TaskStatus::Completed), task(TaskStatus::Completed)]),
            Some(RunStatus::Completed)
        );
        assert_eq!(
            policy.decide(&[task(TaskStatus::Completed), task(TaskStatus::Failed)]),
            Some(RunStatus::Failed)
        );
        assert_eq!(policy.decide(&[task(TaskStatus::Pending)]), None);
        assert_eq!(policy.decide(&[]), Some(RunStatus::Failed));
    }

    async fn running_run(
        registry: &InMemoryRegistry,
        sources: &[&str],
        created_at: DateTime<Utc>,
    ) -> (RunId, Vec<Task>) {
        let run = Run::new(
            &RunRequest::unique(),
            sources.iter().map(|s| SourceId::new(*s)).collect(),
        );
        let run_id = run.id;
        registry.insert_run(run).await.unwrap();

        let tasks: Vec<Task> = sources
            .iter()
            .map(|s| Task::pending(run_id, SourceId::new(*s), created_at))
            .collect();
        assert!(registry.insert_tasks(run_id, tasks.clone()).await.unwrap());
        (run_id, tasks)
    }

    #[tokio::test]
    async fn test_reclaims_dispatched_task_after_timeout() {
        let registry = Arc::new(InMemoryRegistry::new());
        let t0 = Utc::now();
        let (run_id, tasks) = running_run(&registry, &["rss"], t0).await;
        registry
            .transition_task(
                tasks[0].id,
                TaskStatus::Pending,
                TaskTransition::Dispatched {
                    handle: JobHandle::new("h"),
                },
                t0,
            )
            .await
            .unwrap();

        let reconciler = Reconciler::new(
            Arc::clone(&registry),
            Duration::minutes(10),
            CompletionPolicy::AnySuccess,
        );

        let early = reconciler
            .reconcile_at(t0 + Duration::minutes(9))
            .await
            .unwrap();
        assert_eq!(early.tasks_reclaimed, 0);
        assert_eq!(early.runs_finalized, 0);

        let late = reconciler
            .reconcile_at(t0 + Duration::minutes(10) + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(late.runs_examined, 1);
        assert_eq!(late.tasks_reclaimed, 1);
        assert_eq!(late.runs_finalized, 1);

        let task = registry.get_task(tasks[0].id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error_message.as_deref(),
            Some("stuck beyond timeout; likely lost job or executor crash")
        );

        let run = registry.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_unrepresentable_cutoff_is_an_error_not_a_panic() {
        let registry = Arc::new(InMemoryRegistry::new());
        let t0 = Utc::now();
        let (run_id, _) = running_run(&registry, &["rss"], t0).await;

        // Roughly 300k years: earlier than the first representable instant.
        let reconciler = Reconciler::new(
            Arc::clone(&registry),
            Duration::days(300_000 * 366),
            CompletionPolicy::AnySuccess,
        );

        let err = reconciler.reconcile_run_at(run_id, t0).await.unwrap_err();
        assert!(err.to_string().contains("stuck timeout"));

        let cycle = reconciler.reconcile_at(t0).await.unwrap();
        assert_eq!(cycle, ReconcileReport::default());
        assert_eq!(
            registry.get_run(run_id).await.unwrap().unwrap().status,
            RunStatus::Running
        );
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_reclaim_counts_as_stuck_timeout_failure() {
        use crate::metrics::TASK_FAILURES_TOTAL;

        let registry = Arc::new(InMemoryRegistry::new());
        let t0 = Utc::now();
        let source = format!("reclaim-metric-{}", RunId::new());
        running_run(&registry, &[source.as_str()], t0).await;

        let counter = TASK_FAILURES_TOTAL.with_label_values(&[source.as_str(), "stuck_timeout"]);
        let before = counter.get();

        let reconciler = Reconciler::new(
            Arc::clone(&registry),
            Duration::minutes(10),
            CompletionPolicy::AnySuccess,
        );
        let cycle = reconciler
            .reconcile_at(t0 + Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(cycle.tasks_reclaimed, 1);
        assert_eq!(counter.get() - before, 1.0);
    }

    #[tokio::test]
    async fn test_finalization_is_idempotent() {
        let registry = Arc::new(InMemoryRegistry::new());
        let t0 = Utc::now();
        let (run_id, tasks) = running_run(&registry, &["rss"], t0).await;
        registry
            .transition_task(
                tasks[0].id,
                TaskStatus::Pending,
                TaskTransition::Failed {
                    message: "boom".into(),
                },
                t0,
            )
            .await
            .unwrap();

        let reconciler = Reconciler::new(
            Arc::clone(&registry),
            Duration::minutes(10),
            CompletionPolicy::AnySuccess,
        );
        let first = reconciler.reconcile_run_at(run_id, t0).await.unwrap();
        assert_eq!(first.finalized, Some(RunStatus::Failed));
        let completed_at = registry.get_run(run_id).await.unwrap().unwrap().completed_at;

        let second = reconciler
            .reconcile_run_at(run_id, t0 + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(second.finalized, None);
        assert_eq!(
            registry.get_run(run_id).await.unwrap().unwrap().completed_at,
            completed_at
        );

        let cycle = reconciler.reconcile_at(t0 + Duration::hours(2)).await.unwrap();
        assert_eq!(cycle, ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_open_tasks_keep_run_running() {
        let registry = Arc::new(InMemoryRegistry::new());
        let t0 = Utc::now();
        let (run_id, tasks) = running_run(&registry, &["rss", "reddit"], t0).await;
        registry
            .transition_task(
                tasks[0].id,
                TaskStatus::Pending,
                TaskTransition::Dispatched {
                    handle: JobHandle::new("h"),
                },
                t0,
            )
            .await
            .unwrap();
        registry
            .transition_task(tasks[0].id, TaskStatus::Dispatched, TaskTransition::Completed, t0)
            .await
            .unwrap();

        let reconciler = Reconciler::new(
            Arc::clone(&registry),
            Duration::minutes(10),
            CompletionPolicy::AnySuccess,
        );
        let report = reconciler
            .reconcile_at(t0 + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(report.runs_examined, 1);
        assert_eq!(report.runs_finalized, 0);
        assert_eq!(
            registry.get_run(run_id).await.unwrap().unwrap().status,
            RunStatus::Running
        );
    }
}
