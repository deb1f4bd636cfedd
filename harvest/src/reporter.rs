use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::Instrument;

use crate::error::OrchestratorError;
use crate::registry::Registry;
use crate::task::{ReportOutcome, TaskId, TaskOutcome, TaskStatus, TaskTransition};
use crate::telemetry;

/// Message stored when a job reports failure without one.
pub const DEFAULT_FAILURE_MESSAGE: &str = "job reported failure";

/// Callback surface for executing jobs.
#[async_trait]
pub trait TaskReporter: Send + Sync {
    /// The job began executing.
    ///
    /// `Accepted` if this call stamped `started_at`. Otherwise `Rejected`
    /// with the current status: `dispatched` when already stamped, `pending`
    /// before the dispatch is recorded, terminal when the job should not run.
    async fn started(&self, task_id: TaskId) -> Result<ReportOutcome, OrchestratorError>;

    /// The job finished. Accepted only while the task is `dispatched`.
    async fn report(
        &self,
        task_id: TaskId,
        outcome: TaskOutcome,
        error_message: Option<String>,
    ) -> Result<ReportOutcome, OrchestratorError>;
}

/// Applies job callbacks directly to the task registry.
pub struct RegistryReporter<R: Registry> {
    registry: Arc<R>,
}

impl<R: Registry> Clone for RegistryReporter<R> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<R: Registry> std::fmt::Debug for RegistryReporter<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryReporter")
            .field("registry_type", &std::any::type_name::<R>())
            .finish()
    }
}

impl<R: Registry> RegistryReporter<R> {
    pub fn new(registry: Arc<R>) -> Self {
        Self { registry }
    }

    pub async fn started_at(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, OrchestratorError> {
        if self.registry.mark_task_started(task_id, now).await? {
            tracing::debug!(task_id = %task_id, "task started");
            return Ok(ReportOutcome::Accepted);
        }

        let current = self
            .registry
            .get_task(task_id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound(task_id))?
            .status;
        Ok(ReportOutcome::Rejected { current })
    }

    /// Apply a completion report as of `now`.
    ///
    /// A report for a task that already left `dispatched` is a late report:
    /// it is logged and returned as `Rejected`, and the task is untouched.
    pub async fn report_at(
        &self,
        task_id: TaskId,
        outcome: TaskOutcome,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, OrchestratorError> {
        let transition = match outcome {
            TaskOutcome::Completed => TaskTransition::Completed,
            TaskOutcome::Failed => TaskTransition::Failed {
                message: error_message.unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
            },
        };

        let won = self
            .registry
            .transition_task(task_id, TaskStatus::Dispatched, transition, now)
            .await?;
        if won {
            tracing::info!(task_id = %task_id, outcome = outcome.as_str(), "report accepted");
            return Ok(ReportOutcome::Accepted);
        }

        let current = self
            .registry
            .get_task(task_id)
            .await?
            .ok_or(OrchestratorError::TaskNotFound(task_id))?
            .status;

        if current.is_terminal() {
            telemetry::record_late_report(task_id, current.as_str());
        } else {
            tracing::debug!(
                task_id = %task_id,
                current = current.as_str(),
                "report arrived before dispatch was recorded"
            );
        }

        Ok(ReportOutcome::Rejected { current })
    }
}

#[async_trait]
impl<R: Registry + 'static> TaskReporter for RegistryReporter<R> {
    async fn started(&self, task_id: TaskId) -> Result<ReportOutcome, OrchestratorError> {
        self.started_at(task_id, Utc::now()).await
    }

    async fn report(
        &self,
        task_id: TaskId,
        outcome: TaskOutcome,
        error_message: Option<String>,
    ) -> Result<ReportOutcome, OrchestratorError> {
        self.report_at(task_id, outcome, error_message, Utc::now())
            .instrument(telemetry::report_span(task_id, outcome.as_str()))
            .await
    }
}
