use std::any::type_name;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::Instrument;

use crate::config::OrchestratorConfig;
use crate::dispatcher::Dispatcher;
use crate::error::OrchestratorError;
use crate::job::SourceId;
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::registry::{Registry, RunInsert};
use crate::reporter::{RegistryReporter, TaskReporter};
use crate::run::{Run, RunId, RunRequest, RunSnapshot, RunStatus};
use crate::submit::{JobSubmitter, ScopeProbe, TimedSubmitter};
use crate::task::{ReportOutcome, TaskId, TaskOutcome};
use crate::telemetry;

/// Token for signaling graceful shutdown to background loops.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point for callers and executing jobs.
///
/// Owns the dispatcher, the reconciler and the job-callback path over one
/// shared registry. `start` spawns the periodic reconcile loop; everything
/// else is a direct call.
pub struct Orchestrator<R: Registry + 'static> {
    config: OrchestratorConfig,
    registry: Arc<R>,
    dispatcher: Dispatcher<R>,
    reconciler: Arc<Reconciler<R>>,
    reporter: RegistryReporter<R>,
    shutdown_token: ShutdownToken,
    started: AtomicBool,
    loop_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl<R: Registry + 'static> fmt::Debug for Orchestrator<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("registry_type", &type_name::<R>())
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl<R: Registry + 'static> Orchestrator<R> {
    /// Wire an orchestrator from a validated config. Every submission is
    /// bounded by `config.submit_timeout()`. Use [`OrchestratorBuilder`].
    ///
    /// [`OrchestratorBuilder`]: super::builder::OrchestratorBuilder
    pub(crate) fn new(
        config: OrchestratorConfig,
        registry: Arc<R>,
        submitter: Arc<dyn JobSubmitter>,
        probe: Arc<dyn ScopeProbe>,
    ) -> Self {
        let submitter: Arc<dyn JobSubmitter> =
            Arc::new(TimedSubmitter::new(submitter, config.submit_timeout()));
        let dispatcher = Dispatcher::new(Arc::clone(&registry), submitter, probe);
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&registry),
            config.stuck_timeout(),
            config.completion_policy,
        ));
        let reporter = RegistryReporter::new(Arc::clone(&registry));

        Self {
            config,
            registry,
            dispatcher,
            reconciler,
            reporter,
            shutdown_token: ShutdownToken::new(),
            started: AtomicBool::new(false),
            loop_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<R> {
        Arc::clone(&self.registry)
    }

    pub fn dispatcher(&self) -> &Dispatcher<R> {
        &self.dispatcher
    }

    pub fn reconciler(&self) -> Arc<Reconciler<R>> {
        Arc::clone(&self.reconciler)
    }

    /// Callback handle for executing jobs.
    pub fn reporter(&self) -> RegistryReporter<R> {
        self.reporter.clone()
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Create a run for `source_ids` and dispatch one job per source.
    ///
    /// Idempotent on `request.key`: a repeated key returns the existing run.
    /// An existing run that never got its tasks (still `pending`) is picked up
    /// and launched.
    pub async fn launch(
        &self,
        request: RunRequest,
        source_ids: Vec<SourceId>,
    ) -> Result<RunId, OrchestratorError> {
        if source_ids.is_empty() {
            return Err(OrchestratorError::EmptySources);
        }

        let span = telemetry::launch_span(&request.key, source_ids.len());
        self.launch_inner(request, source_ids).instrument(span).await
    }

    async fn launch_inner(
        &self,
        request: RunRequest,
        source_ids: Vec<SourceId>,
    ) -> Result<RunId, OrchestratorError> {
        let run = match self
            .registry
            .insert_run(Run::new(&request, source_ids))
            .await?
        {
            RunInsert::Created(run) => {
                tracing::info!(run_id = %run.id, sources = run.source_ids.len(), "run created");
                run
            }
            RunInsert::Existing(run) if run.status == RunStatus::Pending => {
                tracing::info!(run_id = %run.id, "resuming run left pending");
                run
            }
            RunInsert::Existing(run) => {
                tracing::debug!(run_id = %run.id, status = %run.status, "run already launched");
                return Ok(run.id);
            }
        };

        match self.dispatcher.create_tasks(run.id, &run.source_ids).await {
            Ok(_) => {}
            Err(OrchestratorError::RunNotPending { .. }) => {
                // Lost the race to a concurrent launch with the same key.
                return Ok(run.id);
            }
            Err(err) => return Err(err),
        }

        self.dispatcher.dispatch_all(run.id).await?;
        Ok(run.id)
    }

    /// Read-only view of a run and its tasks.
    pub async fn get_run_status(&self, run_id: RunId) -> Result<RunSnapshot, OrchestratorError> {
        let run = self
            .registry
            .get_run(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(run_id))?;
        let tasks = self.registry.tasks_for_run(run_id).await?;
        Ok(RunSnapshot::new(run, tasks))
    }

    /// Job-completion callback.
    pub async fn report(
        &self,
        task_id: TaskId,
        outcome: TaskOutcome,
        error_message: Option<String>,
    ) -> Result<ReportOutcome, OrchestratorError> {
        self.reporter.report(task_id, outcome, error_message).await
    }

    /// The executing job began work on `task_id`.
    pub async fn mark_started(&self, task_id: TaskId) -> Result<ReportOutcome, OrchestratorError> {
        self.reporter.started(task_id).await
    }

    pub async fn reconcile_once(&self) -> anyhow::Result<ReconcileReport> {
        self.reconciler.reconcile_once().await
    }

    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> anyhow::Result<ReconcileReport> {
        self.reconciler.reconcile_at(now).await
    }

    /// Spawn the periodic reconcile loop. Calling it twice is a no-op.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.shutdown_token.is_cancelled() {
            anyhow::bail!("orchestrator already shut down");
        }
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("orchestrator already started");
            return Ok(());
        }

        let handle = self.spawn_reconciler();
        self.loop_handles.lock().await.push(handle);
        tracing::info!(
            interval_ms = self.config.reconcile_interval_ms,
            stuck_timeout_secs = self.config.stuck_timeout_secs,
            "orchestrator started"
        );
        Ok(())
    }

    /// Stop the reconcile loop and wait for it to exit.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of orchestrator");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.loop_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(tokio::time::Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Reconcile loop failed: {:?}", e),
                Err(_) => tracing::warn!("Reconcile loop timed out during shutdown"),
            }
        }

        tracing::info!("Orchestrator shutdown complete");
        Ok(())
    }

    fn spawn_reconciler(&self) -> tokio::task::JoinHandle<()> {
        let reconciler = self.reconciler();
        let interval = self.config.reconcile_interval();
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Reconciler shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = reconciler.reconcile_once().await {
                            tracing::warn!("reconcile cycle error: {err:#}");
                        }
                    }
                }
            }
        })
    }
}
