use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::error::OrchestratorError;
use crate::job::{JobHandle, JobSpec, SourceId};
use crate::reporter::TaskReporter;
use crate::submit::JobSubmitter;
use crate::task::{ReportOutcome, TaskOutcome, TaskStatus};

use super::supervisor::ShutdownToken;

/// Configuration for the in-process worker pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Prefix for job handles and worker ids.
    pub worker_group: String,
    /// Number of jobs executed at once.
    pub concurrency: usize,
    /// Jobs that may wait for a free worker before `submit` rejects.
    pub backlog_capacity: usize,
    /// Retries for a callback that arrives before its dispatch is recorded.
    pub report_retry_attempts: u32,
    /// Delay between such retries, in milliseconds.
    pub report_retry_delay_ms: u64,
}

impl WorkerPoolConfig {
    pub fn new(worker_group: impl Into<String>) -> Self {
        Self {
            worker_group: worker_group.into(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_backlog_capacity(mut self, capacity: usize) -> Self {
        self.backlog_capacity = capacity;
        self
    }

    pub fn with_report_retry(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.report_retry_attempts = attempts;
        self.report_retry_delay_ms = delay_ms;
        self
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_group: "harvest".to_string(),
            concurrency: 4,
            backlog_capacity: 256,
            report_retry_attempts: 20,
            report_retry_delay_ms: 50,
        }
    }
}

/// Fetch logic for one arena.
///
/// `Ok` reports the task `completed`; `Err` reports it `failed` with the
/// rendered error chain as its message.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn collect(&self, spec: &JobSpec) -> anyhow::Result<()>;
}

struct QueuedJob {
    spec: JobSpec,
    handle: JobHandle,
}

/// Fixed-capacity executor for collection jobs.
///
/// `concurrency` workers pull from one shared bounded backlog, each taking a
/// single job only when it is idle. Jobs are fire-and-forget: completion comes
/// back through the [`TaskReporter`], never through `submit`.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    sender: mpsc::Sender<QueuedJob>,
    shutdown_token: ShutdownToken,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("queued", &(self.config.backlog_capacity - self.sender.capacity()))
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn the workers and return the pool.
    pub fn start(
        config: WorkerPoolConfig,
        adapters: HashMap<SourceId, Arc<dyn SourceAdapter>>,
        reporter: Arc<dyn TaskReporter>,
    ) -> anyhow::Result<Self> {
        if config.concurrency == 0 {
            anyhow::bail!("worker pool concurrency must be at least 1");
        }
        if config.backlog_capacity == 0 {
            anyhow::bail!("worker pool backlog capacity must be at least 1");
        }

        let (sender, receiver) = mpsc::channel(config.backlog_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let adapters = Arc::new(adapters);
        let shutdown_token = ShutdownToken::new();

        let mut handles = Vec::with_capacity(config.concurrency);
        for i in 0..config.concurrency {
            let worker = Worker {
                worker_id: format!("{}-w{}", config.worker_group, i),
                receiver: Arc::clone(&receiver),
                adapters: Arc::clone(&adapters),
                reporter: Arc::clone(&reporter),
                shutdown: shutdown_token.clone(),
                retry_attempts: config.report_retry_attempts,
                retry_delay: std::time::Duration::from_millis(config.report_retry_delay_ms),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        tracing::info!(
            worker_group = %config.worker_group,
            concurrency = config.concurrency,
            backlog_capacity = config.backlog_capacity,
            "worker pool started"
        );

        Ok(Self {
            config,
            sender,
            shutdown_token,
            worker_handles: Mutex::new(handles),
        })
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Stop taking new jobs, let running jobs finish, and wait for the workers.
    ///
    /// Jobs still in the backlog are dropped; the reconciler reclaims their
    /// tasks once they outlive the stuck timeout.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!(worker_group = %self.config.worker_group, "Initiating worker pool shutdown");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(tokio::time::Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Worker task failed: {:?}", e),
                Err(_) => tracing::warn!("Worker task timed out during shutdown"),
            }
        }

        tracing::info!("Worker pool shutdown complete");
        Ok(())
    }
}

#[async_trait]
impl JobSubmitter for WorkerPool {
    async fn submit(&self, spec: JobSpec) -> anyhow::Result<JobHandle> {
        if self.shutdown_token.is_cancelled() {
            anyhow::bail!("worker pool {} is shut down", self.config.worker_group);
        }

        let handle = JobHandle::generate(&self.config.worker_group);
        let job = QueuedJob {
            spec,
            handle: handle.clone(),
        };

        match self.sender.try_send(job) {
            Ok(()) => Ok(handle),
            Err(mpsc::error::TrySendError::Full(_)) => anyhow::bail!(
                "worker pool backlog full ({} queued)",
                self.config.backlog_capacity
            ),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                anyhow::bail!("worker pool {} is shut down", self.config.worker_group)
            }
        }
    }
}

struct Worker {
    worker_id: String,
    receiver: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    adapters: Arc<HashMap<SourceId, Arc<dyn SourceAdapter>>>,
    reporter: Arc<dyn TaskReporter>,
    shutdown: ShutdownToken,
    retry_attempts: u32,
    retry_delay: std::time::Duration,
}

impl Worker {
    async fn run(self) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                job = async { self.receiver.lock().await.recv().await } => job,
            };

            let Some(job) = next else {
                tracing::info!("Worker {} shutting down", self.worker_id);
                break;
            };

            self.execute(job).await;
        }
    }

    async fn execute(&self, job: QueuedJob) {
        let task_id = job.spec.task_id;
        tracing::debug!(
            worker_id = %self.worker_id,
            task_id = %task_id,
            handle = %job.handle,
            source_id = %job.spec.source_id,
            "job picked up"
        );

        let Some(adapter) = self.adapters.get(&job.spec.source_id) else {
            let message = format!("no adapter registered for source {}", job.spec.source_id);
            self.report(&job, TaskOutcome::Failed, Some(message)).await;
            return;
        };

        if !self.mark_started(&job).await {
            return;
        }

        match adapter.collect(&job.spec).await {
            Ok(()) => self.report(&job, TaskOutcome::Completed, None).await,
            Err(err) => {
                self.report(&job, TaskOutcome::Failed, Some(format!("{err:#}")))
                    .await
            }
        }
    }

    /// Stamp `started_at`, retrying while the dispatch write may still be in flight.
    ///
    /// Returns `false` when the job must not run: its task is already terminal
    /// (reclaimed or failed while queued) or unknown.
    async fn mark_started(&self, job: &QueuedJob) -> bool {
        let task_id = job.spec.task_id;
        let mut attempt = 0;

        loop {
            match self.reporter.started(task_id).await {
                Ok(ReportOutcome::Accepted) => return true,
                Ok(ReportOutcome::Rejected {
                    current: TaskStatus::Pending,
                }) if attempt < self.retry_attempts => {
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Ok(ReportOutcome::Rejected { current }) if current.is_terminal() => {
                    tracing::debug!(
                        worker_id = %self.worker_id,
                        task_id = %task_id,
                        current = %current,
                        "task already terminal, skipping job"
                    );
                    return false;
                }
                Ok(ReportOutcome::Rejected { current }) => {
                    tracing::debug!(task_id = %task_id, current = %current, "start not recorded");
                    return true;
                }
                Err(OrchestratorError::TaskNotFound(_)) => {
                    tracing::warn!(task_id = %task_id, "unknown task, skipping job");
                    return false;
                }
                Err(err) => {
                    tracing::warn!(task_id = %task_id, "start callback failed: {err}");
                    return true;
                }
            }
        }
    }

    /// Deliver a completion report, retrying while the task still reads
    /// `pending` (the dispatcher has not recorded the handle yet).
    async fn report(&self, job: &QueuedJob, outcome: TaskOutcome, message: Option<String>) {
        let task_id = job.spec.task_id;
        let mut attempt = 0;

        loop {
            match self.reporter.report(task_id, outcome, message.clone()).await {
                Ok(ReportOutcome::Rejected {
                    current: TaskStatus::Pending,
                }) if attempt < self.retry_attempts => {
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Ok(ReportOutcome::Accepted) => break,
                Ok(ReportOutcome::Rejected { current }) => {
                    tracing::debug!(
                        worker_id = %self.worker_id,
                        task_id = %task_id,
                        current = %current,
                        "report not applied"
                    );
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        task_id = %task_id,
                        "report callback failed: {err}"
                    );
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunId;
    use crate::task::TaskId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingReporter {
        /// Status `started` reports; `None` accepts.
        start_status: Option<TaskStatus>,
        starts: AtomicUsize,
        reports: StdMutex<Vec<(TaskId, TaskOutcome, Option<String>)>>,
    }

    #[async_trait]
    impl TaskReporter for RecordingReporter {
        async fn started(&self, _task_id: TaskId) -> Result<ReportOutcome, OrchestratorError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(match self.start_status {
                None => ReportOutcome::Accepted,
                Some(current) => ReportOutcome::Rejected { current },
            })
        }

        async fn report(
            &self,
            task_id: TaskId,
            outcome: TaskOutcome,
            error_message: Option<String>,
        ) -> Result<ReportOutcome, OrchestratorError> {
            self.reports
                .lock()
                .unwrap()
                .push((task_id, outcome, error_message));
            Ok(ReportOutcome::Accepted)
        }
    }

    struct Blocking(Arc<tokio::sync::Semaphore>);

    #[async_trait]
    impl SourceAdapter for Blocking {
        async fn collect(&self, _spec: &JobSpec) -> anyhow::Result<()> {
            let _permit = self.0.acquire().await?;
            Ok(())
        }
    }

    fn spec(source: &str) -> JobSpec {
        JobSpec::new(RunId::new(), TaskId::new(), source.into())
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.worker_group, "harvest");
    }

    #[tokio::test]
    async fn test_rejects_zero_concurrency() {
        let result = WorkerPool::start(
            WorkerPoolConfig::default().with_concurrency(0),
            HashMap::new(),
            Arc::new(RecordingReporter::default()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unknown_source_is_reported_failed() {
        let reporter = Arc::new(RecordingReporter::default());
        let pool = WorkerPool::start(
            WorkerPoolConfig::new("t"),
            HashMap::new(),
            Arc::clone(&reporter) as Arc<dyn TaskReporter>,
        )
        .unwrap();

        let job = spec("mastodon");
        let handle = pool.submit(job.clone()).await.unwrap();
        assert!(handle.as_str().starts_with("t-"));

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while reporter.reports.lock().unwrap().is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let reports = reporter.reports.lock().unwrap().clone();
        assert_eq!(reports[0].0, job.task_id);
        assert_eq!(reports[0].1, TaskOutcome::Failed);
        assert_eq!(
            reports[0].2.as_deref(),
            Some("no adapter registered for source mastodon")
        );
        pool.shutdown().await.unwrap();
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl SourceAdapter for Counting {
        async fn collect(&self, _spec: &JobSpec) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_job_for_terminal_task_is_skipped_without_retrying() {
        let reporter = Arc::new(RecordingReporter {
            start_status: Some(TaskStatus::Failed),
            ..RecordingReporter::default()
        });
        let adapter = Arc::new(Counting(AtomicUsize::new(0)));
        let mut adapters: HashMap<SourceId, Arc<dyn SourceAdapter>> = HashMap::new();
        adapters.insert("rss".into(), Arc::clone(&adapter) as Arc<dyn SourceAdapter>);

        let pool = WorkerPool::start(
            WorkerPoolConfig::new("t").with_concurrency(1),
            adapters,
            Arc::clone(&reporter) as Arc<dyn TaskReporter>,
        )
        .unwrap();

        pool.submit(spec("rss")).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_millis(200), async {
            while reporter.starts.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(reporter.starts.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.0.load(Ordering::SeqCst), 0);
        assert!(reporter.reports.lock().unwrap().is_empty());
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_backlog_full_rejects_submission() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let mut adapters: HashMap<SourceId, Arc<dyn SourceAdapter>> = HashMap::new();
        adapters.insert("rss".into(), Arc::new(Blocking(Arc::clone(&gate))));

        let pool = WorkerPool::start(
            WorkerPoolConfig::new("t")
                .with_concurrency(1)
                .with_backlog_capacity(1),
            adapters,
            Arc::new(RecordingReporter::default()),
        )
        .unwrap();

        pool.submit(spec("rss")).await.unwrap();
        // Let the single worker take the first job off the backlog.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        pool.submit(spec("rss")).await.unwrap();

        let err = pool.submit(spec("rss")).await.unwrap_err();
        assert!(err.to_string().contains("backlog full"));

        gate.add_permits(2);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let pool = WorkerPool::start(
            WorkerPoolConfig::default(),
            HashMap::new(),
            Arc::new(RecordingReporter::default()),
        )
        .unwrap();
        pool.shutdown().await.unwrap();

        let err = pool.submit(spec("rss")).await.unwrap_err();
        assert!(err.to_string().contains("shut down"));
    }
}
