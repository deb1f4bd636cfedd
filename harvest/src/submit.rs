use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::job::{JobHandle, JobSpec, SourceId};
use crate::run::RunId;

/// Hands jobs to the worker pool.
///
/// `Ok` only means the job is queued at the pool; it says nothing about when
/// (or whether) it starts. An `Err` is a synchronous rejection.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Submit a job, returning the pool's handle for it.
    async fn submit(&self, spec: JobSpec) -> anyhow::Result<JobHandle>;
}

#[async_trait]
impl<T: JobSubmitter + ?Sized> JobSubmitter for Arc<T> {
    async fn submit(&self, spec: JobSpec) -> anyhow::Result<JobHandle> {
        (**self).submit(spec).await
    }
}

/// Answers whether a source has anything to fetch for a run.
///
/// Consulted before task creation so that sources with nothing to do are
/// finalized immediately instead of occupying a worker slot.
#[async_trait]
pub trait ScopeProbe: Send + Sync {
    async fn has_scoped_work(&self, run_id: RunId, source_id: &SourceId) -> anyhow::Result<bool>;
}

/// Probe that reports work for every source.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysScoped;

#[async_trait]
impl ScopeProbe for AlwaysScoped {
    async fn has_scoped_work(&self, _run_id: RunId, _source_id: &SourceId) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Bounds every submission with a timeout.
///
/// An elapsed timeout is reported as a submission error, so callers never wait
/// on the pool for longer than `timeout`.
#[derive(Debug)]
pub struct TimedSubmitter<S> {
    inner: S,
    timeout: Duration,
}

impl<S: JobSubmitter> TimedSubmitter<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: JobSubmitter> JobSubmitter for TimedSubmitter<S> {
    async fn submit(&self, spec: JobSpec) -> anyhow::Result<JobHandle> {
        let source_id = spec.source_id.clone();
        match tokio::time::timeout(self.timeout, self.inner.submit(spec)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "submission for source {} timed out after {}ms",
                source_id,
                self.timeout.as_millis()
            )),
        }
    }
}
