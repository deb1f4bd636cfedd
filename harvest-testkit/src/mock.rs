use async_trait::async_trait;
use harvest::*;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Job submitter that records every submission and rejects scripted sources.
#[derive(Clone)]
pub struct ScriptedSubmitter {
    submissions: Arc<Mutex<Vec<JobSpec>>>,
    rejections: Arc<Mutex<HashMap<SourceId, String>>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl ScriptedSubmitter {
    pub fn new() -> Self {
        Self {
            submissions: Arc::new(Mutex::new(Vec::new())),
            rejections: Arc::new(Mutex::new(HashMap::new())),
            delay: Arc::new(Mutex::new(None)),
        }
    }

    /// Submissions for `source` fail synchronously with `message`.
    pub fn reject_source(&self, source: impl Into<SourceId>, message: impl Into<String>) {
        self.rejections.lock().insert(source.into(), message.into());
    }

    pub fn allow_source(&self, source: &SourceId) {
        self.rejections.lock().remove(source);
    }

    /// Every submission sleeps for `delay` before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Accepted submissions, in order.
    pub fn submissions(&self) -> Vec<JobSpec> {
        self.submissions.lock().clone()
    }

    pub fn assert_submission_count_eq(&self, expected: usize) {
        let actual = self.submissions.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} submissions, got {}",
            expected, actual
        );
    }

    pub fn clear(&self) {
        self.submissions.lock().clear();
    }
}

impl Default for ScriptedSubmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobSubmitter for ScriptedSubmitter {
    async fn submit(&self, spec: JobSpec) -> anyhow::Result<JobHandle> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let rejection = self.rejections.lock().get(&spec.source_id).cloned();
        if let Some(message) = rejection {
            anyhow::bail!(message);
        }

        self.submissions.lock().push(spec);
        Ok(JobHandle::generate("scripted"))
    }
}

/// Scope probe with a fixed answer per source.
///
/// Sources not mentioned have work.
#[derive(Clone, Default)]
pub struct StaticScopeProbe {
    empty: Arc<Mutex<HashSet<SourceId>>>,
    broken: Arc<Mutex<HashSet<SourceId>>>,
}

impl StaticScopeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report no scoped work for each of `sources`.
    pub fn without_work<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SourceId>,
    {
        let probe = Self::new();
        probe
            .empty
            .lock()
            .extend(sources.into_iter().map(Into::into));
        probe
    }

    /// Probing `source` returns an error.
    pub fn break_source(&self, source: impl Into<SourceId>) {
        self.broken.lock().insert(source.into());
    }
}

#[async_trait]
impl ScopeProbe for StaticScopeProbe {
    async fn has_scoped_work(&self, _run_id: RunId, source_id: &SourceId) -> anyhow::Result<bool> {
        if self.broken.lock().contains(source_id) {
            anyhow::bail!("scope lookup failed for {}", source_id);
        }
        Ok(!self.empty.lock().contains(source_id))
    }
}
