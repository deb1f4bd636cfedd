use async_trait::async_trait;
use harvest::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// What a [`ScriptedAdapter`] does with each job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdapterScript {
    /// Finish successfully.
    Succeed,
    /// Finish with this error.
    Fail(String),
    /// Never finish. Models a job lost inside the pool.
    Hang,
}

/// Source adapter with scripted behavior and a call log.
#[derive(Clone)]
pub struct ScriptedAdapter {
    script: Arc<Mutex<AdapterScript>>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<JobSpec>>>,
}

impl ScriptedAdapter {
    pub fn new(script: AdapterScript) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(AdapterScript::Succeed)
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(AdapterScript::Fail(message.into()))
    }

    pub fn hanging() -> Self {
        Self::new(AdapterScript::Hang)
    }

    /// Sleep for `delay` before acting on the script.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_script(&self, script: AdapterScript) {
        *self.script.lock() = script;
    }

    pub fn calls(&self) -> Vec<JobSpec> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    async fn collect(&self, spec: &JobSpec) -> anyhow::Result<()> {
        self.calls.lock().push(spec.clone());
        tracing::debug!(source_id = %spec.source_id, task_id = %spec.task_id, "scripted collect");

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let script = self.script.lock().clone();
        match script {
            AdapterScript::Succeed => Ok(()),
            AdapterScript::Fail(message) => Err(anyhow::anyhow!(message)),
            AdapterScript::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}
