use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::registry::Registry;
use crate::submit::{AlwaysScoped, JobSubmitter, ScopeProbe};

use super::supervisor::Orchestrator;

/// Builder for an [`Orchestrator`] with explicit dependencies.
///
/// The registry and the submitter are required; the scope probe defaults to
/// [`AlwaysScoped`].
///
/// # Example
///
/// ```ignore
/// use harvest::*;
///
/// let orchestrator = OrchestratorBuilder::new(OrchestratorConfig::default())
///     .with_registry(Arc::new(InMemoryRegistry::new()))
///     .with_submitter(pool)
///     .build()?;
/// ```
pub struct OrchestratorBuilder<R: Registry + 'static> {
    config: OrchestratorConfig,
    registry: Option<Arc<R>>,
    submitter: Option<Arc<dyn JobSubmitter>>,
    probe: Option<Arc<dyn ScopeProbe>>,
}

impl<R: Registry + 'static> fmt::Debug for OrchestratorBuilder<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("OrchestratorBuilder");
        debug.field("config", &self.config);
        debug.field("registry_set", &self.registry.is_some());
        debug.field("submitter_set", &self.submitter.is_some());
        debug.field("probe_set", &self.probe.is_some());

        if self.registry.is_some() {
            debug.field("registry_type", &type_name::<R>());
        }

        debug.finish()
    }
}

impl<R: Registry + 'static> OrchestratorBuilder<R> {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            registry: None,
            submitter: None,
            probe: None,
        }
    }

    /// Set the run/task registry.
    pub fn with_registry(mut self, registry: Arc<R>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the job submitter (the worker pool's front door).
    pub fn with_submitter(mut self, submitter: Arc<dyn JobSubmitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    /// Set the "has scoped work?" probe.
    pub fn with_scope_probe(mut self, probe: Arc<dyn ScopeProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Build the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if a required dependency is missing or the config
    /// fails [`OrchestratorConfig::validate`].
    pub fn build(self) -> anyhow::Result<Orchestrator<R>> {
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry dependency missing"))?;
        let submitter = self
            .submitter
            .ok_or_else(|| anyhow::anyhow!("submitter dependency missing"))?;
        let probe = self.probe.unwrap_or_else(|| Arc::new(AlwaysScoped));

        self.config.validate()?;

        Ok(Orchestrator::new(self.config, registry, submitter, probe))
    }
}
