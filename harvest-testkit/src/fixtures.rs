use harvest::*;
use std::sync::Arc;

/// `count` distinct source ids: `arena-00`, `arena-01`, ...
pub fn sources(count: usize) -> Vec<SourceId> {
    (0..count)
        .map(|i| SourceId::new(format!("arena-{i:02}")))
        .collect()
}

pub fn named_sources(names: &[&str]) -> Vec<SourceId> {
    names.iter().map(|name| SourceId::new(*name)).collect()
}

/// Design defaults: 15 s reconcile interval, 10 min stuck timeout.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
}

/// Orchestrator over a fresh in-memory registry.
pub fn in_memory_orchestrator(
    config: OrchestratorConfig,
    submitter: Arc<dyn JobSubmitter>,
    probe: Arc<dyn ScopeProbe>,
) -> Orchestrator<InMemoryRegistry> {
    OrchestratorBuilder::new(config)
        .with_registry(Arc::new(InMemoryRegistry::new()))
        .with_submitter(submitter)
        .with_scope_probe(probe)
        .build()
        .expect("test orchestrator should build")
}
