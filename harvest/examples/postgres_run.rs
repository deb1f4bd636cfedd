//! Collection run persisted in PostgreSQL.
//!
//! # Prerequisites
//!
//! 1. PostgreSQL server running locally or accessible via network
//! 2. Database created: `createdb harvest_example`
//!
//! The schema is applied on startup via `PostgresRegistry::ensure_schema`.
//!
//! # Running the Example
//!
//! ```bash
//! export DATABASE_URL="postgres://localhost/harvest_example"
//! cargo run --example postgres_run --features postgres
//! ```
//!
//! Running it twice with the same `HARVEST_REQUEST_KEY` returns the same run
//! instead of launching a second one.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harvest::*;

struct EchoAdapter;

#[async_trait]
impl SourceAdapter for EchoAdapter {
    async fn collect(&self, spec: &JobSpec) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        tracing::info!(source_id = %spec.source_id, run_id = %spec.run_id, "collected");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let database_url = env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/harvest_example".to_string());
    let request_key =
        env::var("HARVEST_REQUEST_KEY").unwrap_or_else(|_| "postgres-example".to_string());

    let registry = Arc::new(PostgresRegistry::connect(&PersistenceConfig::new(database_url)).await?);
    registry.ensure_schema().await?;

    let sources: Vec<SourceId> = vec!["rss".into(), "youtube".into(), "telegram".into()];
    let mut adapters: HashMap<SourceId, Arc<dyn SourceAdapter>> = HashMap::new();
    for source in &sources {
        adapters.insert(source.clone(), Arc::new(EchoAdapter));
    }

    let pool = Arc::new(WorkerPool::start(
        WorkerPoolConfig::new("pg-example"),
        adapters,
        Arc::new(RegistryReporter::new(Arc::clone(&registry))),
    )?);

    let orchestrator = OrchestratorBuilder::new(
        OrchestratorConfig::default().with_reconcile_interval_ms(1_000),
    )
    .with_registry(registry)
    .with_submitter(Arc::clone(&pool) as Arc<dyn JobSubmitter>)
    .build()?;
    orchestrator.start().await?;

    let run_id = orchestrator
        .launch(RunRequest::new(request_key), sources)
        .await?;
    println!("run {run_id}");

    let snapshot = loop {
        let snapshot = orchestrator.get_run_status(run_id).await?;
        if snapshot.status.is_terminal() {
            break snapshot;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    println!(
        "run finished as {} ({} completed, {} failed)",
        snapshot.status,
        snapshot.count(TaskStatus::Completed),
        snapshot.count(TaskStatus::Failed)
    );

    orchestrator.shutdown().await?;
    pool.shutdown().await?;
    Ok(())
}
