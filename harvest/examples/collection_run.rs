//! Collection run with the in-memory registry and in-process worker pool.
//!
//! Launches one run over four arenas: two succeed, one fails, and one has
//! no adapter at all. The reconcile loop runs every second and finalizes the
//! run once every task has reported.
//!
//! Run with: `RUST_LOG=harvest=debug cargo run --example collection_run`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harvest::*;

/// Adapter that pretends to page through an arena.
struct DemoAdapter {
    pages: u32,
    fail_with: Option<&'static str>,
}

#[async_trait]
impl SourceAdapter for DemoAdapter {
    async fn collect(&self, spec: &JobSpec) -> anyhow::Result<()> {
        for page in 1..=self.pages {
            tokio::time::sleep(Duration::from_millis(150)).await;
            tracing::info!(source_id = %spec.source_id, page, "fetched page");
        }
        match self.fail_with {
            Some(reason) => Err(anyhow::anyhow!(reason)),
            None => Ok(()),
        }
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

    let registry = Arc::new(InMemoryRegistry::new());

    let mut adapters: HashMap<SourceId, Arc<dyn SourceAdapter>> = HashMap::new();
    adapters.insert(
        "rss".into(),
        Arc::new(DemoAdapter {
            pages: 3,
            fail_with: None,
        }),
    );
    adapters.insert(
        "youtube".into(),
        Arc::new(DemoAdapter {
            pages: 2,
            fail_with: None,
        }),
    );
    adapters.insert(
        "reddit".into(),
        Arc::new(DemoAdapter {
            pages: 1,
            fail_with: Some("api quota exhausted"),
        }),
    );

    let pool = Arc::new(WorkerPool::start(
        WorkerPoolConfig::new("demo").with_concurrency(2),
        adapters,
        Arc::new(RegistryReporter::new(Arc::clone(&registry))),
    )?);

    let orchestrator = OrchestratorBuilder::new(
        OrchestratorConfig::default()
            .with_reconcile_interval_ms(1_000)
            .with_stuck_timeout_secs(30),
    )
    .with_registry(Arc::clone(&registry))
    .with_submitter(Arc::clone(&pool) as Arc<dyn JobSubmitter>)
    .build()?;
    orchestrator.start().await?;

    let run_id = orchestrator
        .launch(
            RunRequest::new("demo-collection"),
            vec!["rss".into(), "youtube".into(), "reddit".into(), "gab".into()],
        )
        .await?;
    println!("launched run {run_id}");

    let snapshot = loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let snapshot = orchestrator.get_run_status(run_id).await?;
        if snapshot.status.is_terminal() {
            break snapshot;
        }
        println!(
            "run {}: {} dispatched, {} completed, {} failed",
            snapshot.status,
            snapshot.count(TaskStatus::Dispatched),
            snapshot.count(TaskStatus::Completed),
            snapshot.count(TaskStatus::Failed),
        );
    };

    println!("run finished as {}", snapshot.status);
    for task in &snapshot.tasks {
        println!(
            "  {:<8} {:<10} {}",
            task.source_id,
            task.status,
            task.error_message.as_deref().unwrap_or("-")
        );
    }
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    orchestrator.shutdown().await?;
    pool.shutdown().await?;
    Ok(())
}
