//! End-to-end tests: orchestrator, in-process worker pool and scripted adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use harvest::*;
use harvest_testkit::{named_sources, test_config, ScriptedAdapter};
use tokio::time::timeout;

struct Harness {
    orchestrator: Orchestrator<InMemoryRegistry>,
    pool: Arc<WorkerPool>,
}

fn harness(adapters: Vec<(&str, ScriptedAdapter)>, pool_config: WorkerPoolConfig) -> Harness {
    let registry = Arc::new(InMemoryRegistry::new());
    let reporter: Arc<dyn TaskReporter> = Arc::new(RegistryReporter::new(Arc::clone(&registry)));

    let adapters: HashMap<SourceId, Arc<dyn SourceAdapter>> = adapters
        .into_iter()
        .map(|(source, adapter)| (SourceId::new(source), Arc::new(adapter) as Arc<dyn SourceAdapter>))
        .collect();
    let pool = Arc::new(WorkerPool::start(pool_config, adapters, reporter).unwrap());

    let orchestrator = OrchestratorBuilder::new(test_config())
        .with_registry(registry)
        .with_submitter(Arc::clone(&pool) as Arc<dyn JobSubmitter>)
        .build()
        .unwrap();

    Harness { orchestrator, pool }
}

/// Poll until exactly `open` tasks of the run are non-terminal.
async fn wait_for_reports(
    orchestrator: &Orchestrator<InMemoryRegistry>,
    run_id: RunId,
    open: usize,
) -> RunSnapshot {
    timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = orchestrator.get_run_status(run_id).await.unwrap();
            let non_terminal = snapshot.tasks.iter().filter(|t| !t.is_terminal()).count();
            if non_terminal == open {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tasks should report within 5s")
}

#[tokio::test]
async fn pool_jobs_drive_run_to_completion() {
    let rss = ScriptedAdapter::succeeding();
    let reddit = ScriptedAdapter::failing("rate limited");
    let h = harness(
        vec![("rss", rss.clone()), ("reddit", reddit.clone())],
        WorkerPoolConfig::default(),
    );

    let run_id = h
        .orchestrator
        .launch(RunRequest::unique(), named_sources(&["rss", "reddit", "gab"]))
        .await
        .unwrap();

    let snapshot = wait_for_reports(&h.orchestrator, run_id, 0).await;
    assert_eq!(rss.call_count(), 1);
    assert_eq!(reddit.call_count(), 1);

    let rss_task = snapshot.task_for(&SourceId::new("rss")).unwrap();
    assert_eq!(rss_task.status, TaskStatus::Completed);
    assert!(rss_task.started_at.is_some());
    assert!(rss_task.job_handle.as_ref().unwrap().as_str().starts_with("harvest-"));

    let reddit_task = snapshot.task_for(&SourceId::new("reddit")).unwrap();
    assert_eq!(reddit_task.status, TaskStatus::Failed);
    assert_eq!(reddit_task.error_message.as_deref(), Some("rate limited"));

    let gab_task = snapshot.task_for(&SourceId::new("gab")).unwrap();
    assert_eq!(
        gab_task.error_message.as_deref(),
        Some("no adapter registered for source gab")
    );

    let cycle = h.orchestrator.reconcile_once().await.unwrap();
    assert_eq!(cycle.runs_finalized, 1);
    assert_eq!(
        h.orchestrator.get_run_status(run_id).await.unwrap().status,
        RunStatus::Completed
    );

    h.pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn lost_job_is_reclaimed_by_timeout() {
    let h = harness(
        vec![
            ("rss", ScriptedAdapter::succeeding()),
            ("telegram", ScriptedAdapter::hanging()),
        ],
        WorkerPoolConfig::default(),
    );

    let run_id = h
        .orchestrator
        .launch(RunRequest::unique(), named_sources(&["rss", "telegram"]))
        .await
        .unwrap();
    wait_for_reports(&h.orchestrator, run_id, 1).await;

    let cycle = h.orchestrator.reconcile_once().await.unwrap();
    assert_eq!(cycle.runs_finalized, 0);

    let later = chrono::Utc::now() + chrono::Duration::minutes(10) + chrono::Duration::seconds(1);
    let cycle = h.orchestrator.reconcile_at(later).await.unwrap();
    assert_eq!(cycle.tasks_reclaimed, 1);
    assert_eq!(cycle.runs_finalized, 1);

    let snapshot = h.orchestrator.get_run_status(run_id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Completed);
    let telegram = snapshot.task_for(&SourceId::new("telegram")).unwrap();
    assert_eq!(telegram.status, TaskStatus::Failed);
    assert!(telegram.job_handle.is_some());
}

#[tokio::test]
async fn backlog_overflow_fails_dispatch_synchronously() {
    let slow = ScriptedAdapter::succeeding().with_delay(Duration::from_millis(200));
    let h = harness(
        vec![("a", slow.clone()), ("b", slow.clone()), ("c", slow.clone())],
        WorkerPoolConfig::new("tiny")
            .with_concurrency(1)
            .with_backlog_capacity(1),
    );

    let run_id = h
        .orchestrator
        .launch(RunRequest::unique(), named_sources(&["a", "b", "c"]))
        .await
        .unwrap();

    let snapshot = h.orchestrator.get_run_status(run_id).await.unwrap();
    let rejected: Vec<_> = snapshot
        .tasks
        .iter()
        .filter(|t| {
            t.error_message
                .as_deref()
                .is_some_and(|m| m.starts_with("dispatch failed: worker pool backlog full"))
        })
        .collect();
    assert!(!rejected.is_empty());

    let snapshot = wait_for_reports(&h.orchestrator, run_id, 0).await;
    assert!(snapshot.count(TaskStatus::Completed) >= 1);

    h.orchestrator.reconcile_once().await.unwrap();
    assert_eq!(
        h.orchestrator.get_run_status(run_id).await.unwrap().status,
        RunStatus::Completed
    );
    h.pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrency_is_bounded_by_pool_size() {
    let adapter = ScriptedAdapter::succeeding().with_delay(Duration::from_millis(50));
    let sources: Vec<(String, ScriptedAdapter)> = (0..8)
        .map(|i| (format!("s{i}"), adapter.clone()))
        .collect();
    let h = harness(
        sources.iter().map(|(s, a)| (s.as_str(), a.clone())).collect(),
        WorkerPoolConfig::new("bounded").with_concurrency(2),
    );

    let run_id = h
        .orchestrator
        .launch(
            RunRequest::unique(),
            sources.iter().map(|(s, _)| SourceId::new(s.clone())).collect(),
        )
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let snapshot = wait_for_reports(&h.orchestrator, run_id, 0).await;
    assert_eq!(snapshot.count(TaskStatus::Completed), 8);
    // Eight 50 ms jobs on two workers take at least four rounds.
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(adapter.call_count(), 8);

    h.pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn queued_job_for_reclaimed_task_never_runs() {
    let slow = ScriptedAdapter::succeeding().with_delay(Duration::from_millis(200));
    let queued = ScriptedAdapter::succeeding();
    let h = harness(
        vec![("rss", slow.clone()), ("youtube", queued.clone())],
        WorkerPoolConfig::new("single").with_concurrency(1),
    );

    let run_id = h
        .orchestrator
        .launch(RunRequest::unique(), named_sources(&["rss", "youtube"]))
        .await
        .unwrap();

    let later = chrono::Utc::now() + chrono::Duration::minutes(11);
    let cycle = h.orchestrator.reconcile_at(later).await.unwrap();
    assert_eq!(cycle.tasks_reclaimed, 2);
    assert_eq!(cycle.runs_finalized, 1);

    // Whether or not rss started first, youtube is reached well within this.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(slow.call_count() <= 1);
    assert_eq!(queued.call_count(), 0);

    let snapshot = h.orchestrator.get_run_status(run_id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::Failed);
    let youtube = snapshot.task_for(&SourceId::new("youtube")).unwrap();
    assert!(youtube.started_at.is_none());
    h.pool.shutdown().await.unwrap();
}
