//! Benchmarks for the orchestration hot paths using criterion.
//!
//! - Launch: task creation plus dispatch for runs of increasing width
//! - Reconcile: one cycle over many running runs, idle and with reclamation
//! - Report: completion callback through the registry

#![allow(missing_docs)]

use std::sync::Arc;

use chrono::{Duration, Utc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use harvest::*;
use harvest_testkit::{in_memory_orchestrator, sources, test_config, ScriptedSubmitter, StaticScopeProbe};
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn orchestrator() -> Orchestrator<InMemoryRegistry> {
    in_memory_orchestrator(
        test_config(),
        Arc::new(ScriptedSubmitter::new()),
        Arc::new(StaticScopeProbe::new()),
    )
}

/// Benchmark: launch a run of N sources.
fn bench_launch(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("launch");

    for width in [1usize, 12, 100] {
        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            let orchestrator = orchestrator();
            let run_sources = sources(width);
            b.iter(|| {
                rt.block_on(async {
                    orchestrator
                        .launch(RunRequest::unique(), run_sources.clone())
                        .await
                        .expect("launch")
                })
            });
        });
    }

    group.finish();
}

/// Benchmark: one reconcile cycle over many running runs.
///
/// `idle` evaluates before the stuck timeout; `reclaim` evaluates after it,
/// so every task is failed and every run finalized.
fn bench_reconcile(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("reconcile");
    group.sample_size(20);

    for runs in [10usize, 100] {
        group.throughput(Throughput::Elements(runs as u64));

        group.bench_with_input(BenchmarkId::new("idle", runs), &runs, |b, &runs| {
            let orchestrator = orchestrator();
            rt.block_on(async {
                for _ in 0..runs {
                    orchestrator
                        .launch(RunRequest::unique(), sources(10))
                        .await
                        .expect("launch");
                }
            });
            let now = Utc::now();
            b.iter(|| rt.block_on(orchestrator.reconcile_at(now)).expect("reconcile"));
        });

        group.bench_with_input(BenchmarkId::new("reclaim", runs), &runs, |b, &runs| {
            b.iter_batched(
                || {
                    let orchestrator = orchestrator();
                    rt.block_on(async {
                        for _ in 0..runs {
                            orchestrator
                                .launch(RunRequest::unique(), sources(10))
                                .await
                                .expect("launch");
                        }
                    });
                    orchestrator
                },
                |orchestrator| {
                    let later = Utc::now() + Duration::minutes(11);
                    let report = rt
                        .block_on(orchestrator.reconcile_at(later))
                        .expect("reconcile");
                    assert_eq!(report.runs_finalized, runs);
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Benchmark: completion report for a dispatched task.
fn bench_report(c: &mut Criterion) {
    let rt = create_runtime();
    let mut group = c.benchmark_group("report");

    group.bench_function("accepted", |b| {
        b.iter_batched(
            || {
                let orchestrator = orchestrator();
                let task_id = rt.block_on(async {
                    let run_id = orchestrator
                        .launch(RunRequest::unique(), sources(1))
                        .await
                        .expect("launch");
                    orchestrator
                        .get_run_status(run_id)
                        .await
                        .expect("snapshot")
                        .tasks[0]
                        .id
                });
                (orchestrator, task_id)
            },
            |(orchestrator, task_id)| {
                rt.block_on(orchestrator.report(task_id, TaskOutcome::Completed, None))
                    .expect("report")
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_launch, bench_reconcile, bench_report);
criterion_main!(benches);
