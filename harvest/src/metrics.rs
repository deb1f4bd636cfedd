//! Prometheus metrics for run orchestration.
//!
//! Compiled only with the `metrics` feature.
//!
//! ## Counters
//! - `harvest_tasks_dispatched_total{source_id}` - submissions accepted by the pool
//! - `harvest_task_failures_total{source_id, reason}` - tasks failed by the orchestrator
//! - `harvest_tasks_reclaimed_total` - tasks failed by the stuck timeout
//! - `harvest_runs_finalized_total{status}` - runs reaching a terminal status
//! - `harvest_late_reports_total` - completion reports rejected as late
#![cfg(feature = "metrics")]

use prometheus::{Counter, CounterVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for harvest metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static TASKS_DISPATCHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "harvest_tasks_dispatched_total",
        "Total number of task submissions accepted by the worker pool",
    );
    CounterVec::new(opts, &["source_id"])
        .expect("harvest_tasks_dispatched_total metric creation failed")
});

pub static TASK_FAILURES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "harvest_task_failures_total",
        "Total number of tasks failed by the orchestrator",
    );
    CounterVec::new(opts, &["source_id", "reason"])
        .expect("harvest_task_failures_total metric creation failed")
});

pub static TASKS_RECLAIMED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "harvest_tasks_reclaimed_total",
        "Total number of tasks reclaimed by the stuck timeout",
    )
    .expect("harvest_tasks_reclaimed_total metric creation failed")
});

pub static RUNS_FINALIZED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "harvest_runs_finalized_total",
        "Total number of runs reaching a terminal status",
    );
    CounterVec::new(opts, &["status"])
        .expect("harvest_runs_finalized_total metric creation failed")
});

pub static LATE_REPORTS_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "harvest_late_reports_total",
        "Total number of completion reports rejected because the task was already terminal",
    )
    .expect("harvest_late_reports_total metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(TASKS_DISPATCHED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(TASK_FAILURES_TOTAL.clone()),
        Box::new(TASKS_RECLAIMED_TOTAL.clone()),
        Box::new(RUNS_FINALIZED_TOTAL.clone()),
        Box::new(LATE_REPORTS_TOTAL.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_task_dispatched(source_id: &str) {
    TASKS_DISPATCHED_TOTAL.with_label_values(&[source_id]).inc();
}

pub fn record_task_failure(source_id: &str, reason: &str) {
    TASK_FAILURES_TOTAL
        .with_label_values(&[source_id, reason])
        .inc();
}

pub fn record_tasks_reclaimed(count: u64) {
    TASKS_RECLAIMED_TOTAL.inc_by(count as f64);
}

pub fn record_run_finalized(status: &str) {
    RUNS_FINALIZED_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_late_report() {
    LATE_REPORTS_TOTAL.inc();
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization_is_idempotent() {
        init_metrics().expect("first init");
        init_metrics().expect("second init");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_task_dispatched("reddit");
        record_task_failure("reddit", "stuck_timeout");
        record_run_finalized("completed");

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("harvest_tasks_dispatched_total"));
        assert!(output.contains("harvest_task_failures_total"));
        assert!(output.contains("harvest_runs_finalized_total"));
    }
}
