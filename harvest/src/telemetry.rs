//! Tracing and telemetry instrumentation for harvest.
//!
//! Helpers for creating spans around the orchestration operations and for
//! recording lifecycle transitions. Every `record_*` helper emits a structured
//! `tracing` event and, with the `metrics` feature, bumps the matching
//! Prometheus metric.
//!
//! # Example
//!
//! ```ignore
//! use harvest::telemetry::{dispatch_span, record_task_dispatched};
//! use tracing::Instrument;
//!
//! async {
//!     // submit ...
//!     record_task_dispatched("reddit");
//! }
//! .instrument(dispatch_span(run_id, task_id, "reddit"))
//! .await;
//! ```

use std::fmt::Display;

use tracing::{info_span, Span};

/// Span for a run launch.
#[must_use]
pub fn launch_span(request_key: impl AsRef<str>, sources: usize) -> Span {
    info_span!(
        "harvest.launch",
        request_key = %request_key.as_ref(),
        sources = sources,
    )
}

/// Span for one task's submission to the worker pool.
#[must_use]
pub fn dispatch_span(
    run_id: impl Display,
    task_id: impl Display,
    source_id: impl AsRef<str>,
) -> Span {
    info_span!(
        "harvest.dispatch",
        run_id = %run_id,
        task_id = %task_id,
        source_id = %source_id.as_ref(),
    )
}

/// Span for reconciling one run.
#[must_use]
pub fn reconcile_span(run_id: impl Display) -> Span {
    info_span!("harvest.reconcile", run_id = %run_id)
}

/// Span for a job-completion report.
#[must_use]
pub fn report_span(task_id: impl Display, outcome: impl AsRef<str>) -> Span {
    info_span!(
        "harvest.report",
        task_id = %task_id,
        outcome = %outcome.as_ref(),
    )
}

/// Record an accepted submission.
pub fn record_task_dispatched(source_id: impl AsRef<str>) {
    tracing::info!(source_id = %source_id.as_ref(), "task dispatched");

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_dispatched(source_id.as_ref());
}

/// Record a task finalized as failed by the orchestrator.
///
/// `reason` is a stable label such as `submission_failure`.
pub fn record_task_failed(source_id: impl AsRef<str>, reason: impl AsRef<str>) {
    tracing::warn!(
        source_id = %source_id.as_ref(),
        reason = %reason.as_ref(),
        "task failed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_failure(source_id.as_ref(), reason.as_ref());
}

/// Record tasks reclaimed by the stuck timeout.
pub fn record_tasks_reclaimed(run_id: impl Display, count: usize) {
    if count == 0 {
        return;
    }
    tracing::warn!(run_id = %run_id, count = count, "reclaimed stuck tasks");

    #[cfg(feature = "metrics")]
    crate::metrics::record_tasks_reclaimed(count as u64);
}

/// Record a run reaching its terminal status.
pub fn record_run_finalized(run_id: impl Display, status: impl AsRef<str>) {
    tracing::info!(run_id = %run_id, status = %status.as_ref(), "run finalized");

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_finalized(status.as_ref());
}

/// Record a completion report that arrived after the task was already terminal.
pub fn record_late_report(task_id: impl Display, current: impl AsRef<str>) {
    tracing::warn!(
        task_id = %task_id,
        current = %current.as_ref(),
        "late report rejected"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_late_report();
}
