//! Harvest - collection-run orchestration.
//!
//! A run fans out into one task per data source ("arena"). Each task becomes
//! a fire-and-forget job on a bounded worker pool, and the run's own terminal
//! status is derived from its tasks once they all finish.
//!
//! # Core Concepts
//!
//! - **Run**: one collection request spanning several sources. Moves
//!   `pending -> running -> {completed, failed}` and never back.
//!
//! - **Task**: the per-source unit of work. Moves
//!   `pending -> dispatched -> {completed, failed}`, or straight to `failed`
//!   when there is nothing to do, the pool rejects it, or it goes silent.
//!
//! - **Registry**: the [`RunRegistry`], [`TaskRegistry`] and
//!   [`StuckTaskScanner`] traits abstract storage. Every status write is a
//!   compare-and-set on the expected prior status, so the dispatcher, the
//!   job callback and the reconciler never need a lock between them.
//!
//! - **Dispatcher**: [`Dispatcher`] creates the task records of a run and
//!   submits one job per task through a [`JobSubmitter`].
//!
//! - **Reconciler**: [`Reconciler`] runs on a fixed interval, fails tasks
//!   that outlived the stuck timeout, and finalizes runs per the
//!   [`CompletionPolicy`]. It is the only liveness guarantee: a run reaches a
//!   terminal status within `stuck_timeout + reconcile_interval` even if no
//!   job ever reports back.
//!
//! - **Runtime**: [`Orchestrator`] ties the pieces together behind `launch`,
//!   `get_run_status` and `report`; [`WorkerPool`] is an in-process pool that
//!   runs [`SourceAdapter`]s.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL registry via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use harvest::*;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(InMemoryRegistry::new());
//! let pool = Arc::new(WorkerPool::start(
//!     WorkerPoolConfig::default(),
//!     adapters,
//!     Arc::new(RegistryReporter::new(Arc::clone(&registry))),
//! )?);
//!
//! let orchestrator = OrchestratorBuilder::new(OrchestratorConfig::default())
//!     .with_registry(registry)
//!     .with_submitter(pool)
//!     .build()?;
//! orchestrator.start().await?;
//!
//! let run_id = orchestrator
//!     .launch(RunRequest::unique(), vec!["rss".into(), "reddit".into()])
//!     .await?;
//! let snapshot = orchestrator.get_run_status(run_id).await?;
//! ```

/// Configuration for orchestration timing and persistence.
///
/// [`OrchestratorConfig`] carries the reconcile interval, stuck timeout,
/// submission timeout and completion policy; [`PersistenceConfig`] the
/// Postgres pool settings.
pub mod config;

/// Task creation and job submission.
pub mod dispatcher;

/// Error types.
///
/// [`TaskFailure`] is why a task ended up `failed`; [`OrchestratorError`] is
/// what callers of the public API see.
pub mod error;

/// Source identifiers, job handles and the job spec handed to the pool.
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus metrics for dispatch, reclamation and finalization.
pub mod metrics;

/// Registry implementations.
///
/// [`InMemoryRegistry`] is always available; [`PostgresRegistry`] requires
/// the `postgres` feature.
pub mod persistence;

/// Stuck-task reclamation and run finalization.
pub mod reconciler;

/// Storage traits for runs and tasks.
pub mod registry;

/// Job callbacks: start stamps and completion reports.
pub mod reporter;

/// Run records, launch requests and read-only snapshots.
pub mod run;

/// Orchestrator façade, builder, shutdown token and in-process worker pool.
pub mod runtime;

/// Job submission interface and scope probe.
pub mod submit;

/// Task records, statuses and transitions.
pub mod task;

/// Tracing spans and lifecycle event recording.
pub mod telemetry;

pub use config::*;
pub use dispatcher::*;
pub use error::*;
pub use job::*;
pub use persistence::*;
pub use reconciler::*;
pub use registry::*;
pub use reporter::*;
pub use run::*;
pub use runtime::*;
pub use submit::*;
pub use task::*;
