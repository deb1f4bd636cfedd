/// Builder for assembling an orchestrator from its dependencies.
pub mod builder;
/// Orchestrator façade, reconcile loop, and shutdown signalling.
pub mod supervisor;
/// In-process worker pool implementing the job submission interface.
pub mod worker;

pub use builder::OrchestratorBuilder;
pub use supervisor::{Orchestrator, ShutdownToken};
pub use worker::{SourceAdapter, WorkerPool, WorkerPoolConfig};
