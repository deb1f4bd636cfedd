/// In-process registry, always available.
///
/// `InMemoryRegistry` keeps runs and tasks in hash maps behind one async
/// mutex. Suitable for tests, demos, and single-process deployments.
pub mod memory;

#[cfg(feature = "postgres")]
/// PostgreSQL registry.
///
/// `PostgresRegistry` stores runs and tasks in `harvest_runs` and
/// `harvest_tasks`, expressing every status change as a conditional
/// `UPDATE ... WHERE status = ...`.
pub mod postgres;

pub use memory::InMemoryRegistry;
#[cfg(feature = "postgres")]
pub use postgres::PostgresRegistry;
