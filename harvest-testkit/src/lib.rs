//! Test doubles and fixtures for harvest.

mod adapter;
mod fixtures;
mod mock;

pub use adapter::{AdapterScript, ScriptedAdapter};
pub use fixtures::{in_memory_orchestrator, named_sources, sources, test_config};
pub use mock::{ScriptedSubmitter, StaticScopeProbe};
