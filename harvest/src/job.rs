use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

use crate::run::RunId;
use crate::task::TaskId;

/// Identifier of an arena: the data-source adapter a task targets.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque reference returned by the worker pool for an accepted job.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Generate a fresh handle under the given prefix.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}-{}", prefix, Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a worker needs to execute one per-source fetch.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub source_id: SourceId,
}

impl JobSpec {
    pub fn new(run_id: RunId, task_id: TaskId, source_id: SourceId) -> Self {
        Self {
            run_id,
            task_id,
            source_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_id_serializes_as_plain_string() {
        let id = SourceId::from("reddit");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"reddit\"");
    }

    #[test]
    fn test_generated_handles_are_unique_and_prefixed() {
        let a = JobHandle::generate("pool");
        let b = JobHandle::generate("pool");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("pool-"));
    }
}
