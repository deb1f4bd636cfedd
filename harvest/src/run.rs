use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use uuid::Uuid;

use crate::job::SourceId;
use crate::task::{Task, TaskStatus};

/// Unique identifier of a collection run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a run: `pending -> running -> {completed, failed}`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(anyhow::anyhow!("invalid run status: {}", other)),
        }
    }
}

/// Caller-supplied launch request.
///
/// The `key` makes `launch` idempotent: launching twice with the same key
/// yields the same run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub key: String,
}

impl RunRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// A request that never collides with an earlier one.
    pub fn unique() -> Self {
        Self {
            key: Uuid::now_v7().to_string(),
        }
    }
}

/// Persisted lifecycle record of a run.
///
/// `completed_at` is set exactly when `status` is terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub request_key: String,
    pub status: RunStatus,
    pub source_ids: Vec<SourceId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// A fresh `pending` run. Duplicate sources are dropped, first occurrence wins.
    pub fn new(request: &RunRequest, source_ids: Vec<SourceId>) -> Self {
        let mut ordered: Vec<SourceId> = Vec::with_capacity(source_ids.len());
        for source in source_ids {
            if !ordered.contains(&source) {
                ordered.push(source);
            }
        }

        Self {
            id: RunId::new(),
            request_key: request.key.clone(),
            status: RunStatus::Pending,
            source_ids: ordered,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Read-only view of a run and its tasks for polling consumers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tasks: Vec<Task>,
}

impl RunSnapshot {
    pub fn new(run: Run, tasks: Vec<Task>) -> Self {
        Self {
            run_id: run.id,
            status: run.status,
            created_at: run.created_at,
            started_at: run.started_at,
            completed_at: run.completed_at,
            tasks,
        }
    }

    /// Number of tasks currently in `status`.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn task_for(&self, source_id: &SourceId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.source_id == source_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_is_pending_and_dedupes_sources() {
        let request = RunRequest::new("req-1");
        let run = Run::new(
            &request,
            vec!["a".into(), "b".into(), "a".into(), "c".into()],
        );

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.request_key, "req-1");
        assert_eq!(
            run.source_ids,
            vec![SourceId::from("a"), SourceId::from("b"), SourceId::from("c")]
        );
        assert!(run.started_at.is_none());
        assert!(run.completed_at.is_none());
    }

    #[test]
    fn test_run_status_parse() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }
}
