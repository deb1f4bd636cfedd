use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::config::PersistenceConfig;
use crate::job::{JobHandle, SourceId};
use crate::registry::{RunInsert, RunRegistry, StuckTaskScanner, TaskRegistry};
use crate::run::{Run, RunId, RunStatus};
use crate::task::{Task, TaskId, TaskStatus, TaskTransition};

/// Tables and indexes used by [`PostgresRegistry`]. Safe to apply repeatedly.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS harvest_runs (
    id            UUID PRIMARY KEY,
    request_key   TEXT NOT NULL UNIQUE,
    status        TEXT NOT NULL
                  CHECK (status IN ('pending', 'running', 'completed', 'failed')),
    source_ids    JSONB NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL,
    started_at    TIMESTAMPTZ,
    completed_at  TIMESTAMPTZ,
    CHECK ((completed_at IS NOT NULL) = (status IN ('completed', 'failed')))
);

CREATE INDEX IF NOT EXISTS harvest_runs_status_idx ON harvest_runs (status);

CREATE TABLE IF NOT EXISTS harvest_tasks (
    id             UUID PRIMARY KEY,
    run_id         UUID NOT NULL REFERENCES harvest_runs (id),
    position       INTEGER NOT NULL,
    source_id      TEXT NOT NULL,
    status         TEXT NOT NULL
                   CHECK (status IN ('pending', 'dispatched', 'failed', 'completed')),
    job_handle     TEXT,
    created_at     TIMESTAMPTZ NOT NULL,
    started_at     TIMESTAMPTZ,
    completed_at   TIMESTAMPTZ,
    error_message  TEXT,
    UNIQUE (run_id, source_id),
    CHECK (status <> 'pending' OR job_handle IS NULL),
    CHECK (status NOT IN ('failed', 'completed') OR completed_at IS NOT NULL)
);

CREATE INDEX IF NOT EXISTS harvest_tasks_open_idx
    ON harvest_tasks (run_id, created_at)
    WHERE status IN ('pending', 'dispatched');
"#;

/// PostgreSQL-backed run and task registry.
///
/// Every status change is a single `UPDATE ... WHERE status = ...`; the row
/// count tells the caller whether its write won.
#[derive(Clone, Debug)]
pub struct PostgresRegistry {
    pool: PgPool,
}

impl PostgresRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool using `config`.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply [`SCHEMA`].
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_run(row: &PgRow) -> anyhow::Result<Run> {
        let status: String = row.try_get("status")?;
        let source_ids: serde_json::Value = row.try_get("source_ids")?;
        Ok(Run {
            id: RunId(row.try_get("id")?),
            request_key: row.try_get("request_key")?,
            status: RunStatus::from_str(&status)?,
            source_ids: serde_json::from_value(source_ids)?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn row_to_task(row: &PgRow) -> anyhow::Result<Task> {
        let status: String = row.try_get("status")?;
        let source_id: String = row.try_get("source_id")?;
        let job_handle: Option<String> = row.try_get("job_handle")?;
        Ok(Task {
            id: TaskId(row.try_get("id")?),
            run_id: RunId(row.try_get("run_id")?),
            source_id: SourceId::new(source_id),
            status: TaskStatus::from_str(&status)?,
            job_handle: job_handle.map(JobHandle::new),
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
        })
    }

    async fn run_by_key(&self, request_key: &str) -> anyhow::Result<Option<Run>> {
        let row = sqlx::query(
            r#"
            SELECT id, request_key, status, source_ids, created_at, started_at, completed_at
            FROM harvest_runs
            WHERE request_key = $1
            "#,
        )
        .bind(request_key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_run).transpose()
    }
}

#[async_trait]
impl RunRegistry for PostgresRegistry {
    async fn insert_run(&self, run: Run) -> anyhow::Result<RunInsert> {
        let source_ids = serde_json::to_value(&run.source_ids)?;

        let res = sqlx::query(
            r#"
            INSERT INTO harvest_runs (
                id, request_key, status, source_ids, created_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (request_key) DO NOTHING
            "#,
        )
        .bind(run.id.0)
        .bind(&run.request_key)
        .bind(run.status.as_str())
        .bind(&source_ids)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() > 0 {
            return Ok(RunInsert::Created(run));
        }

        let existing = self
            .run_by_key(&run.request_key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("run for key {} vanished", run.request_key))?;
        Ok(RunInsert::Existing(existing))
    }

    async fn get_run(&self, run_id: RunId) -> anyhow::Result<Option<Run>> {
        let row = sqlx::query(
            r#"
            SELECT id, request_key, status, source_ids, created_at, started_at, completed_at
            FROM harvest_runs
            WHERE id = $1
            "#,
        )
        .bind(run_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn stamp_run_started(&self, run_id: RunId, now: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE harvest_runs
            SET started_at = $2
            WHERE id = $1
              AND started_at IS NULL
            "#,
        )
        .bind(run_id.0)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        if !status.is_terminal() {
            anyhow::bail!("cannot finalize run {} as {}", run_id, status);
        }

        let res = sqlx::query(
            r#"
            UPDATE harvest_runs
            SET status = $2,
                completed_at = $3
            WHERE id = $1
              AND status = 'running'
            "#,
        )
        .bind(run_id.0)
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() > 0)
    }

    async fn runs_with_status(&self, status: RunStatus) -> anyhow::Result<Vec<RunId>> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM harvest_runs
            WHERE status = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok(RunId(row.try_get::<Uuid, _>("id")?)))
            .collect()
    }
}

#[async_trait]
impl TaskRegistry for PostgresRegistry {
    async fn insert_tasks(&self, run_id: RunId, tasks: Vec<Task>) -> anyhow::Result<bool> {
        if let Some(stray) = tasks.iter().find(|t| t.run_id != run_id) {
            anyhow::bail!("task {} belongs to run {}, not {}", stray.id, stray.run_id, run_id);
        }

        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            UPDATE harvest_runs
            SET status = 'running'
            WHERE id = $1
              AND status = 'pending'
            "#,
        )
        .bind(run_id.0)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM harvest_runs WHERE id = $1")
                .bind(run_id.0)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
            tx.rollback().await?;
            if !exists {
                anyhow::bail!("run {} not found", run_id);
            }
            return Ok(false);
        }

        for (position, task) in tasks.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO harvest_tasks (
                    id, run_id, position, source_id, status, job_handle,
                    created_at, started_at, completed_at, error_message
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(task.id.0)
            .bind(run_id.0)
            .bind(position as i32)
            .bind(task.source_id.as_str())
            .bind(task.status.as_str())
            .bind(task.job_handle.as_ref().map(|h| h.as_str().to_string()))
            .bind(task.created_at)
            .bind(task.started_at)
            .bind(task.completed_at)
            .bind(&task.error_message)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("inserted {} tasks for run {}", tasks.len(), run_id);
        Ok(true)
    }

    async fn get_task(&self, task_id: TaskId) -> anyhow::Result<Option<Task>> {
        let row = sqlx::query(
            r#"
            SELECT id, run_id, source_id, status, job_handle,
                   created_at, started_at, completed_at, error_message
            FROM harvest_tasks
            WHERE id = $1
            "#,
        )
        .bind(task_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn tasks_for_run(&self, run_id: RunId) -> anyhow::Result<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, source_id, status, job_handle,
                   created_at, started_at, completed_at, error_message
            FROM harvest_tasks
            WHERE run_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn transition_task(
        &self,
        task_id: TaskId,
        expected: TaskStatus,
        transition: TaskTransition,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        if !transition.allowed_from(expected) {
            anyhow::bail!(
                "illegal task transition {} -> {}",
                expected,
                transition.target()
            );
        }

        let res = match &transition {
            TaskTransition::Dispatched { handle } => {
                sqlx::query(
                    r#"
                    UPDATE harvest_tasks
                    SET status = 'dispatched',
                        job_handle = $3
                    WHERE id = $1
                      AND status = $2
                    "#,
                )
                .bind(task_id.0)
                .bind(expected.as_str())
                .bind(handle.as_str())
                .execute(&self.pool)
                .await?
            }
            TaskTransition::Completed => {
                sqlx::query(
                    r#"
                    UPDATE harvest_tasks
                    SET status = 'completed',
                        completed_at = $3
                    WHERE id = $1
                      AND status = $2
                    "#,
                )
                .bind(task_id.0)
                .bind(expected.as_str())
                .bind(now)
                .execute(&self.pool)
                .await?
            }
            TaskTransition::Failed { message } => {
                sqlx::query(
                    r#"
                    UPDATE harvest_tasks
                    SET status = 'failed',
                        completed_at = $3,
                        error_message = $4
                    WHERE id = $1
                      AND status = $2
                    "#,
                )
                .bind(task_id.0)
                .bind(expected.as_str())
                .bind(now)
                .bind(message)
                .execute(&self.pool)
                .await?
            }
        };

        let won = res.rows_affected() > 0;
        if !won {
            debug!(
                task_id = %task_id,
                expected = %expected,
                target = %transition.target(),
                "task transition lost compare-and-set"
            );
        }
        Ok(won)
    }

    async fn mark_task_started(&self, task_id: TaskId, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE harvest_tasks
            SET started_at = $2
            WHERE id = $1
              AND status = 'dispatched'
              AND started_at IS NULL
            "#,
        )
        .bind(task_id.0)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() > 0)
    }
}

#[async_trait]
impl StuckTaskScanner for PostgresRegistry {
    async fn reclaim_stuck(
        &self,
        run_id: RunId,
        cutoff: DateTime<Utc>,
        message: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<TaskId>> {
        // Rows updated concurrently are re-checked against the WHERE clause.
        let rows = sqlx::query(
            r#"
            UPDATE harvest_tasks
            SET status = 'failed',
                completed_at = $3,
                error_message = $4
            WHERE run_id = $1
              AND status IN ('pending', 'dispatched')
              AND created_at < $2
            RETURNING id
            "#,
        )
        .bind(run_id.0)
        .bind(cutoff)
        .bind(now)
        .bind(message)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok(TaskId(row.try_get::<Uuid, _>("id")?)))
            .collect()
    }
}
