//! Durable job records: the scheduler's only channel to persistent state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use super::history::{HistoryEntry, RunStatus};
use super::job::{JobConfig, JobType, ScheduledJob};
use crate::storage::{format_timestamp, parse_timestamp, Pool};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode job config: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("job {0} not found in store")]
    NotFound(Uuid),

    #[error("corrupt job row {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence contract for scheduled jobs and their run history.
///
/// Implementations must be safe for concurrent use. Each call stands on its
/// own; there are no cross-call transactions.
pub trait JobStore: Send + Sync {
    fn create(&self, job: &ScheduledJob) -> Result<(), StoreError>;

    /// All decodable jobs, oldest first. Rows that fail to decode are
    /// skipped with a warning.
    fn get_all(&self) -> Result<Vec<ScheduledJob>, StoreError>;

    fn get(&self, id: Uuid) -> Result<ScheduledJob, StoreError>;

    /// Overwrite an existing row. Never inserts: a missing row is `NotFound`.
    fn update(&self, job: &ScheduledJob) -> Result<(), StoreError>;

    fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), StoreError>;

    fn record_run(&self, entry: &HistoryEntry) -> Result<(), StoreError>;

    /// Most recent runs of `id`, newest first.
    fn recent_runs(&self, id: Uuid, limit: usize) -> Result<Vec<HistoryEntry>, StoreError>;
}

/// Run one store call on the blocking pool.
pub(crate) async fn blocking<T, F>(store: &Arc<dyn JobStore>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn JobStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
}

/// Run-history rows kept per job unless configured otherwise.
pub const DEFAULT_HISTORY_RETENTION: usize = 500;

/// SQLite-backed [`JobStore`].
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: Pool,
    history_retention: usize,
}

const JOB_COLUMNS: &str =
    "id, name, type, cron_expression, config, enabled, last_run, next_run, created_at";

/// Raw column values of one `scheduled_jobs` row.
struct JobRow {
    id: String,
    name: String,
    job_type: String,
    cron_expression: String,
    config: String,
    enabled: bool,
    last_run: Option<String>,
    next_run: Option<String>,
    created_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            job_type: row.get(2)?,
            cron_expression: row.get(3)?,
            config: row.get(4)?,
            enabled: row.get(5)?,
            last_run: row.get(6)?,
            next_run: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn decode(self) -> Result<ScheduledJob, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };

        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt(e.to_string()))?;
        let job_type: JobType = self.job_type.parse().map_err(corrupt)?;
        let config =
            JobConfig::from_json(job_type, &self.config).map_err(|e| corrupt(e.to_string()))?;
        let created_at = parse_timestamp(&self.created_at)
            .ok_or_else(|| corrupt(format!("bad created_at '{}'", self.created_at)))?;

        Ok(ScheduledJob {
            id,
            name: self.name,
            cron_expression: self.cron_expression,
            enabled: self.enabled,
            config,
            last_run: self.last_run.as_deref().and_then(parse_timestamp),
            next_run: self.next_run.as_deref().and_then(parse_timestamp),
            created_at,
        })
    }
}

fn optional_timestamp(at: &Option<DateTime<Utc>>) -> Option<String> {
    at.as_ref().map(format_timestamp)
}

impl SqliteJobStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            history_retention: DEFAULT_HISTORY_RETENTION,
        }
    }

    /// Keep at most `rows` history entries per job. 0 disables pruning.
    pub fn with_history_retention(mut self, rows: usize) -> Self {
        self.history_retention = rows;
        self
    }
}

impl JobStore for SqliteJobStore {
    fn create(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        let config = job.config.to_json()?;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO scheduled_jobs (id, name, type, cron_expression, config, enabled, last_run, next_run, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                job.id.to_string(),
                job.name,
                job.job_type().as_str(),
                job.cron_expression,
                config,
                job.enabled,
                optional_timestamp(&job.last_run),
                optional_timestamp(&job.next_run),
                format_timestamp(&job.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map([], JobRow::from_row)?;

        let mut jobs = Vec::new();
        for row in rows {
            match row?.decode() {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(error = %e, "skipping undecodable scheduled job"),
            }
        }
        Ok(jobs)
    }

    fn get(&self, id: Uuid) -> Result<ScheduledJob, StoreError> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE id = ?1"),
                [id.to_string()],
                JobRow::from_row,
            )
            .optional()?;
        row.ok_or(StoreError::NotFound(id))?.decode()
    }

    fn update(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        let config = job.config.to_json()?;
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE scheduled_jobs
             SET name = ?2, type = ?3, cron_expression = ?4, config = ?5, enabled = ?6,
                 last_run = ?7, next_run = ?8
             WHERE id = ?1",
            params![
                job.id.to_string(),
                job.name,
                job.job_type().as_str(),
                job.cron_expression,
                config,
                job.enabled,
                optional_timestamp(&job.last_run),
                optional_timestamp(&job.next_run),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(job.id));
        }
        Ok(())
    }

    fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM scheduled_jobs WHERE id = ?1",
            [id.to_string()],
        )?;
        Ok(())
    }

    fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE scheduled_jobs SET enabled = ?1 WHERE id = ?2",
            params![enabled, id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Append a run and prune the job's history down to the retention limit.
    fn record_run(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO schedule_history (job_id, job_name, status, result_summary, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.job_id.to_string(),
                entry.job_name,
                entry.status.as_str(),
                entry.result_summary,
                format_timestamp(&entry.started_at),
                optional_timestamp(&entry.finished_at),
            ],
        )?;
        if self.history_retention > 0 {
            tx.execute(
                "DELETE FROM schedule_history WHERE job_id = ?1 AND id NOT IN (
                     SELECT id FROM schedule_history WHERE job_id = ?1
                     ORDER BY started_at DESC, id DESC LIMIT ?2
                 )",
                params![entry.job_id.to_string(), self.history_retention as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn recent_runs(&self, id: Uuid, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT job_name, status, result_summary, started_at, finished_at
             FROM schedule_history WHERE job_id = ?1
             ORDER BY started_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![id.to_string(), limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut entries = Vec::new();
        for r in rows {
            let (job_name, status, result_summary, started_at, finished_at) = r?;
            let Ok(status) = status.parse::<RunStatus>() else {
                warn!(job_id = %id, %status, "skipping history row with unknown status");
                continue;
            };
            let Some(started_at) = parse_timestamp(&started_at) else {
                continue;
            };
            entries.push(HistoryEntry {
                job_id: id,
                job_name,
                status,
                result_summary,
                started_at,
                finished_at: finished_at.as_deref().and_then(parse_timestamp),
            });
        }
        Ok(entries)
    }
}
