//! Benchmark job queue repository
//!
//! Status and priority are stored as upper-case text. Claiming a job is a
//! compare-and-set on `status = 'PENDING'` so a job can only ever be handed
//! to one execution.

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct JobRow {
    pub id: i64,
    pub job_type: String,
    pub target_address: Option<String>,
    pub peer_group_id: Option<String>,
    pub priority: String,
    pub status: String,
    pub created_at: i64,
    pub scheduled_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
}

/// Fields supplied when enqueueing a job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub target_address: Option<String>,
    pub peer_group_id: Option<String>,
    pub priority: String,
    pub scheduled_at: i64,
    pub max_retries: i64,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, job_type, target_address, peer_group_id, priority, status,
           created_at, scheduled_at, started_at, completed_at, error_message,
           retry_count, max_retries
    FROM benchmark_jobs
"#;

// HIGH > MEDIUM > LOW, FIFO within a priority
const PRIORITY_ORDER: &str =
    "CASE priority WHEN 'HIGH' THEN 0 WHEN 'MEDIUM' THEN 1 ELSE 2 END, scheduled_at ASC, id ASC";

pub struct JobRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> JobRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Enqueue a job in PENDING with a zero retry count
    pub async fn create(&self, job: &NewJob, now_ms: i64) -> DbResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO benchmark_jobs
                (job_type, target_address, peer_group_id, priority, status,
                 created_at, scheduled_at, retry_count, max_retries)
               VALUES (?1, ?2, ?3, ?4, 'PENDING', ?5, ?6, 0, ?7)
            "#,
        )
        .bind(&job.job_type)
        .bind(&job.target_address)
        .bind(&job.peer_group_id)
        .bind(&job.priority)
        .bind(now_ms)
        .bind(job.scheduled_at)
        .bind(job.max_retries)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> DbResult<Option<JobRow>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let job = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool)
            .await?;
        Ok(job)
    }

    /// Due PENDING jobs in dequeue order
    pub async fn list_pending(&self, limit: i64, now_ms: i64) -> DbResult<Vec<JobRow>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status = 'PENDING' AND scheduled_at <= ?1 ORDER BY {PRIORITY_ORDER} LIMIT ?2"
        );
        let jobs = sqlx::query_as::<_, JobRow>(&sql)
            .bind(now_ms)
            .bind(limit)
            .fetch_all(self.pool)
            .await?;
        Ok(jobs)
    }

    /// PENDING -> RUNNING. Returns false when another execution got there first.
    pub async fn claim(&self, id: i64, now_ms: i64) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE benchmark_jobs SET status = 'RUNNING', started_at = ?1, error_message = NULL
             WHERE id = ?2 AND status = 'PENDING'",
        )
        .bind(now_ms)
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record a terminal-or-intermediate status (COMPLETED / FAILED)
    pub async fn set_status(
        &self,
        id: i64,
        status: &str,
        error_message: Option<&str>,
        now_ms: i64,
    ) -> DbResult<()> {
        sqlx::query(
            "UPDATE benchmark_jobs SET status = ?1, error_message = ?2, completed_at = ?3 WHERE id = ?4",
        )
        .bind(status)
        .bind(error_message)
        .bind(now_ms)
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// FAILED -> PENDING with retry_count + 1, in one statement.
    /// Returns false when the retry budget is already spent.
    pub async fn increment_retry(&self, id: i64, now_ms: i64) -> DbResult<bool> {
        let result = sqlx::query(
            r#"UPDATE benchmark_jobs SET
                 status = 'PENDING',
                 retry_count = retry_count + 1,
                 scheduled_at = ?1,
                 started_at = NULL,
                 completed_at = NULL
               WHERE id = ?2 AND status = 'FAILED' AND retry_count < max_retries
            "#,
        )
        .bind(now_ms)
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// RUNNING jobs started before the cutoff
    pub async fn list_running_started_before(&self, cutoff_ms: i64) -> DbResult<Vec<JobRow>> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status = 'RUNNING' AND started_at < ?1 ORDER BY started_at ASC"
        );
        let jobs = sqlx::query_as::<_, JobRow>(&sql)
            .bind(cutoff_ms)
            .fetch_all(self.pool)
            .await?;
        Ok(jobs)
    }

    /// Whether a PENDING/RUNNING job of this type already targets the address
    pub async fn has_active_for_address(&self, job_type: &str, address: &str) -> DbResult<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM benchmark_jobs
             WHERE job_type = ?1 AND target_address = ?2 AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(job_type)
        .bind(address)
        .fetch_one(self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Whether a PENDING/RUNNING job of this type already targets the peer group
    pub async fn has_active_for_peer_group(&self, job_type: &str, peer_group_id: &str) -> DbResult<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM benchmark_jobs
             WHERE job_type = ?1 AND peer_group_id = ?2 AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(job_type)
        .bind(peer_group_id)
        .fetch_one(self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn count_by_status(&self, status: &str) -> DbResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM benchmark_jobs WHERE status = ?1")
                .bind(status)
                .fetch_one(self.pool)
                .await?;
        Ok(count)
    }

    /// Most recent jobs, optionally filtered by status
    pub async fn list_recent(&self, status: Option<&str>, limit: i64) -> DbResult<Vec<JobRow>> {
        let jobs = match status {
            Some(status) => {
                let sql = format!("{SELECT_COLUMNS} WHERE status = ?1 ORDER BY id DESC LIMIT ?2");
                sqlx::query_as::<_, JobRow>(&sql)
                    .bind(status)
                    .bind(limit)
                    .fetch_all(self.pool)
                    .await?
            }
            None => {
                let sql = format!("{SELECT_COLUMNS} ORDER BY id DESC LIMIT ?1");
                sqlx::query_as::<_, JobRow>(&sql)
                    .bind(limit)
                    .fetch_all(self.pool)
                    .await?
            }
        };
        Ok(jobs)
    }
}
