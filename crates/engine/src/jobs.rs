//! Refresh job queue
//!
//! Jobs move PENDING -> RUNNING -> COMPLETED, or RUNNING -> FAILED and back
//! to PENDING while retry budget remains. Every transition out of PENDING is
//! a conditional update, so two dequeuers can never both own a job.

use crate::error::{BenchmarkError, BenchmarkResult};
use crate::store::BenchmarkStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "jobType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    #[serde(rename_all = "camelCase")]
    BenchmarkUpdate { address: String },
    #[serde(rename_all = "camelCase")]
    PeerGroupRefresh { peer_group_id: String },
    #[serde(rename_all = "camelCase")]
    PercentileRecalc { peer_group_id: String },
}

impl JobKind {
    pub const BENCHMARK_UPDATE: &'static str = "BENCHMARK_UPDATE";
    pub const PEER_GROUP_REFRESH: &'static str = "PEER_GROUP_REFRESH";
    pub const PERCENTILE_RECALC: &'static str = "PERCENTILE_RECALC";

    pub fn job_type(&self) -> &'static str {
        match self {
            Self::BenchmarkUpdate { .. } => Self::BENCHMARK_UPDATE,
            Self::PeerGroupRefresh { .. } => Self::PEER_GROUP_REFRESH,
            Self::PercentileRecalc { .. } => Self::PERCENTILE_RECALC,
        }
    }

    pub fn target_address(&self) -> Option<&str> {
        match self {
            Self::BenchmarkUpdate { address } => Some(address),
            _ => None,
        }
    }

    pub fn peer_group_id(&self) -> Option<&str> {
        match self {
            Self::PeerGroupRefresh { peer_group_id } | Self::PercentileRecalc { peer_group_id } => {
                Some(peer_group_id)
            }
            Self::BenchmarkUpdate { .. } => None,
        }
    }

    /// Rebuild from stored columns; None when the row is inconsistent
    pub fn from_parts(job_type: &str, address: Option<String>, peer_group_id: Option<String>) -> Option<Self> {
        match job_type {
            Self::BENCHMARK_UPDATE => address.map(|address| Self::BenchmarkUpdate { address }),
            Self::PEER_GROUP_REFRESH => {
                peer_group_id.map(|peer_group_id| Self::PeerGroupRefresh { peer_group_id })
            }
            Self::PERCENTILE_RECALC => {
                peer_group_id.map(|peer_group_id| Self::PercentileRecalc { peer_group_id })
            }
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BenchmarkUpdate { address } => write!(f, "{}({address})", self.job_type()),
            Self::PeerGroupRefresh { peer_group_id } | Self::PercentileRecalc { peer_group_id } => {
                write!(f, "{}({peer_group_id})", self.job_type())
            }
        }
    }
}

/// HIGH: explicit on-demand requests; MEDIUM: score feedback; LOW: background sweeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPriority {
    High,
    Medium,
    Low,
}

impl JobPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HIGH" => Some(Self::High),
            "MEDIUM" => Some(Self::Medium),
            "LOW" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkUpdateJob {
    pub id: i64,
    #[serde(flatten)]
    pub kind: JobKind,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// What happened to a job whose execution failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back in PENDING with this retry count
    Requeued(u32),
    /// Retry budget exhausted; terminal FAILED
    Exhausted,
}

/// Job lifecycle on top of the store
#[derive(Clone)]
pub struct JobQueue {
    store: BenchmarkStore,
}

impl JobQueue {
    pub fn new(store: BenchmarkStore) -> Self {
        Self { store }
    }

    /// Enqueue a job due `delay` from now. A delay past the representable
    /// time range is a validation error.
    pub async fn create(
        &self,
        kind: JobKind,
        priority: JobPriority,
        delay: Duration,
        max_retries: u32,
    ) -> BenchmarkResult<i64> {
        let scheduled_at = Utc::now()
            .checked_add_signed(delay.max(Duration::zero()))
            .ok_or_else(|| BenchmarkError::Validation(format!("job delay {delay} is out of range")))?;
        let id = self
            .store
            .create_job(&kind, priority, scheduled_at, max_retries)
            .await?;
        debug!(job_id = id, job = %kind, priority = priority.as_str(), "Job enqueued");
        Ok(id)
    }

    /// Claim up to `limit` due jobs in priority order.
    /// Jobs claimed concurrently by someone else are skipped.
    pub async fn dequeue(&self, limit: u32) -> BenchmarkResult<Vec<BenchmarkUpdateJob>> {
        let candidates = self.store.list_pending(limit).await?;
        let mut claimed = Vec::with_capacity(candidates.len());

        for mut job in candidates {
            let now = Utc::now();
            if self.store.claim_job(job.id).await? {
                job.status = JobStatus::Running;
                job.started_at = Some(now);
                claimed.push(job);
            } else {
                debug!(job_id = job.id, "Job already claimed elsewhere");
            }
        }

        Ok(claimed)
    }

    pub async fn complete(&self, job: &BenchmarkUpdateJob) -> BenchmarkResult<()> {
        self.store
            .set_job_status(job.id, JobStatus::Completed, None)
            .await
    }

    /// Mark FAILED, then requeue while retry budget remains
    pub async fn fail(&self, job: &BenchmarkUpdateJob, message: &str) -> BenchmarkResult<FailureOutcome> {
        self.store
            .set_job_status(job.id, JobStatus::Failed, Some(message))
            .await?;

        if self.store.increment_retry(job.id).await? {
            let retry_count = job.retry_count + 1;
            warn!(
                job_id = job.id,
                job = %job.kind,
                retry_count,
                max_retries = job.max_retries,
                error = message,
                "Job failed, requeued"
            );
            Ok(FailureOutcome::Requeued(retry_count))
        } else {
            error!(
                job_id = job.id,
                job = %job.kind,
                retry_count = job.retry_count,
                error = message,
                "Job failed permanently"
            );
            Ok(FailureOutcome::Exhausted)
        }
    }

    /// Fail every job RUNNING since before `cutoff`, feeding them into the retry path
    pub async fn reap_stuck(&self, cutoff: DateTime<Utc>) -> BenchmarkResult<usize> {
        let stuck = self.store.list_running_started_before(cutoff).await?;
        for job in &stuck {
            self.fail(job, "job exceeded its running time limit").await?;
        }
        Ok(stuck.len())
    }

    pub async fn get(&self, id: i64) -> BenchmarkResult<BenchmarkUpdateJob> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| BenchmarkError::NotFound(format!("job {id}")))
    }

    pub async fn list(&self, status: Option<JobStatus>, limit: u32) -> BenchmarkResult<Vec<BenchmarkUpdateJob>> {
        self.store.list_jobs(status, limit).await
    }
}
