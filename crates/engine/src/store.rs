//! Benchmark store: domain-typed facade over the persistence repositories
//!
//! Rows keep timestamps as epoch milliseconds and maps as JSON text; this
//! layer converts both ways so callers only see domain types.

use crate::error::BenchmarkResult;
use crate::jobs::{BenchmarkUpdateJob, JobKind, JobPriority, JobStatus};
use crate::types::{from_millis, BenchmarkRecord, PeerGroupSnapshot, ScoreInputs};
use chrono::{DateTime, Utc};
use persistence::repository::{
    AddressInputsRow, BenchmarkRecordPatch, BenchmarkRecordRow, BenchmarkRepository, InputsRepository,
    JobRepository, JobRow, NewJob, PeerGroupSnapshotRow, SnapshotRepository,
};
use persistence::{DbError, SqlitePool};
use std::collections::BTreeMap;

/// Partial benchmark update; `None` keeps the stored value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BenchmarkPatch {
    pub peer_group_id: Option<String>,
    pub overall_score: Option<f64>,
    pub overall_percentile: Option<f64>,
    pub component_scores: Option<BTreeMap<String, f64>>,
    pub component_percentiles: Option<BTreeMap<String, f64>>,
    pub classification_confidence: Option<f64>,
    pub benchmark_timestamp: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub update_frequency_seconds: Option<u64>,
    pub is_stale: Option<bool>,
}

impl BenchmarkPatch {
    /// The full record this patch describes, if every field is present
    pub fn into_record(self, address: &str) -> Option<BenchmarkRecord> {
        Some(BenchmarkRecord {
            address: address.to_string(),
            peer_group_id: self.peer_group_id?,
            overall_score: self.overall_score?,
            overall_percentile: self.overall_percentile?,
            component_scores: self.component_scores.unwrap_or_default(),
            component_percentiles: self.component_percentiles.unwrap_or_default(),
            classification_confidence: self.classification_confidence?,
            benchmark_timestamp: self.benchmark_timestamp?,
            last_updated: self.last_updated?,
            update_frequency_seconds: self.update_frequency_seconds?,
            is_stale: self.is_stale.unwrap_or(false),
        })
    }
}

#[derive(Clone)]
pub struct BenchmarkStore {
    pool: SqlitePool,
}

impl BenchmarkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- benchmark records ----

    pub async fn upsert_benchmark_record(&self, record: &BenchmarkRecord) -> BenchmarkResult<()> {
        let row = record_to_row(record)?;
        BenchmarkRepository::new(&self.pool).upsert(&row).await?;
        Ok(())
    }

    /// Merge the patch into the stored record. Returns false when the address has no record.
    pub async fn update_benchmark_record(&self, address: &str, patch: &BenchmarkPatch) -> BenchmarkResult<bool> {
        let row_patch = BenchmarkRecordPatch {
            peer_group_id: patch.peer_group_id.clone(),
            overall_score: patch.overall_score,
            overall_percentile: patch.overall_percentile,
            component_scores: patch
                .component_scores
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            component_percentiles: patch
                .component_percentiles
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            classification_confidence: patch.classification_confidence,
            benchmark_timestamp: patch.benchmark_timestamp.map(|t| t.timestamp_millis()),
            last_updated: patch.last_updated.map(|t| t.timestamp_millis()),
            update_frequency_seconds: patch.update_frequency_seconds.map(|s| s as i64),
            is_stale: patch.is_stale,
        };
        Ok(BenchmarkRepository::new(&self.pool)
            .merge(address, &row_patch)
            .await?)
    }

    pub async fn get_benchmark_record(&self, address: &str) -> BenchmarkResult<Option<BenchmarkRecord>> {
        BenchmarkRepository::new(&self.pool)
            .get(address)
            .await?
            .map(row_to_record)
            .transpose()
    }

    /// Flag records not updated within `older_than_seconds`; returns how many became stale
    pub async fn mark_stale(&self, older_than_seconds: u64) -> BenchmarkResult<u64> {
        Ok(BenchmarkRepository::new(&self.pool)
            .mark_stale(older_than_seconds as i64, Utc::now().timestamp_millis())
            .await?)
    }

    /// Stale addresses not yet covered by a refresh job, oldest first
    pub async fn list_stale(&self, limit: u32) -> BenchmarkResult<Vec<String>> {
        Ok(BenchmarkRepository::new(&self.pool)
            .list_stale(limit as i64)
            .await?)
    }

    pub async fn list_peer_group_records(&self, peer_group_id: &str) -> BenchmarkResult<Vec<BenchmarkRecord>> {
        BenchmarkRepository::new(&self.pool)
            .list_by_peer_group(peer_group_id)
            .await?
            .into_iter()
            .map(row_to_record)
            .collect()
    }

    pub async fn peer_groups_with_members(&self) -> BenchmarkResult<Vec<String>> {
        Ok(BenchmarkRepository::new(&self.pool)
            .peer_groups_with_members()
            .await?)
    }

    pub async fn count_benchmarks(&self) -> BenchmarkResult<u64> {
        Ok(BenchmarkRepository::new(&self.pool).count().await? as u64)
    }

    pub async fn count_stale(&self, stale_threshold_seconds: u64) -> BenchmarkResult<u64> {
        let count = BenchmarkRepository::new(&self.pool)
            .count_stale(stale_threshold_seconds as i64, Utc::now().timestamp_millis())
            .await?;
        Ok(count as u64)
    }

    pub async fn latest_update(&self) -> BenchmarkResult<Option<DateTime<Utc>>> {
        Ok(BenchmarkRepository::new(&self.pool)
            .latest_update()
            .await?
            .map(from_millis))
    }

    // ---- jobs ----

    pub async fn create_job(
        &self,
        kind: &JobKind,
        priority: JobPriority,
        scheduled_at: DateTime<Utc>,
        max_retries: u32,
    ) -> BenchmarkResult<i64> {
        let job = NewJob {
            job_type: kind.job_type().to_string(),
            target_address: kind.target_address().map(str::to_string),
            peer_group_id: kind.peer_group_id().map(str::to_string),
            priority: priority.as_str().to_string(),
            scheduled_at: scheduled_at.timestamp_millis(),
            max_retries: max_retries as i64,
        };
        Ok(JobRepository::new(&self.pool)
            .create(&job, Utc::now().timestamp_millis())
            .await?)
    }

    pub async fn get_job(&self, id: i64) -> BenchmarkResult<Option<BenchmarkUpdateJob>> {
        JobRepository::new(&self.pool)
            .get(id)
            .await?
            .map(row_to_job)
            .transpose()
    }

    /// Due PENDING jobs in dequeue order (priority, then scheduled time, then id)
    pub async fn list_pending(&self, limit: u32) -> BenchmarkResult<Vec<BenchmarkUpdateJob>> {
        JobRepository::new(&self.pool)
            .list_pending(limit as i64, Utc::now().timestamp_millis())
            .await?
            .into_iter()
            .map(row_to_job)
            .collect()
    }

    /// PENDING -> RUNNING; false if the job was no longer PENDING
    pub async fn claim_job(&self, id: i64) -> BenchmarkResult<bool> {
        Ok(JobRepository::new(&self.pool)
            .claim(id, Utc::now().timestamp_millis())
            .await?)
    }

    pub async fn set_job_status(&self, id: i64, status: JobStatus, error_message: Option<&str>) -> BenchmarkResult<()> {
        JobRepository::new(&self.pool)
            .set_status(id, status.as_str(), error_message, Utc::now().timestamp_millis())
            .await?;
        Ok(())
    }

    /// FAILED -> PENDING with one more retry; false once the budget is spent
    pub async fn increment_retry(&self, id: i64) -> BenchmarkResult<bool> {
        Ok(JobRepository::new(&self.pool)
            .increment_retry(id, Utc::now().timestamp_millis())
            .await?)
    }

    pub async fn list_running_started_before(&self, cutoff: DateTime<Utc>) -> BenchmarkResult<Vec<BenchmarkUpdateJob>> {
        JobRepository::new(&self.pool)
            .list_running_started_before(cutoff.timestamp_millis())
            .await?
            .into_iter()
            .map(row_to_job)
            .collect()
    }

    /// Whether a PENDING/RUNNING job of the same kind already targets the same subject
    pub async fn has_active_job(&self, kind: &JobKind) -> BenchmarkResult<bool> {
        let jobs = JobRepository::new(&self.pool);
        let active = match kind {
            JobKind::BenchmarkUpdate { address } => {
                jobs.has_active_for_address(kind.job_type(), address).await?
            }
            JobKind::PeerGroupRefresh { peer_group_id } | JobKind::PercentileRecalc { peer_group_id } => {
                jobs.has_active_for_peer_group(kind.job_type(), peer_group_id)
                    .await?
            }
        };
        Ok(active)
    }

    pub async fn count_jobs(&self, status: JobStatus) -> BenchmarkResult<u64> {
        Ok(JobRepository::new(&self.pool)
            .count_by_status(status.as_str())
            .await? as u64)
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: u32) -> BenchmarkResult<Vec<BenchmarkUpdateJob>> {
        JobRepository::new(&self.pool)
            .list_recent(status.as_ref().map(JobStatus::as_str), limit as i64)
            .await?
            .into_iter()
            .map(row_to_job)
            .collect()
    }

    // ---- snapshots ----

    pub async fn insert_peer_group_snapshot(&self, snapshot: &PeerGroupSnapshot) -> BenchmarkResult<i64> {
        let row = PeerGroupSnapshotRow {
            id: None,
            peer_group_id: snapshot.peer_group_id.clone(),
            member_count: snapshot.member_count as i64,
            average_score: snapshot.average_score,
            score_distribution: serde_json::to_string(&snapshot.score_distribution)?,
            snapshot_timestamp: snapshot.snapshot_timestamp.timestamp_millis(),
            is_active: true,
        };
        Ok(SnapshotRepository::new(&self.pool).insert(&row).await?)
    }

    pub async fn get_latest_active_snapshot(&self, peer_group_id: &str) -> BenchmarkResult<Option<PeerGroupSnapshot>> {
        SnapshotRepository::new(&self.pool)
            .get_latest_active(peer_group_id)
            .await?
            .map(row_to_snapshot)
            .transpose()
    }

    pub async fn deactivate_older_than(&self, peer_group_id: &str, keep_latest_n: u32) -> BenchmarkResult<u64> {
        Ok(SnapshotRepository::new(&self.pool)
            .deactivate_older_than(peer_group_id, keep_latest_n as i64)
            .await?)
    }

    pub async fn prune_snapshots(&self, peer_group_id: &str, retain: u32) -> BenchmarkResult<u64> {
        Ok(SnapshotRepository::new(&self.pool)
            .prune(peer_group_id, retain as i64)
            .await?)
    }

    pub async fn list_snapshots(&self, peer_group_id: &str) -> BenchmarkResult<Vec<PeerGroupSnapshot>> {
        SnapshotRepository::new(&self.pool)
            .list_for_group(peer_group_id)
            .await?
            .into_iter()
            .map(row_to_snapshot)
            .collect()
    }

    pub async fn count_active_peer_groups(&self) -> BenchmarkResult<u64> {
        Ok(SnapshotRepository::new(&self.pool)
            .count_active_groups()
            .await? as u64)
    }

    // ---- score inputs ----

    pub async fn save_inputs(&self, address: &str, inputs: &ScoreInputs) -> BenchmarkResult<()> {
        let row = AddressInputsRow {
            address: address.to_string(),
            metrics: serde_json::to_string(&inputs.metrics)?,
            transactions: serde_json::to_string(&inputs.transactions)?,
            score: inputs.breakdown.score,
            components: serde_json::to_string(&inputs.breakdown.components)?,
            updated_at: Utc::now().timestamp_millis(),
        };
        InputsRepository::new(&self.pool).save(&row).await?;
        Ok(())
    }

    pub async fn get_inputs(&self, address: &str) -> BenchmarkResult<Option<ScoreInputs>> {
        let Some(row) = InputsRepository::new(&self.pool).get(address).await? else {
            return Ok(None);
        };
        Ok(Some(ScoreInputs {
            metrics: serde_json::from_str(&row.metrics)?,
            transactions: serde_json::from_str(&row.transactions)?,
            breakdown: crate::types::ScoreBreakdown {
                score: row.score,
                components: serde_json::from_str(&row.components)?,
            },
        }))
    }
}

fn record_to_row(record: &BenchmarkRecord) -> BenchmarkResult<BenchmarkRecordRow> {
    Ok(BenchmarkRecordRow {
        address: record.address.clone(),
        peer_group_id: record.peer_group_id.clone(),
        overall_score: record.overall_score,
        overall_percentile: record.overall_percentile,
        component_scores: serde_json::to_string(&record.component_scores)?,
        component_percentiles: serde_json::to_string(&record.component_percentiles)?,
        classification_confidence: record.classification_confidence,
        benchmark_timestamp: record.benchmark_timestamp.timestamp_millis(),
        last_updated: record.last_updated.timestamp_millis(),
        update_frequency_seconds: record.update_frequency_seconds as i64,
        is_stale: record.is_stale,
    })
}

fn row_to_record(row: BenchmarkRecordRow) -> BenchmarkResult<BenchmarkRecord> {
    Ok(BenchmarkRecord {
        component_scores: serde_json::from_str(&row.component_scores)?,
        component_percentiles: serde_json::from_str(&row.component_percentiles)?,
        address: row.address,
        peer_group_id: row.peer_group_id,
        overall_score: row.overall_score,
        overall_percentile: row.overall_percentile,
        classification_confidence: row.classification_confidence,
        benchmark_timestamp: from_millis(row.benchmark_timestamp),
        last_updated: from_millis(row.last_updated),
        update_frequency_seconds: row.update_frequency_seconds.max(0) as u64,
        is_stale: row.is_stale,
    })
}

fn row_to_snapshot(row: PeerGroupSnapshotRow) -> BenchmarkResult<PeerGroupSnapshot> {
    Ok(PeerGroupSnapshot {
        score_distribution: serde_json::from_str(&row.score_distribution)?,
        id: row.id,
        peer_group_id: row.peer_group_id,
        member_count: row.member_count.max(0) as u64,
        average_score: row.average_score,
        snapshot_timestamp: from_millis(row.snapshot_timestamp),
        is_active: row.is_active,
    })
}

fn row_to_job(row: JobRow) -> BenchmarkResult<BenchmarkUpdateJob> {
    let kind = JobKind::from_parts(&row.job_type, row.target_address, row.peer_group_id)
        .ok_or_else(|| DbError::Query(format!("job {} has invalid type/target: {}", row.id, row.job_type)))?;
    let priority = JobPriority::parse(&row.priority)
        .ok_or_else(|| DbError::Query(format!("job {} has unknown priority {}", row.id, row.priority)))?;
    let status = JobStatus::parse(&row.status)
        .ok_or_else(|| DbError::Query(format!("job {} has unknown status {}", row.id, row.status)))?;

    Ok(BenchmarkUpdateJob {
        id: row.id,
        kind,
        priority,
        status,
        created_at: from_millis(row.created_at),
        scheduled_at: from_millis(row.scheduled_at),
        started_at: row.started_at.map(from_millis),
        completed_at: row.completed_at.map(from_millis),
        error_message: row.error_message,
        retry_count: row.retry_count.max(0) as u32,
        max_retries: row.max_retries.max(0) as u32,
    })
}
