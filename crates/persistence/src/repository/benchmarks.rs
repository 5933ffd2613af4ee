//! Benchmark records repository: one ranking row per address

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A persisted benchmark (component maps are JSON text)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BenchmarkRecordRow {
    pub address: String,
    pub peer_group_id: String,
    pub overall_score: f64,
    pub overall_percentile: f64,
    pub component_scores: String,
    pub component_percentiles: String,
    pub classification_confidence: f64,
    pub benchmark_timestamp: i64,
    pub last_updated: i64,
    pub update_frequency_seconds: i64,
    pub is_stale: bool,
}

/// Partial update: `None` keeps the stored value
#[derive(Debug, Clone, Default)]
pub struct BenchmarkRecordPatch {
    pub peer_group_id: Option<String>,
    pub overall_score: Option<f64>,
    pub overall_percentile: Option<f64>,
    pub component_scores: Option<String>,
    pub component_percentiles: Option<String>,
    pub classification_confidence: Option<f64>,
    pub benchmark_timestamp: Option<i64>,
    pub last_updated: Option<i64>,
    pub update_frequency_seconds: Option<i64>,
    pub is_stale: Option<bool>,
}

const SELECT_COLUMNS: &str = r#"
    SELECT address, peer_group_id, overall_score, overall_percentile,
           component_scores, component_percentiles, classification_confidence,
           benchmark_timestamp, last_updated, update_frequency_seconds, is_stale
    FROM benchmark_records
"#;

pub struct BenchmarkRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BenchmarkRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the record for an address in a single statement
    pub async fn upsert(&self, record: &BenchmarkRecordRow) -> DbResult<()> {
        sqlx::query(
            r#"INSERT INTO benchmark_records
                (address, peer_group_id, overall_score, overall_percentile,
                 component_scores, component_percentiles, classification_confidence,
                 benchmark_timestamp, last_updated, update_frequency_seconds, is_stale)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
               ON CONFLICT(address) DO UPDATE SET
                 peer_group_id = excluded.peer_group_id,
                 overall_score = excluded.overall_score,
                 overall_percentile = excluded.overall_percentile,
                 component_scores = excluded.component_scores,
                 component_percentiles = excluded.component_percentiles,
                 classification_confidence = excluded.classification_confidence,
                 benchmark_timestamp = excluded.benchmark_timestamp,
                 last_updated = excluded.last_updated,
                 update_frequency_seconds = excluded.update_frequency_seconds,
                 is_stale = excluded.is_stale
            "#,
        )
        .bind(&record.address)
        .bind(&record.peer_group_id)
        .bind(record.overall_score)
        .bind(record.overall_percentile)
        .bind(&record.component_scores)
        .bind(&record.component_percentiles)
        .bind(record.classification_confidence)
        .bind(record.benchmark_timestamp)
        .bind(record.last_updated)
        .bind(record.update_frequency_seconds)
        .bind(record.is_stale)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Merge a patch into an existing record. Returns false when no record exists.
    pub async fn merge(&self, address: &str, patch: &BenchmarkRecordPatch) -> DbResult<bool> {
        let result = sqlx::query(
            r#"UPDATE benchmark_records SET
                 peer_group_id = COALESCE(?1, peer_group_id),
                 overall_score = COALESCE(?2, overall_score),
                 overall_percentile = COALESCE(?3, overall_percentile),
                 component_scores = COALESCE(?4, component_scores),
                 component_percentiles = COALESCE(?5, component_percentiles),
                 classification_confidence = COALESCE(?6, classification_confidence),
                 benchmark_timestamp = COALESCE(?7, benchmark_timestamp),
                 last_updated = COALESCE(?8, last_updated),
                 update_frequency_seconds = COALESCE(?9, update_frequency_seconds),
                 is_stale = COALESCE(?10, is_stale)
               WHERE address = ?11
            "#,
        )
        .bind(&patch.peer_group_id)
        .bind(patch.overall_score)
        .bind(patch.overall_percentile)
        .bind(&patch.component_scores)
        .bind(&patch.component_percentiles)
        .bind(patch.classification_confidence)
        .bind(patch.benchmark_timestamp)
        .bind(patch.last_updated)
        .bind(patch.update_frequency_seconds)
        .bind(patch.is_stale)
        .bind(address)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, address: &str) -> DbResult<Option<BenchmarkRecordRow>> {
        let sql = format!("{SELECT_COLUMNS} WHERE address = ?1");
        let record = sqlx::query_as::<_, BenchmarkRecordRow>(&sql)
            .bind(address)
            .fetch_optional(self.pool)
            .await?;

        Ok(record)
    }

    /// Flag every fresh record last updated before `now_ms - older_than_seconds`.
    /// Returns the number of newly flagged records.
    pub async fn mark_stale(&self, older_than_seconds: i64, now_ms: i64) -> DbResult<u64> {
        let cutoff = now_ms.saturating_sub(older_than_seconds.saturating_mul(1000));
        let result = sqlx::query(
            "UPDATE benchmark_records SET is_stale = 1 WHERE is_stale = 0 AND last_updated < ?1",
        )
        .bind(cutoff)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Stale addresses that have no benchmark job for the current staleness
    /// episode (nothing pending/running, nothing created since the last update).
    pub async fn list_stale(&self, limit: i64) -> DbResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"SELECT r.address FROM benchmark_records r
               WHERE r.is_stale = 1
                 AND NOT EXISTS (
                   SELECT 1 FROM benchmark_jobs j
                   WHERE j.job_type = 'BENCHMARK_UPDATE'
                     AND j.target_address = r.address
                     AND (j.status IN ('PENDING', 'RUNNING') OR j.created_at >= r.last_updated)
                 )
               ORDER BY r.last_updated ASC
               LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().map(|(a,)| a).collect())
    }

    pub async fn list_by_peer_group(&self, peer_group_id: &str) -> DbResult<Vec<BenchmarkRecordRow>> {
        let sql = format!("{SELECT_COLUMNS} WHERE peer_group_id = ?1 ORDER BY overall_score DESC");
        let records = sqlx::query_as::<_, BenchmarkRecordRow>(&sql)
            .bind(peer_group_id)
            .fetch_all(self.pool)
            .await?;

        Ok(records)
    }

    /// Peer groups that currently have at least one member
    pub async fn peer_groups_with_members(&self) -> DbResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT peer_group_id FROM benchmark_records ORDER BY peer_group_id",
        )
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().map(|(g,)| g).collect())
    }

    pub async fn count(&self) -> DbResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM benchmark_records")
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }

    /// Records flagged stale or older than the cutoff
    pub async fn count_stale(&self, stale_threshold_seconds: i64, now_ms: i64) -> DbResult<i64> {
        let cutoff = now_ms.saturating_sub(stale_threshold_seconds.saturating_mul(1000));
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM benchmark_records WHERE is_stale = 1 OR last_updated < ?1",
        )
        .bind(cutoff)
        .fetch_one(self.pool)
        .await?;
        Ok(count)
    }

    pub async fn latest_update(&self) -> DbResult<Option<i64>> {
        let (latest,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(last_updated) FROM benchmark_records")
                .fetch_one(self.pool)
                .await?;
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn row(address: &str, group: &str, last_updated: i64) -> BenchmarkRecordRow {
        BenchmarkRecordRow {
            address: address.to_string(),
            peer_group_id: group.to_string(),
            overall_score: 600.0,
            overall_percentile: 55.0,
            component_scores: "{}".into(),
            component_percentiles: "{}".into(),
            classification_confidence: 70.0,
            benchmark_timestamp: last_updated,
            last_updated,
            update_frequency_seconds: 300,
            is_stale: false,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_row() {
        let db = Database::in_memory().await.unwrap();
        let repo = BenchmarkRepository::new(db.pool());

        repo.upsert(&row("0xa", "newcomer", 1_000)).await.unwrap();
        let mut updated = row("0xa", "active_trader", 2_000);
        updated.overall_percentile = 80.0;
        repo.upsert(&updated).await.unwrap();

        let stored = repo.get("0xa").await.unwrap().unwrap();
        assert_eq!(stored, updated);
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_merge_keeps_unpatched_columns() {
        let db = Database::in_memory().await.unwrap();
        let repo = BenchmarkRepository::new(db.pool());

        assert!(!repo
            .merge("0xmissing", &BenchmarkRecordPatch::default())
            .await
            .unwrap());

        repo.upsert(&row("0xa", "newcomer", 1_000)).await.unwrap();
        let patch = BenchmarkRecordPatch {
            overall_percentile: Some(91.0),
            is_stale: Some(true),
            ..Default::default()
        };
        assert!(repo.merge("0xa", &patch).await.unwrap());

        let stored = repo.get("0xa").await.unwrap().unwrap();
        assert_eq!(stored.overall_percentile, 91.0);
        assert!(stored.is_stale);
        assert_eq!(stored.peer_group_id, "newcomer");
        assert_eq!(stored.last_updated, 1_000);
    }

    #[tokio::test]
    async fn test_mark_stale_only_flags_old_records() {
        let db = Database::in_memory().await.unwrap();
        let repo = BenchmarkRepository::new(db.pool());
        let now = 10_000_000;

        repo.upsert(&row("0xold", "newcomer", now - 1_000_000)).await.unwrap();
        repo.upsert(&row("0xnew", "newcomer", now - 1_000)).await.unwrap();

        assert_eq!(repo.mark_stale(900, now).await.unwrap(), 1);
        // already flagged rows are not counted twice
        assert_eq!(repo.mark_stale(900, now).await.unwrap(), 0);
        assert_eq!(repo.list_stale(10).await.unwrap(), vec!["0xold".to_string()]);
        assert_eq!(repo.count_stale(900, now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_stale_skips_addresses_with_scheduled_job() {
        let db = Database::in_memory().await.unwrap();
        let repo = BenchmarkRepository::new(db.pool());

        let mut stale = row("0xa", "newcomer", 1_000);
        stale.is_stale = true;
        repo.upsert(&stale).await.unwrap();

        sqlx::query(
            "INSERT INTO benchmark_jobs (job_type, target_address, priority, status, created_at, scheduled_at)
             VALUES ('BENCHMARK_UPDATE', '0xa', 'LOW', 'PENDING', 2000, 2000)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        assert!(repo.list_stale(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_huge_threshold_flags_nothing() {
        let db = Database::in_memory().await.unwrap();
        let repo = BenchmarkRepository::new(db.pool());
        repo.upsert(&row("0xa", "newcomer", 1_000)).await.unwrap();

        assert_eq!(repo.mark_stale(i64::MAX, 10_000_000).await.unwrap(), 0);
        assert_eq!(repo.count_stale(i64::MAX, 10_000_000).await.unwrap(), 0);
    }
}
