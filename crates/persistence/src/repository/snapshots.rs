//! Peer group snapshot repository: append-only distribution history

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PeerGroupSnapshotRow {
    pub id: Option<i64>,
    pub peer_group_id: String,
    pub member_count: i64,
    pub average_score: f64,
    /// JSON-encoded breakpoints
    pub score_distribution: String,
    pub snapshot_timestamp: i64,
    pub is_active: bool,
}

pub struct SnapshotRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SnapshotRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new active snapshot. Older snapshots stay active until
    /// `deactivate_older_than` runs, so the group is never without one.
    pub async fn insert(&self, snapshot: &PeerGroupSnapshotRow) -> DbResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO peer_group_snapshots
                (peer_group_id, member_count, average_score, score_distribution,
                 snapshot_timestamp, is_active)
               VALUES (?1, ?2, ?3, ?4, ?5, 1)
            "#,
        )
        .bind(&snapshot.peer_group_id)
        .bind(snapshot.member_count)
        .bind(snapshot.average_score)
        .bind(&snapshot.score_distribution)
        .bind(snapshot.snapshot_timestamp)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_latest_active(&self, peer_group_id: &str) -> DbResult<Option<PeerGroupSnapshotRow>> {
        let snapshot = sqlx::query_as::<_, PeerGroupSnapshotRow>(
            r#"SELECT id, peer_group_id, member_count, average_score, score_distribution,
                      snapshot_timestamp, is_active
               FROM peer_group_snapshots
               WHERE peer_group_id = ?1 AND is_active = 1
               ORDER BY snapshot_timestamp DESC, id DESC
               LIMIT 1
            "#,
        )
        .bind(peer_group_id)
        .fetch_optional(self.pool)
        .await?;

        Ok(snapshot)
    }

    /// Deactivate every snapshot of the group except the newest `keep_latest_n`
    pub async fn deactivate_older_than(&self, peer_group_id: &str, keep_latest_n: i64) -> DbResult<u64> {
        let result = sqlx::query(
            r#"UPDATE peer_group_snapshots SET is_active = 0
               WHERE peer_group_id = ?1 AND is_active = 1 AND id NOT IN (
                 SELECT id FROM peer_group_snapshots
                 WHERE peer_group_id = ?1
                 ORDER BY snapshot_timestamp DESC, id DESC
                 LIMIT ?2
               )
            "#,
        )
        .bind(peer_group_id)
        .bind(keep_latest_n)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete inactive snapshots beyond the newest `retain` rows of the group
    pub async fn prune(&self, peer_group_id: &str, retain: i64) -> DbResult<u64> {
        let result = sqlx::query(
            r#"DELETE FROM peer_group_snapshots
               WHERE peer_group_id = ?1 AND is_active = 0 AND id NOT IN (
                 SELECT id FROM peer_group_snapshots
                 WHERE peer_group_id = ?1
                 ORDER BY snapshot_timestamp DESC, id DESC
                 LIMIT ?2
               )
            "#,
        )
        .bind(peer_group_id)
        .bind(retain)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn list_for_group(&self, peer_group_id: &str) -> DbResult<Vec<PeerGroupSnapshotRow>> {
        let snapshots = sqlx::query_as::<_, PeerGroupSnapshotRow>(
            r#"SELECT id, peer_group_id, member_count, average_score, score_distribution,
                      snapshot_timestamp, is_active
               FROM peer_group_snapshots
               WHERE peer_group_id = ?1
               ORDER BY snapshot_timestamp DESC, id DESC
            "#,
        )
        .bind(peer_group_id)
        .fetch_all(self.pool)
        .await?;

        Ok(snapshots)
    }

    /// Number of peer groups with an active snapshot
    pub async fn count_active_groups(&self) -> DbResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT peer_group_id) FROM peer_group_snapshots WHERE is_active = 1",
        )
        .fetch_one(self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn snapshot(group: &str, ts: i64) -> PeerGroupSnapshotRow {
        PeerGroupSnapshotRow {
            id: None,
            peer_group_id: group.to_string(),
            member_count: 10,
            average_score: 500.0,
            score_distribution: "{}".into(),
            snapshot_timestamp: ts,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_single_active_snapshot_after_deactivation() {
        let db = Database::in_memory().await.unwrap();
        let repo = SnapshotRepository::new(db.pool());

        repo.insert(&snapshot("whale", 1)).await.unwrap();
        repo.insert(&snapshot("whale", 2)).await.unwrap();
        let latest = repo.insert(&snapshot("whale", 3)).await.unwrap();
        repo.insert(&snapshot("newcomer", 1)).await.unwrap();

        repo.deactivate_older_than("whale", 1).await.unwrap();

        let active: Vec<_> = repo
            .list_for_group("whale")
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.is_active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, Some(latest));
        // other groups untouched
        assert!(repo.get_latest_active("newcomer").await.unwrap().is_some());
        assert_eq!(repo.count_active_groups().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_prune_keeps_most_recent() {
        let db = Database::in_memory().await.unwrap();
        let repo = SnapshotRepository::new(db.pool());

        for ts in 1..=8 {
            repo.insert(&snapshot("whale", ts)).await.unwrap();
            repo.deactivate_older_than("whale", 1).await.unwrap();
        }
        assert_eq!(repo.prune("whale", 5).await.unwrap(), 3);

        let remaining = repo.list_for_group("whale").await.unwrap();
        assert_eq!(remaining.len(), 5);
        assert_eq!(remaining[0].snapshot_timestamp, 8);
        assert!(remaining[0].is_active);
    }
}
