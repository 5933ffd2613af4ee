//! Benchmark service: read path, recomputation and peer group maintenance
//!
//! Reads serve the stored record when it is fresh. A miss computes
//! synchronously; a stale record is recomputed in place unless a refresh
//! for the address is already underway, in which case the last-known
//! record is returned as is.

use crate::catalog::{PeerGroupCatalog, PeerGroupDefinition};
use crate::classifier::{PeerGroupClassification, PeerGroupClassifier};
use crate::config::SharedConfig;
use crate::error::{BenchmarkError, BenchmarkResult};
use crate::jobs::{JobKind, JobPriority, JobQueue};
use crate::provider::ScoreProvider;
use crate::ranking::{ranking_basis, PercentileRankingEngine};
use crate::store::{BenchmarkPatch, BenchmarkStore};
use crate::types::{
    from_millis, AddressMetrics, BenchmarkRecord, BenchmarkView, PeerGroupSnapshot, ScoreInputs, ScoreRange,
    TransactionSummary,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

const MAX_ADDRESS_LEN: usize = 128;
/// Below this many members a peer group keeps its nominal distribution
const MIN_EMPIRICAL_MEMBERS: usize = 20;

/// Reject malformed addresses before they reach classification or the job queue
pub fn validate_address(address: &str) -> BenchmarkResult<()> {
    if address.is_empty() {
        return Err(BenchmarkError::Validation("address is empty".into()));
    }
    if address.len() > MAX_ADDRESS_LEN {
        return Err(BenchmarkError::Validation(format!(
            "address longer than {MAX_ADDRESS_LEN} characters"
        )));
    }
    if let Some(c) = address
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.')))
    {
        return Err(BenchmarkError::Validation(format!(
            "address contains invalid character {c:?}"
        )));
    }
    Ok(())
}

/// Flagged stale, or older than the threshold
pub fn is_stale(record: &BenchmarkRecord, stale_threshold_seconds: u64, now: DateTime<Utc>) -> bool {
    record.is_stale
        || now.signed_duration_since(record.last_updated) > Duration::seconds(stale_threshold_seconds as i64)
}

/// Result of a job-driven address refresh
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Refreshed(BenchmarkRecord),
    /// Someone recomputed the address after the job was requested
    AlreadyFresh(BenchmarkRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreUpdateOutcome {
    /// Percentile the new score implies within its (re)classified group
    pub implied_percentile: Option<f64>,
    pub percentile_shift: Option<f64>,
    /// MEDIUM refresh created for a significant shift
    pub job_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerGroupRefresh {
    pub snapshot: PeerGroupSnapshot,
    pub recalculated: usize,
}

/// Per-address refresh marker shared by the read path and the job executor.
///
/// Entries hold weak references so the map never outlives the refreshes.
#[derive(Default)]
struct InFlightRefreshes {
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl InFlightRefreshes {
    async fn acquire(&self, address: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(address).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    locks.insert(address.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    fn is_busy(&self, address: &str) -> bool {
        self.locks
            .lock()
            .unwrap()
            .get(address)
            .map_or(false, |weak| weak.strong_count() > 0)
    }
}

pub struct BenchmarkService {
    store: BenchmarkStore,
    jobs: JobQueue,
    provider: Arc<dyn ScoreProvider>,
    config: SharedConfig,
    catalog: &'static PeerGroupCatalog,
    ranking: PercentileRankingEngine,
    in_flight: InFlightRefreshes,
}

impl BenchmarkService {
    pub fn new(
        store: BenchmarkStore,
        provider: Arc<dyn ScoreProvider>,
        config: SharedConfig,
        catalog: &'static PeerGroupCatalog,
    ) -> Self {
        Self {
            jobs: JobQueue::new(store.clone()),
            store,
            provider,
            config,
            catalog,
            ranking: PercentileRankingEngine::new(),
            in_flight: InFlightRefreshes::default(),
        }
    }

    pub fn store(&self) -> &BenchmarkStore {
        &self.store
    }

    pub fn catalog(&self) -> &'static PeerGroupCatalog {
        self.catalog
    }

    fn stale_threshold(&self) -> u64 {
        self.config.read().unwrap().stale_threshold_seconds
    }

    /// Record for `address`, computing it when missing or stale.
    ///
    /// Only a first-ever computation surfaces a compute error; a stale
    /// record is preferred over failing.
    pub async fn get_or_refresh(&self, address: &str) -> BenchmarkResult<BenchmarkRecord> {
        validate_address(address)?;

        let Some(mut record) = self.store.get_benchmark_record(address).await? else {
            return self.refresh_now(address).await;
        };

        if !is_stale(&record, self.stale_threshold(), Utc::now()) {
            return Ok(record);
        }
        record.is_stale = true;

        let pending = JobKind::BenchmarkUpdate {
            address: address.to_string(),
        };
        if self.in_flight.is_busy(address) || self.store.has_active_job(&pending).await? {
            debug!(address, "Serving stale benchmark, refresh already underway");
            return Ok(record);
        }

        match self.refresh_now(address).await {
            Ok(fresh) => Ok(fresh),
            Err(BenchmarkError::TransientCompute(reason)) => {
                warn!(address, error = %reason, "Synchronous refresh failed, serving stale benchmark");
                let max_retries = self.config.read().unwrap().max_retries;
                self.jobs
                    .create(pending, JobPriority::Low, Duration::zero(), max_retries)
                    .await?;
                Ok(record)
            }
            Err(e) => Err(e),
        }
    }

    /// API read model
    pub async fn get_benchmark(&self, address: &str) -> BenchmarkResult<BenchmarkView> {
        let record = self.get_or_refresh(address).await?;
        let stale = is_stale(&record, self.stale_threshold(), Utc::now());
        Ok(BenchmarkView {
            peer_group_id: record.peer_group_id,
            overall_percentile: record.overall_percentile,
            component_percentiles: record.component_percentiles,
            is_stale: stale,
            last_updated: record.last_updated,
        })
    }

    async fn refresh_now(&self, address: &str) -> BenchmarkResult<BenchmarkRecord> {
        let _marker = self.in_flight.acquire(address).await;

        // A concurrent reader may have finished while we waited
        if let Some(record) = self.store.get_benchmark_record(address).await? {
            if !is_stale(&record, self.stale_threshold(), Utc::now()) {
                return Ok(record);
            }
        }

        let inputs = self.provider.fetch_inputs(address).await?;
        self.compute_and_store(address, &inputs).await
    }

    /// BENCHMARK_UPDATE execution. Skips the recomputation when the record
    /// was refreshed after `requested_at`.
    pub async fn refresh_address(
        &self,
        address: &str,
        requested_at: DateTime<Utc>,
    ) -> BenchmarkResult<RefreshOutcome> {
        validate_address(address)?;
        let _marker = self.in_flight.acquire(address).await;

        if let Some(record) = self.store.get_benchmark_record(address).await? {
            if !record.is_stale && record.last_updated > requested_at {
                debug!(address, "Benchmark refreshed since the job was created, skipping");
                return Ok(RefreshOutcome::AlreadyFresh(record));
            }
        }

        let inputs = self.provider.fetch_inputs(address).await?;
        let record = self.compute_and_store(address, &inputs).await?;
        Ok(RefreshOutcome::Refreshed(record))
    }

    async fn compute_and_store(&self, address: &str, inputs: &ScoreInputs) -> BenchmarkResult<BenchmarkRecord> {
        let classification = PeerGroupClassifier::new(self.catalog).classify(
            address,
            &inputs.metrics,
            Some(&inputs.transactions),
        );
        let basis = self.basis(&classification.primary_peer_group).await?;

        // Stored at millisecond precision; keep the returned record identical
        let now = from_millis(Utc::now().timestamp_millis());
        let overall = self.ranking.rank(inputs.breakdown.score, &basis);
        let components = self
            .ranking
            .rank_components(&inputs.breakdown.components, &basis)
            .into_iter()
            .map(|(name, ranking)| (name, ranking.percentile))
            .collect();

        let record = BenchmarkRecord {
            address: address.to_string(),
            peer_group_id: classification.primary_peer_group,
            overall_score: inputs.breakdown.score,
            overall_percentile: overall.percentile,
            component_scores: inputs.breakdown.components.clone(),
            component_percentiles: components,
            classification_confidence: classification.classification_confidence,
            benchmark_timestamp: now,
            last_updated: now,
            update_frequency_seconds: self.config.read().unwrap().update_frequency_seconds,
            is_stale: false,
        };
        self.store.upsert_benchmark_record(&record).await?;

        info!(
            address,
            peer_group = %record.peer_group_id,
            percentile = record.overall_percentile,
            category = ?overall.category,
            "Benchmark computed"
        );
        Ok(record)
    }

    /// Group definition with the active snapshot's distribution overlaid
    pub async fn basis(&self, peer_group_id: &str) -> BenchmarkResult<PeerGroupDefinition> {
        let group = self
            .catalog
            .get(peer_group_id)
            .ok_or_else(|| BenchmarkError::NotFound(format!("peer group {peer_group_id}")))?;
        let snapshot = self.store.get_latest_active_snapshot(peer_group_id).await?;
        Ok(ranking_basis(group, snapshot.as_ref()))
    }

    /// Merge-upsert. Creating a record requires every field of the patch,
    /// and no timestamp may lie in the future.
    pub async fn update(&self, address: &str, patch: BenchmarkPatch) -> BenchmarkResult<BenchmarkRecord> {
        validate_address(address)?;
        let now = Utc::now();
        for (field, value) in [
            ("lastUpdated", patch.last_updated),
            ("benchmarkTimestamp", patch.benchmark_timestamp),
        ] {
            if value.is_some_and(|t| t > now) {
                return Err(BenchmarkError::Validation(format!("{field} is in the future")));
            }
        }
        if !self.store.update_benchmark_record(address, &patch).await? {
            let record = patch.into_record(address).ok_or_else(|| {
                BenchmarkError::Validation(format!(
                    "no benchmark for {address}; a new record needs every field"
                ))
            })?;
            self.store.upsert_benchmark_record(&record).await?;
        }
        self.store
            .get_benchmark_record(address)
            .await?
            .ok_or_else(|| BenchmarkError::NotFound(format!("benchmark for {address}")))
    }

    pub fn classify(
        &self,
        address: &str,
        metrics: &AddressMetrics,
        transactions: Option<&[TransactionSummary]>,
    ) -> BenchmarkResult<PeerGroupClassification> {
        validate_address(address)?;
        Ok(PeerGroupClassifier::new(self.catalog).classify(address, metrics, transactions))
    }

    /// Store new upstream inputs; schedule a MEDIUM refresh when the implied
    /// percentile moved by more than the configured shift.
    pub async fn record_score_update(&self, address: &str, inputs: &ScoreInputs) -> BenchmarkResult<ScoreUpdateOutcome> {
        validate_address(address)?;
        self.store.save_inputs(address, inputs).await?;

        let Some(record) = self.store.get_benchmark_record(address).await? else {
            // First read computes from the stored inputs
            return Ok(ScoreUpdateOutcome {
                implied_percentile: None,
                percentile_shift: None,
                job_id: None,
            });
        };

        let classification = PeerGroupClassifier::new(self.catalog).classify(
            address,
            &inputs.metrics,
            Some(&inputs.transactions),
        );
        let basis = self.basis(&classification.primary_peer_group).await?;
        let implied = self.ranking.rank(inputs.breakdown.score, &basis).percentile;
        let shift = (implied - record.overall_percentile).abs();

        let (threshold, max_retries) = {
            let config = self.config.read().unwrap();
            (config.priority_thresholds.significant_percentile_shift, config.max_retries)
        };
        let group_changed = classification.primary_peer_group != record.peer_group_id;

        let mut job_id = None;
        if group_changed || shift > threshold {
            let kind = JobKind::BenchmarkUpdate {
                address: address.to_string(),
            };
            if self.store.has_active_job(&kind).await? {
                debug!(address, shift, "Significant shift, refresh already queued");
            } else {
                let id = self
                    .jobs
                    .create(kind, JobPriority::Medium, Duration::zero(), max_retries)
                    .await?;
                info!(address, shift, group_changed, job_id = id, "Significant percentile shift, refresh scheduled");
                job_id = Some(id);
            }
        }

        Ok(ScoreUpdateOutcome {
            implied_percentile: Some(implied),
            percentile_shift: Some(shift),
            job_id,
        })
    }

    /// PERCENTILE_RECALC execution: re-rank every stored member against the current basis
    pub async fn recalc_peer_group(&self, peer_group_id: &str) -> BenchmarkResult<usize> {
        let basis = self.basis(peer_group_id).await?;
        let records = self.store.list_peer_group_records(peer_group_id).await?;

        for record in &records {
            let components: BTreeMap<String, f64> = self
                .ranking
                .rank_components(&record.component_scores, &basis)
                .into_iter()
                .map(|(name, ranking)| (name, ranking.percentile))
                .collect();
            let patch = BenchmarkPatch {
                overall_percentile: Some(self.ranking.rank(record.overall_score, &basis).percentile),
                component_percentiles: Some(components),
                ..Default::default()
            };
            self.store
                .update_benchmark_record(&record.address, &patch)
                .await?;
        }

        debug!(peer_group = peer_group_id, count = records.len(), "Percentiles recalculated");
        Ok(records.len())
    }

    /// PEER_GROUP_REFRESH execution: new active snapshot, rotation, then a recalc
    pub async fn refresh_peer_group(&self, peer_group_id: &str) -> BenchmarkResult<PeerGroupRefresh> {
        let group = self
            .catalog
            .get(peer_group_id)
            .ok_or_else(|| BenchmarkError::NotFound(format!("peer group {peer_group_id}")))?;
        let records = self.store.list_peer_group_records(peer_group_id).await?;
        let scores: Vec<f64> = records.iter().map(|r| r.overall_score).collect();

        let mut snapshot = build_snapshot(group, &scores, Utc::now());
        let id = self.store.insert_peer_group_snapshot(&snapshot).await?;
        snapshot.id = Some(id);

        // Insert first, then deactivate: the group always has an active snapshot
        let retention = self.config.read().unwrap().snapshot_retention;
        self.store.deactivate_older_than(peer_group_id, 1).await?;
        let pruned = self.store.prune_snapshots(peer_group_id, retention).await?;

        info!(
            peer_group = peer_group_id,
            snapshot_id = id,
            members = snapshot.member_count,
            pruned,
            "Peer group snapshot inserted"
        );

        let recalculated = self.recalc_peer_group(peer_group_id).await?;
        Ok(PeerGroupRefresh { snapshot, recalculated })
    }
}

/// Empirical distribution once the group has enough members, nominal otherwise
fn build_snapshot(group: &PeerGroupDefinition, scores: &[f64], now: DateTime<Utc>) -> PeerGroupSnapshot {
    let empirical = (scores.len() >= MIN_EMPIRICAL_MEMBERS)
        .then(|| ScoreRange::from_scores(scores))
        .flatten();

    let (member_count, average_score, score_distribution) = match empirical {
        Some(range) => (
            scores.len() as u64,
            scores.iter().sum::<f64>() / scores.len() as f64,
            range,
        ),
        None => (group.member_count, group.average_score, group.score_range),
    };

    PeerGroupSnapshot {
        id: None,
        peer_group_id: group.id.clone(),
        member_count,
        average_score,
        score_distribution,
        snapshot_timestamp: now,
        is_active: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::catalog;
    use crate::config::SchedulerConfig;
    use crate::jobs::JobStatus;
    use crate::provider::testing::{inputs, FixedProvider};
    use persistence::Database;
    use rust_decimal_macros::dec;

    async fn service(provider: Arc<FixedProvider>) -> (Database, BenchmarkService) {
        let db = Database::in_memory().await.unwrap();
        let service = BenchmarkService::new(
            BenchmarkStore::new(db.pool_clone()),
            provider,
            SchedulerConfig::default().shared(),
            catalog(),
        );
        (db, service)
    }

    fn aged(mut record: BenchmarkRecord, seconds: i64) -> BenchmarkRecord {
        record.last_updated = Utc::now() - Duration::seconds(seconds);
        record.benchmark_timestamp = record.last_updated;
        record
    }

    #[test]
    fn test_validate_address() {
        assert!(validate_address("0xAbC123").is_ok());
        assert!(validate_address("eth:0xabc_1-2.3").is_ok());
        assert!(validate_address("").is_err());
        assert!(validate_address("0xabc def").is_err());
        assert!(validate_address("0x'; DROP").is_err());
        assert!(validate_address(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_staleness_threshold() {
        let record = BenchmarkRecord {
            address: "0xabc".into(),
            peer_group_id: "newcomer".into(),
            overall_score: 300.0,
            overall_percentile: 40.0,
            component_scores: BTreeMap::new(),
            component_percentiles: BTreeMap::new(),
            classification_confidence: 30.0,
            benchmark_timestamp: Utc::now(),
            last_updated: Utc::now(),
            update_frequency_seconds: 300,
            is_stale: false,
        };
        let record = aged(record, 1000);
        let now = Utc::now();
        assert!(is_stale(&record, 900, now));
        assert!(!is_stale(&record, 1100, now));

        let flagged = BenchmarkRecord {
            is_stale: true,
            ..record
        };
        assert!(is_stale(&flagged, 1100, now));
    }

    #[tokio::test]
    async fn test_first_read_computes_end_to_end() {
        let provider = Arc::new(FixedProvider::default());
        provider.set("0xabc", inputs(400.0, 250, dec!(150), 700.0));
        let (_db, service) = service(provider.clone()).await;

        let view = service.get_benchmark("0xabc").await.unwrap();
        assert_eq!(view.peer_group_id, "active_trader");
        assert!((50.0..=75.0).contains(&view.overall_percentile));
        assert!(!view.is_stale);
        assert!(view.component_percentiles.contains_key("activity"));

        let record = service.store().get_benchmark_record("0xabc").await.unwrap().unwrap();
        assert!(record.classification_confidence >= 60.0);
        assert_eq!(record.overall_score, 700.0);

        // Fresh record is served without another fetch
        service.get_benchmark("0xabc").await.unwrap();
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_first_read_failure_propagates() {
        let provider = Arc::new(FixedProvider::default());
        let (_db, service) = service(provider).await;
        let err = service.get_benchmark("0xunknown").await.unwrap_err();
        assert!(matches!(err, BenchmarkError::TransientCompute(_)));
        assert!(matches!(
            service.get_benchmark("bad address").await,
            Err(BenchmarkError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_read_recomputes() {
        let provider = Arc::new(FixedProvider::default());
        provider.set("0xabc", inputs(400.0, 250, dec!(150), 700.0));
        let (_db, service) = service(provider.clone()).await;

        let record = service.get_or_refresh("0xabc").await.unwrap();
        service
            .store()
            .upsert_benchmark_record(&aged(record, 7200))
            .await
            .unwrap();

        let fresh = service.get_or_refresh("0xabc").await.unwrap();
        assert!(!fresh.is_stale);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_stale_read_with_queued_job_returns_last_known() {
        let provider = Arc::new(FixedProvider::default());
        provider.set("0xabc", inputs(400.0, 250, dec!(150), 700.0));
        let (_db, service) = service(provider.clone()).await;

        let record = service.get_or_refresh("0xabc").await.unwrap();
        service
            .store()
            .upsert_benchmark_record(&aged(record, 7200))
            .await
            .unwrap();
        service
            .jobs
            .create(
                JobKind::BenchmarkUpdate {
                    address: "0xabc".into(),
                },
                JobPriority::Low,
                Duration::zero(),
                3,
            )
            .await
            .unwrap();

        let view = service.get_benchmark("0xabc").await.unwrap();
        assert!(view.is_stale);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_read_survives_compute_failure() {
        let provider = Arc::new(FixedProvider::default());
        provider.set("0xabc", inputs(400.0, 250, dec!(150), 700.0));
        let (_db, service) = service(provider.clone()).await;

        let record = service.get_or_refresh("0xabc").await.unwrap();
        service
            .store()
            .upsert_benchmark_record(&aged(record, 7200))
            .await
            .unwrap();
        provider.set_failing(true);

        let served = service.get_or_refresh("0xabc").await.unwrap();
        assert!(served.is_stale);

        let pending = service.store().list_jobs(Some(JobStatus::Pending), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].priority, JobPriority::Low);
    }

    #[tokio::test]
    async fn test_concurrent_misses_compute_once() {
        let provider = Arc::new(FixedProvider::with_delay(std::time::Duration::from_millis(30)));
        provider.set("0xabc", inputs(400.0, 250, dec!(150), 700.0));
        let (_db, service) = service(provider.clone()).await;

        let (a, b) = tokio::join!(service.get_or_refresh("0xabc"), service.get_or_refresh("0xabc"));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_job_refresh_skips_when_already_fresh() {
        let provider = Arc::new(FixedProvider::default());
        provider.set("0xabc", inputs(400.0, 250, dec!(150), 700.0));
        let (_db, service) = service(provider.clone()).await;

        let requested_at = Utc::now() - Duration::seconds(5);
        service.get_or_refresh("0xabc").await.unwrap();

        let outcome = service.refresh_address("0xabc", requested_at).await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::AlreadyFresh(_)));
        assert_eq!(provider.calls(), 1);

        let outcome = service
            .refresh_address("0xabc", Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert!(matches!(outcome, RefreshOutcome::Refreshed(_)));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_update_merges_or_requires_full_record() {
        let provider = Arc::new(FixedProvider::default());
        provider.set("0xabc", inputs(400.0, 250, dec!(150), 700.0));
        let (_db, service) = service(provider).await;

        let partial = BenchmarkPatch {
            overall_percentile: Some(12.0),
            ..Default::default()
        };
        assert!(matches!(
            service.update("0xnew", partial.clone()).await,
            Err(BenchmarkError::Validation(_))
        ));

        service.get_or_refresh("0xabc").await.unwrap();
        let merged = service.update("0xabc", partial).await.unwrap();
        assert_eq!(merged.overall_percentile, 12.0);
        assert_eq!(merged.peer_group_id, "active_trader");
    }

    #[tokio::test]
    async fn test_update_rejects_future_timestamps() {
        let provider = Arc::new(FixedProvider::default());
        provider.set("0xabc", inputs(400.0, 250, dec!(150), 700.0));
        let (_db, service) = service(provider).await;
        let before = service.get_or_refresh("0xabc").await.unwrap();

        let tomorrow = Utc::now() + Duration::days(1);
        for patch in [
            BenchmarkPatch {
                last_updated: Some(tomorrow),
                ..Default::default()
            },
            BenchmarkPatch {
                benchmark_timestamp: Some(tomorrow),
                ..Default::default()
            },
        ] {
            assert!(matches!(
                service.update("0xabc", patch).await,
                Err(BenchmarkError::Validation(_))
            ));
        }
        assert_eq!(service.store().get_benchmark_record("0xabc").await.unwrap(), Some(before));

        let past = BenchmarkPatch {
            last_updated: Some(Utc::now() - Duration::hours(2)),
            ..Default::default()
        };
        let merged = service.update("0xabc", past).await.unwrap();
        assert!(is_stale(&merged, 3600, Utc::now()));
    }

    #[tokio::test]
    async fn test_significant_shift_schedules_medium_job() {
        let provider = Arc::new(FixedProvider::default());
        provider.set("0xabc", inputs(400.0, 250, dec!(150), 700.0));
        let (_db, service) = service(provider).await;
        service.get_or_refresh("0xabc").await.unwrap();

        let small = service
            .record_score_update("0xabc", &inputs(400.0, 250, dec!(150), 705.0))
            .await
            .unwrap();
        assert!(small.percentile_shift.unwrap() <= 5.0);
        assert_eq!(small.job_id, None);

        let big = service
            .record_score_update("0xabc", &inputs(400.0, 250, dec!(150), 900.0))
            .await
            .unwrap();
        assert!(big.percentile_shift.unwrap() > 5.0);
        let job = service.jobs.get(big.job_id.unwrap()).await.unwrap();
        assert_eq!(job.priority, JobPriority::Medium);

        // Already queued: no duplicate
        let again = service
            .record_score_update("0xabc", &inputs(400.0, 250, dec!(150), 950.0))
            .await
            .unwrap();
        assert_eq!(again.job_id, None);
    }

    #[tokio::test]
    async fn test_peer_group_refresh_rotates_snapshots() {
        let provider = Arc::new(FixedProvider::default());
        for i in 0..25 {
            provider.set(&format!("0x{i}"), inputs(400.0, 250, dec!(150), 400.0 + i as f64 * 20.0));
        }
        let (_db, service) = service(provider).await;

        service.get_or_refresh("0x0").await.unwrap();
        let nominal = service.refresh_peer_group("active_trader").await.unwrap();
        assert_eq!(nominal.snapshot.member_count, catalog().get("active_trader").unwrap().member_count);

        for i in 1..25 {
            service.get_or_refresh(&format!("0x{i}")).await.unwrap();
        }
        let empirical = service.refresh_peer_group("active_trader").await.unwrap();
        assert_eq!(empirical.snapshot.member_count, 25);
        assert_eq!(empirical.snapshot.score_distribution.min, 400.0);
        assert_eq!(empirical.snapshot.score_distribution.max, 880.0);
        assert_eq!(empirical.recalculated, 25);

        let snapshots = service.store().list_snapshots("active_trader").await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots.iter().filter(|s| s.is_active).count(), 1);

        let basis = service.basis("active_trader").await.unwrap();
        assert_eq!(basis.member_count, 25);
    }

    #[tokio::test]
    async fn test_unknown_peer_group_is_not_found() {
        let (_db, service) = service(Arc::new(FixedProvider::default())).await;
        assert!(matches!(
            service.refresh_peer_group("nope").await,
            Err(BenchmarkError::NotFound(_))
        ));
    }
}
