//! Refresh scheduler: the timer-driven background pipeline
//!
//! One tick: reap stuck jobs, sweep staleness, enqueue LOW refreshes for
//! newly-stale addresses and outdated peer group snapshots, then dequeue a
//! batch and execute it. Jobs aimed at the same address or peer group
//! share one execution. A tick never overlaps another one.

use crate::benchmark::{BenchmarkService, RefreshOutcome, ScoreUpdateOutcome};
use crate::catalog::catalog;
use crate::config::{SchedulerConfig, SchedulerConfigUpdate, SharedConfig};
use crate::error::{BenchmarkError, BenchmarkResult};
use crate::jobs::{BenchmarkUpdateJob, FailureOutcome, JobKind, JobPriority, JobQueue, JobStatus};
use crate::provider::{ScoreProvider, StoredInputsProvider};
use crate::store::BenchmarkStore;
use crate::types::{BenchmarkView, ScoreInputs};
use chrono::{DateTime, Duration, Utc};
use persistence::SqlitePool;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerStatus {
    Idle,
    Running,
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reaped: usize,
    pub marked_stale: u64,
    pub updates_enqueued: usize,
    pub snapshot_refreshes_enqueued: usize,
    pub dequeued: usize,
    /// Distinct executions serving the dequeued jobs
    pub executions: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
}

impl TickReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            reaped: 0,
            marked_stale: 0,
            updates_enqueued: 0,
            snapshot_refreshes_enqueued: 0,
            dequeued: 0,
            executions: 0,
            completed: 0,
            requeued: 0,
            failed: 0,
        }
    }

    /// True when the tick neither created nor ran anything
    pub fn is_quiet(&self) -> bool {
        self.reaped == 0
            && self.marked_stale == 0
            && self.updates_enqueued == 0
            && self.snapshot_refreshes_enqueued == 0
            && self.dequeued == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    Ran(TickReport),
    /// A previous tick was still in progress
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub total_benchmarks: u64,
    pub stale_count: u64,
    pub pending_jobs: u64,
    pub running_jobs: u64,
    pub failed_jobs: u64,
    pub active_peer_group_count: u64,
    /// Most recent benchmark refresh
    pub last_update_time: Option<DateTime<Utc>>,
    pub last_tick_at: Option<DateTime<Utc>>,
}

/// Claim on the tick-in-progress flag, released on drop
struct TickGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> TickGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Subject a batch of jobs is grouped by
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Target {
    Address(String),
    PeerGroup(String),
}

impl Target {
    fn of(kind: &JobKind) -> Self {
        match kind {
            JobKind::BenchmarkUpdate { address } => Self::Address(address.clone()),
            JobKind::PeerGroupRefresh { peer_group_id } | JobKind::PercentileRecalc { peer_group_id } => {
                Self::PeerGroup(peer_group_id.clone())
            }
        }
    }
}

/// Group jobs by target, keeping the dequeue order of each target's first job
fn group_batch(jobs: Vec<BenchmarkUpdateJob>) -> Vec<(Target, Vec<BenchmarkUpdateJob>)> {
    let mut groups: Vec<(Target, Vec<BenchmarkUpdateJob>)> = Vec::new();
    let mut index: HashMap<Target, usize> = HashMap::new();

    for job in jobs {
        let target = Target::of(&job.kind);
        match index.get(&target) {
            Some(&i) => groups[i].1.push(job),
            None => {
                index.insert(target.clone(), groups.len());
                groups.push((target, vec![job]));
            }
        }
    }

    groups
}

// ---------------------------------------------------------------------------
// Scheduler handle
// ---------------------------------------------------------------------------

/// Explicit scheduler handle: constructed once, shared via `Arc`
pub struct RefreshScheduler {
    service: BenchmarkService,
    jobs: JobQueue,
    config: SharedConfig,
    tick_in_progress: AtomicBool,
    cancelled: AtomicBool,
    status: RwLock<SchedulerStatus>,
    last_tick: RwLock<Option<TickReport>>,
}

impl RefreshScheduler {
    pub fn new(
        pool: SqlitePool,
        provider: Arc<dyn ScoreProvider>,
        config: SchedulerConfig,
    ) -> BenchmarkResult<Self> {
        config.validate()?;
        let store = BenchmarkStore::new(pool);
        let config = config.shared();

        Ok(Self {
            service: BenchmarkService::new(store.clone(), provider, Arc::clone(&config), catalog()),
            jobs: JobQueue::new(store),
            config,
            tick_in_progress: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            status: RwLock::new(SchedulerStatus::Idle),
            last_tick: RwLock::new(None),
        })
    }

    /// Scheduler fed by the inputs stored through `record_score_update`
    pub fn with_stored_inputs(pool: SqlitePool, config: SchedulerConfig) -> BenchmarkResult<Self> {
        let provider = Arc::new(StoredInputsProvider::new(BenchmarkStore::new(pool.clone())));
        Self::new(pool, provider, config)
    }

    pub fn service(&self) -> &BenchmarkService {
        &self.service
    }

    pub async fn get_benchmark(&self, address: &str) -> BenchmarkResult<BenchmarkView> {
        self.service.get_benchmark(address).await
    }

    /// Explicit refresh request for an address
    pub async fn schedule_update(&self, address: &str, priority: JobPriority, delay_ms: u64) -> BenchmarkResult<i64> {
        crate::benchmark::validate_address(address)?;
        let delay = i64::try_from(delay_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .ok_or_else(|| BenchmarkError::Validation(format!("delayMs {delay_ms} is out of range")))?;
        let max_retries = self.config.read().unwrap().max_retries;
        self.jobs
            .create(
                JobKind::BenchmarkUpdate {
                    address: address.to_string(),
                },
                priority,
                delay,
                max_retries,
            )
            .await
    }

    pub async fn schedule_peer_group_refresh(&self, peer_group_id: &str, priority: JobPriority) -> BenchmarkResult<i64> {
        self.schedule_peer_group_job(
            JobKind::PeerGroupRefresh {
                peer_group_id: peer_group_id.to_string(),
            },
            priority,
        )
        .await
    }

    /// Re-rank the group's stored records against its current basis
    pub async fn schedule_percentile_recalc(&self, peer_group_id: &str, priority: JobPriority) -> BenchmarkResult<i64> {
        self.schedule_peer_group_job(
            JobKind::PercentileRecalc {
                peer_group_id: peer_group_id.to_string(),
            },
            priority,
        )
        .await
    }

    async fn schedule_peer_group_job(&self, kind: JobKind, priority: JobPriority) -> BenchmarkResult<i64> {
        let peer_group_id = kind.peer_group_id().unwrap_or_default();
        if self.service.catalog().get(peer_group_id).is_none() {
            return Err(BenchmarkError::NotFound(format!("peer group {peer_group_id}")));
        }
        let max_retries = self.config.read().unwrap().max_retries;
        self.jobs.create(kind, priority, Duration::zero(), max_retries).await
    }

    pub async fn record_score_update(&self, address: &str, inputs: &ScoreInputs) -> BenchmarkResult<ScoreUpdateOutcome> {
        self.service.record_score_update(address, inputs).await
    }

    pub async fn get_stats(&self) -> BenchmarkResult<SchedulerStats> {
        let store = self.service.store();
        let stale_threshold = self.config.read().unwrap().stale_threshold_seconds;

        Ok(SchedulerStats {
            total_benchmarks: store.count_benchmarks().await?,
            stale_count: store.count_stale(stale_threshold).await?,
            pending_jobs: store.count_jobs(JobStatus::Pending).await?,
            running_jobs: store.count_jobs(JobStatus::Running).await?,
            failed_jobs: store.count_jobs(JobStatus::Failed).await?,
            active_peer_group_count: store.count_active_peer_groups().await?,
            last_update_time: store.latest_update().await?,
            last_tick_at: self.last_tick().map(|t| t.finished_at),
        })
    }

    pub fn get_config(&self) -> SchedulerConfig {
        self.config.read().unwrap().clone()
    }

    /// Apply a partial update; on error the active config is unchanged
    pub fn update_config(&self, update: &SchedulerConfigUpdate) -> BenchmarkResult<SchedulerConfig> {
        let mut config = self.config.write().unwrap();
        let next = config.merged(update)?;
        *config = next.clone();
        info!(
            update_frequency_seconds = next.update_frequency_seconds,
            stale_threshold_seconds = next.stale_threshold_seconds,
            batch_size = next.batch_size,
            max_retries = next.max_retries,
            "Scheduler config updated"
        );
        Ok(next)
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: u32) -> BenchmarkResult<Vec<BenchmarkUpdateJob>> {
        self.jobs.list(status, limit).await
    }

    pub fn last_tick(&self) -> Option<TickReport> {
        self.last_tick.read().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.status.read().unwrap(), SchedulerStatus::Running)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Run one tick, or skip it when another one is still in progress
    pub async fn tick(&self) -> BenchmarkResult<TickOutcome> {
        let Some(_guard) = TickGuard::try_acquire(&self.tick_in_progress) else {
            info!("Tick skipped: previous tick still in progress");
            return Ok(TickOutcome::Skipped);
        };

        let config = self.get_config();
        let store = self.service.store();
        let mut report = TickReport::new(Utc::now());

        let stuck_after =
            Duration::seconds(config.stuck_job_ticks as i64 * config.update_frequency_seconds as i64);
        report.reaped = self.jobs.reap_stuck(report.started_at - stuck_after).await?;
        if report.reaped > 0 {
            warn!(count = report.reaped, "Reaped jobs stuck in RUNNING");
        }

        report.marked_stale = store.mark_stale(config.stale_threshold_seconds).await?;

        for address in store.list_stale(config.batch_size).await? {
            self.jobs
                .create(
                    JobKind::BenchmarkUpdate { address },
                    JobPriority::Low,
                    Duration::zero(),
                    config.max_retries,
                )
                .await?;
            report.updates_enqueued += 1;
        }

        report.snapshot_refreshes_enqueued = self.enqueue_snapshot_refreshes(&config).await?;

        let batch = self.jobs.dequeue(config.batch_size).await?;
        report.dequeued = batch.len();

        for (target, jobs) in group_batch(batch) {
            report.executions += 1;
            match self.execute(&target, &jobs).await {
                Ok(()) => {
                    for job in &jobs {
                        match self.jobs.complete(job).await {
                            Ok(()) => report.completed += 1,
                            Err(e) => warn!(job_id = job.id, error = %e, "Failed to mark job completed"),
                        }
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    for job in &jobs {
                        match self.jobs.fail(job, &message).await {
                            Ok(FailureOutcome::Requeued(_)) => report.requeued += 1,
                            Ok(FailureOutcome::Exhausted) => report.failed += 1,
                            Err(e) => warn!(job_id = job.id, error = %e, "Failed to record job failure"),
                        }
                    }
                }
            }
        }

        report.finished_at = Utc::now();
        if report.is_quiet() {
            debug!("Tick complete, nothing to do");
        } else {
            info!(
                marked_stale = report.marked_stale,
                enqueued = report.updates_enqueued + report.snapshot_refreshes_enqueued,
                dequeued = report.dequeued,
                completed = report.completed,
                requeued = report.requeued,
                failed = report.failed,
                "Tick complete"
            );
        }
        *self.last_tick.write().unwrap() = Some(report.clone());

        Ok(TickOutcome::Ran(report))
    }

    /// LOW PEER_GROUP_REFRESH for populated groups whose snapshot is missing or outdated
    async fn enqueue_snapshot_refreshes(&self, config: &SchedulerConfig) -> BenchmarkResult<usize> {
        let store = self.service.store();
        let outdated_before = Utc::now() - Duration::seconds(config.stale_threshold_seconds as i64);
        let mut enqueued = 0;

        for peer_group_id in store.peer_groups_with_members().await? {
            if self.service.catalog().get(&peer_group_id).is_none() {
                warn!(peer_group = %peer_group_id, "Records reference an unknown peer group");
                continue;
            }

            let current = store
                .get_latest_active_snapshot(&peer_group_id)
                .await?
                .is_some_and(|s| s.snapshot_timestamp >= outdated_before);
            if current {
                continue;
            }

            let kind = JobKind::PeerGroupRefresh { peer_group_id };
            if store.has_active_job(&kind).await? {
                continue;
            }
            self.jobs
                .create(kind, JobPriority::Low, Duration::zero(), config.max_retries)
                .await?;
            enqueued += 1;
        }

        Ok(enqueued)
    }

    /// One execution serving every job of a target
    async fn execute(&self, target: &Target, jobs: &[BenchmarkUpdateJob]) -> BenchmarkResult<()> {
        match target {
            Target::Address(address) => {
                // Recompute unless the record is newer than every request
                let requested_at = jobs
                    .iter()
                    .map(|j| j.created_at)
                    .max()
                    .unwrap_or_else(Utc::now);
                match self.service.refresh_address(address, requested_at).await? {
                    RefreshOutcome::Refreshed(record) => {
                        debug!(address = %address, jobs = jobs.len(), percentile = record.overall_percentile, "Address refreshed");
                    }
                    RefreshOutcome::AlreadyFresh(_) => {
                        debug!(address = %address, "Address already fresh");
                    }
                }
            }
            Target::PeerGroup(peer_group_id) => {
                let refresh = jobs
                    .iter()
                    .any(|j| matches!(j.kind, JobKind::PeerGroupRefresh { .. }));
                if refresh {
                    self.service.refresh_peer_group(peer_group_id).await?;
                } else {
                    self.service.recalc_peer_group(peer_group_id).await?;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timer loop
    // -----------------------------------------------------------------------

    /// Tick every `update_frequency_seconds` until cancelled. Each tick runs
    /// in its own task; a tick that outlasts the period makes the next one skip.
    pub async fn run(self: Arc<Self>) {
        info!("Refresh scheduler starting");
        self.cancelled.store(false, Ordering::Relaxed);
        *self.status.write().unwrap() = SchedulerStatus::Running;

        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                break;
            }

            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = scheduler.tick().await {
                    warn!(error = %e, "Scheduler tick failed");
                }
            });

            // Re-read each period so config updates apply from the next tick
            let period = std::time::Duration::from_secs(self.get_config().update_frequency_seconds);
            let deadline = tokio::time::Instant::now() + period;
            while tokio::time::Instant::now() < deadline {
                if self.cancelled.load(Ordering::Relaxed) {
                    break;
                }
                let remaining = deadline - tokio::time::Instant::now();
                tokio::time::sleep(remaining.min(std::time::Duration::from_millis(500))).await;
            }
        }

        *self.status.write().unwrap() = SchedulerStatus::Idle;
        info!("Refresh scheduler stopped");
    }
}
