//! Scheduler configuration: defaults, environment overlay and validated partial updates

use crate::error::{BenchmarkError, BenchmarkResult};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Shared between the scheduler handle and the benchmark service
pub type SharedConfig = Arc<RwLock<SchedulerConfig>>;

/// Ten years; keeps threshold arithmetic on timestamps in range
pub const MAX_STALE_THRESHOLD_SECONDS: u64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityThresholds {
    /// Percentile shift (points) that turns a live score update into a MEDIUM job
    pub significant_percentile_shift: f64,
}

impl Default for PriorityThresholds {
    fn default() -> Self {
        Self {
            significant_percentile_shift: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub update_frequency_seconds: u64,
    pub stale_threshold_seconds: u64,
    pub batch_size: u32,
    pub max_retries: u32,
    pub priority_thresholds: PriorityThresholds,
    /// Snapshots kept per peer group (active + inactive)
    pub snapshot_retention: u32,
    /// A job RUNNING for longer than this many ticks is reaped
    pub stuck_job_ticks: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            update_frequency_seconds: 300,
            stale_threshold_seconds: 3600,
            batch_size: 50,
            max_retries: 3,
            priority_thresholds: PriorityThresholds::default(),
            snapshot_retention: 5,
            stuck_job_ticks: 3,
        }
    }
}

/// Partial form accepted by `update_config`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfigUpdate {
    pub update_frequency_seconds: Option<u64>,
    pub stale_threshold_seconds: Option<u64>,
    pub batch_size: Option<u32>,
    pub max_retries: Option<u32>,
    pub priority_thresholds: Option<PriorityThresholds>,
    pub snapshot_retention: Option<u32>,
    pub stuck_job_ticks: Option<u32>,
}

impl SchedulerConfig {
    /// Defaults overlaid with `PEER_BENCH_*` environment variables.
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("PEER_BENCH_UPDATE_FREQUENCY_SECS") {
            config.update_frequency_seconds = v;
        }
        if let Some(v) = env_parse("PEER_BENCH_STALE_THRESHOLD_SECS") {
            config.stale_threshold_seconds = v;
        }
        if let Some(v) = env_parse("PEER_BENCH_BATCH_SIZE") {
            config.batch_size = v;
        }
        if let Some(v) = env_parse("PEER_BENCH_MAX_RETRIES") {
            config.max_retries = v;
        }
        if let Some(v) = env_parse("PEER_BENCH_SIGNIFICANT_SHIFT") {
            config.priority_thresholds.significant_percentile_shift = v;
        }

        if let Err(e) = config.validate() {
            warn!(error = %e, "Invalid scheduler config from environment, using defaults");
            return Self::default();
        }
        config
    }

    pub fn validate(&self) -> BenchmarkResult<()> {
        if !(1..=86_400).contains(&self.update_frequency_seconds) {
            return Err(invalid("updateFrequencySeconds must be between 1 and 86400"));
        }
        if !(1..=MAX_STALE_THRESHOLD_SECONDS).contains(&self.stale_threshold_seconds) {
            return Err(invalid(&format!(
                "staleThresholdSeconds must be between 1 and {MAX_STALE_THRESHOLD_SECONDS}"
            )));
        }
        if !(1..=1000).contains(&self.batch_size) {
            return Err(invalid("batchSize must be between 1 and 1000"));
        }
        if self.max_retries > 10 {
            return Err(invalid("maxRetries must be at most 10"));
        }
        let shift = self.priority_thresholds.significant_percentile_shift;
        if !(shift > 0.0 && shift <= 100.0) {
            return Err(invalid(
                "priorityThresholds.significantPercentileShift must be in (0, 100]",
            ));
        }
        if self.snapshot_retention < 1 {
            return Err(invalid("snapshotRetention must be at least 1"));
        }
        if self.stuck_job_ticks < 1 {
            return Err(invalid("stuckJobTicks must be at least 1"));
        }
        Ok(())
    }

    /// Merge a partial update, validating the result as a whole
    pub fn merged(&self, update: &SchedulerConfigUpdate) -> BenchmarkResult<Self> {
        let mut next = self.clone();
        if let Some(v) = update.update_frequency_seconds {
            next.update_frequency_seconds = v;
        }
        if let Some(v) = update.stale_threshold_seconds {
            next.stale_threshold_seconds = v;
        }
        if let Some(v) = update.batch_size {
            next.batch_size = v;
        }
        if let Some(v) = update.max_retries {
            next.max_retries = v;
        }
        if let Some(v) = &update.priority_thresholds {
            next.priority_thresholds = v.clone();
        }
        if let Some(v) = update.snapshot_retention {
            next.snapshot_retention = v;
        }
        if let Some(v) = update.stuck_job_ticks {
            next.stuck_job_ticks = v;
        }
        next.validate()?;
        Ok(next)
    }

    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}

fn invalid(message: &str) -> BenchmarkError {
    BenchmarkError::Configuration(message.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_merge_applies_only_given_fields() {
        let base = SchedulerConfig::default();
        let update = SchedulerConfigUpdate {
            batch_size: Some(10),
            ..Default::default()
        };
        let merged = base.merged(&update).unwrap();
        assert_eq!(merged.batch_size, 10);
        assert_eq!(merged.update_frequency_seconds, base.update_frequency_seconds);
    }

    #[test]
    fn test_merge_rejects_invalid_values() {
        let base = SchedulerConfig::default();
        for update in [
            SchedulerConfigUpdate {
                update_frequency_seconds: Some(0),
                ..Default::default()
            },
            SchedulerConfigUpdate {
                batch_size: Some(5000),
                ..Default::default()
            },
            SchedulerConfigUpdate {
                stale_threshold_seconds: Some(0),
                ..Default::default()
            },
            SchedulerConfigUpdate {
                stale_threshold_seconds: Some(100_000_000_000_000_000),
                ..Default::default()
            },
            SchedulerConfigUpdate {
                max_retries: Some(11),
                ..Default::default()
            },
            SchedulerConfigUpdate {
                priority_thresholds: Some(PriorityThresholds {
                    significant_percentile_shift: 0.0,
                }),
                ..Default::default()
            },
        ] {
            assert!(matches!(
                base.merged(&update),
                Err(BenchmarkError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_stale_threshold_upper_bound_is_inclusive() {
        let update = SchedulerConfigUpdate {
            stale_threshold_seconds: Some(MAX_STALE_THRESHOLD_SECONDS),
            ..Default::default()
        };
        assert!(SchedulerConfig::default().merged(&update).is_ok());
    }

    #[test]
    fn test_partial_update_from_json() {
        let update: SchedulerConfigUpdate =
            serde_json::from_str(r#"{"staleThresholdSeconds": 900, "maxRetries": 2}"#).unwrap();
        let merged = SchedulerConfig::default().merged(&update).unwrap();
        assert_eq!(merged.stale_threshold_seconds, 900);
        assert_eq!(merged.max_retries, 2);
    }
}
