//! Shared types for classification, ranking and the benchmark store

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upper bound of the overall behavioral score
pub const MAX_SCORE: f64 = 1000.0;
/// Upper bound of every component sub-score
pub const MAX_COMPONENT_SCORE: f64 = 100.0;

/// On-chain behavioral metrics for one address, as supplied by ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressMetrics {
    /// Days since the first observed transaction
    #[serde(alias = "accountAge")]
    pub account_age_days: f64,
    pub total_transactions: u64,
    /// Lifetime volume in native units
    #[serde(default)]
    pub total_volume: Decimal,
    /// Current holdings; falls back to `total_volume` for portfolio size
    #[serde(default)]
    pub portfolio_value: Option<Decimal>,
    /// Staked share of holdings in [0, 1]
    #[serde(default)]
    pub staking_ratio: Option<f64>,
    /// Distinct protocols interacted with
    #[serde(default)]
    pub protocol_count: Option<u32>,
}

/// One entry of an address's transaction history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSummary {
    pub timestamp: i64,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub value: Option<Decimal>,
}

/// Base score and its component breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub score: f64,
    #[serde(default)]
    pub components: BTreeMap<String, f64>,
}

/// Everything needed to (re)compute one benchmark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreInputs {
    pub metrics: AddressMetrics,
    #[serde(default)]
    pub transactions: Vec<TransactionSummary>,
    pub breakdown: ScoreBreakdown,
}

/// Breakpoints of a parametric peer score distribution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRange {
    pub min: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub max: f64,
}

impl ScoreRange {
    /// (score, percentile) anchor points in ascending order
    pub fn breakpoints(&self) -> [(f64, f64); 6] {
        [
            (self.min, 1.0),
            (self.p25, 25.0),
            (self.p50, 50.0),
            (self.p75, 75.0),
            (self.p90, 90.0),
            (self.max, 99.0),
        ]
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            min: self.min * factor,
            p25: self.p25 * factor,
            p50: self.p50 * factor,
            p75: self.p75 * factor,
            p90: self.p90 * factor,
            max: self.max * factor,
        }
    }

    /// Empirical breakpoints from a set of scores (nearest-rank quantiles)
    pub fn from_scores(scores: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = scores.iter().copied().filter(|s| s.is_finite()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let quantile = |q: f64| {
            let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };

        Some(Self {
            min: sorted[0],
            p25: quantile(0.25),
            p50: quantile(0.50),
            p75: quantile(0.75),
            p90: quantile(0.90),
            max: sorted[sorted.len() - 1],
        })
    }
}

/// Persisted benchmark of one address against its peer group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkRecord {
    pub address: String,
    pub peer_group_id: String,
    pub overall_score: f64,
    pub overall_percentile: f64,
    pub component_scores: BTreeMap<String, f64>,
    pub component_percentiles: BTreeMap<String, f64>,
    pub classification_confidence: f64,
    pub benchmark_timestamp: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub update_frequency_seconds: u64,
    pub is_stale: bool,
}

/// Read model handed to the API layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkView {
    pub peer_group_id: String,
    pub overall_percentile: f64,
    pub component_percentiles: BTreeMap<String, f64>,
    pub is_stale: bool,
    pub last_updated: DateTime<Utc>,
}

/// Point-in-time distribution of a peer group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerGroupSnapshot {
    pub id: Option<i64>,
    pub peer_group_id: String,
    pub member_count: u64,
    pub average_score: f64,
    pub score_distribution: ScoreRange,
    pub snapshot_timestamp: DateTime<Utc>,
    pub is_active: bool,
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_metrics_accept_string_volume() {
        let metrics: AddressMetrics = serde_json::from_str(
            r#"{"accountAge": 400, "totalTransactions": 250, "totalVolume": "150"}"#,
        )
        .unwrap();
        assert_eq!(metrics.account_age_days, 400.0);
        assert_eq!(metrics.total_transactions, 250);
        assert_eq!(metrics.total_volume, dec!(150));
        assert_eq!(metrics.staking_ratio, None);
    }

    #[test]
    fn test_score_range_from_scores() {
        let scores: Vec<f64> = (0..=100).map(|i| i as f64 * 10.0).collect();
        let range = ScoreRange::from_scores(&scores).unwrap();
        assert_eq!(range.min, 0.0);
        assert_eq!(range.p25, 250.0);
        assert_eq!(range.p50, 500.0);
        assert_eq!(range.p90, 900.0);
        assert_eq!(range.max, 1000.0);
        assert!(ScoreRange::from_scores(&[]).is_none());
    }
}
