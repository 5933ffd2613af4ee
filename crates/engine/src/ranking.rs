//! Percentile ranking against a parametric peer distribution
//!
//! The distribution is six breakpoints {min, p25, p50, p75, p90, max}; a
//! score is placed by linear interpolation between the two bracketing
//! breakpoints, clamped to [1, 99].

use crate::catalog::PeerGroupDefinition;
use crate::types::{PeerGroupSnapshot, ScoreRange, MAX_COMPONENT_SCORE, MAX_SCORE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MIN_PERCENTILE: f64 = 1.0;
pub const MAX_PERCENTILE: f64 = 99.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PerformanceCategory {
    Excellent,
    Good,
    Average,
    BelowAverage,
    Poor,
}

impl PerformanceCategory {
    /// Category for a value on a 0..100 scale
    pub fn from_value(value: f64) -> Self {
        if value >= 90.0 {
            Self::Excellent
        } else if value >= 70.0 {
            Self::Good
        } else if value >= 40.0 {
            Self::Average
        } else if value >= 20.0 {
            Self::BelowAverage
        } else {
            Self::Poor
        }
    }

    /// Lower bound (0..100) of the next better category
    pub fn next_threshold(&self) -> Option<f64> {
        match self {
            Self::Excellent => None,
            Self::Good => Some(90.0),
            Self::Average => Some(70.0),
            Self::BelowAverage => Some(40.0),
            Self::Poor => Some(20.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PercentileRanking {
    pub percentile: f64,
    /// 1 = best in group
    pub rank: u64,
    pub total_in_group: u64,
    pub category: PerformanceCategory,
    /// Score still needed to reach the next category (0 at EXCELLENT)
    pub improvement_potential: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PercentileRankingEngine;

impl PercentileRankingEngine {
    pub fn new() -> Self {
        Self
    }

    /// Rank an overall score (0..1000 scale) within a peer group
    pub fn rank(&self, score: f64, group: &PeerGroupDefinition) -> PercentileRanking {
        rank_in(score, &group.score_range, group.member_count, MAX_SCORE)
    }

    /// Rank each component sub-score (0..100 scale) against the group's
    /// distribution rescaled to the component scale
    pub fn rank_components(
        &self,
        components: &BTreeMap<String, f64>,
        group: &PeerGroupDefinition,
    ) -> BTreeMap<String, PercentileRanking> {
        let distribution = group.score_range.scaled(MAX_COMPONENT_SCORE / MAX_SCORE);
        components
            .iter()
            .map(|(name, score)| {
                (
                    name.clone(),
                    rank_in(*score, &distribution, group.member_count, MAX_COMPONENT_SCORE),
                )
            })
            .collect()
    }
}

/// Piecewise-linear percentile of `score`, never exactly 0 or 100
pub fn percentile(score: f64, distribution: &ScoreRange) -> f64 {
    let points = distribution.breakpoints();
    let (min, _) = points[0];
    let (max, _) = points[points.len() - 1];

    if score.is_nan() || score < min {
        return MIN_PERCENTILE;
    }
    if score > max {
        return MAX_PERCENTILE;
    }

    for pair in points.windows(2) {
        let (lo_score, lo_pct) = pair[0];
        let (hi_score, hi_pct) = pair[1];
        if score <= hi_score {
            let span = hi_score - lo_score;
            let value = if span <= f64::EPSILON {
                hi_pct
            } else {
                lo_pct + (score - lo_score) / span * (hi_pct - lo_pct)
            };
            return value.clamp(MIN_PERCENTILE, MAX_PERCENTILE);
        }
    }

    MAX_PERCENTILE
}

fn rank_in(score: f64, distribution: &ScoreRange, total_in_group: u64, scale_max: f64) -> PercentileRanking {
    let pct = round2(percentile(score, distribution));
    let rank = ((1.0 - pct / 100.0) * total_in_group as f64).round().max(1.0) as u64;

    // Categories are cut on the score's position on its own scale
    let normalized = if scale_max > 0.0 {
        score / scale_max * 100.0
    } else {
        0.0
    };
    let category = PerformanceCategory::from_value(normalized);
    let improvement_potential = category
        .next_threshold()
        .map(|threshold| round2((threshold / 100.0 * scale_max - score).max(0.0)))
        .unwrap_or(0.0);

    PercentileRanking {
        percentile: pct,
        rank,
        total_in_group,
        category,
        improvement_potential,
    }
}

/// The group definition with its distribution replaced by the active snapshot, if any
pub fn ranking_basis(group: &PeerGroupDefinition, snapshot: Option<&PeerGroupSnapshot>) -> PeerGroupDefinition {
    let mut basis = group.clone();
    if let Some(snapshot) = snapshot {
        basis.score_range = snapshot.score_distribution;
        basis.member_count = snapshot.member_count;
        basis.average_score = snapshot.average_score;
    }
    basis
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::catalog;

    fn distribution() -> ScoreRange {
        ScoreRange {
            min: 300.0,
            p25: 520.0,
            p50: 650.0,
            p75: 800.0,
            p90: 880.0,
            max: 1000.0,
        }
    }

    #[test]
    fn test_interpolates_between_breakpoints() {
        let p = percentile(700.0, &distribution());
        assert!((p - 58.333).abs() < 0.01, "got {p}");
        assert_eq!(percentile(650.0, &distribution()), 50.0);
        assert_eq!(percentile(880.0, &distribution()), 90.0);
    }

    #[test]
    fn test_clamps_outside_range() {
        let d = distribution();
        assert_eq!(percentile(d.min - 1.0, &d), 1.0);
        assert_eq!(percentile(d.max + 1.0, &d), 99.0);
        assert_eq!(percentile(d.min, &d), 1.0);
        assert_eq!(percentile(d.max, &d), 99.0);
        assert_eq!(percentile(f64::NAN, &d), 1.0);
    }

    #[test]
    fn test_percentile_is_monotonic() {
        let d = distribution();
        let mut previous = 0.0;
        for step in 0..=1200 {
            let p = percentile(step as f64, &d);
            assert!(p >= previous, "score {step} dropped to {p}");
            assert!(p > 0.0 && p < 100.0);
            previous = p;
        }
    }

    #[test]
    fn test_monotonic_with_collapsed_breakpoints() {
        let d = ScoreRange {
            min: 100.0,
            p25: 100.0,
            p50: 400.0,
            p75: 400.0,
            p90: 400.0,
            max: 500.0,
        };
        let mut previous = 0.0;
        for step in 0..=600 {
            let p = percentile(step as f64, &d);
            assert!(p >= previous);
            previous = p;
        }
    }

    #[test]
    fn test_rank_score_700_against_active_traders() {
        let engine = PercentileRankingEngine::new();
        let group = catalog().get("active_trader").unwrap();
        let ranking = engine.rank(700.0, group);

        assert!((50.0..=75.0).contains(&ranking.percentile));
        assert_eq!(ranking.category, PerformanceCategory::Good);
        assert_eq!(ranking.total_in_group, group.member_count);
        assert_eq!(ranking.improvement_potential, 200.0);
        let expected_rank = ((1.0 - ranking.percentile / 100.0) * group.member_count as f64).round() as u64;
        assert_eq!(ranking.rank, expected_rank);
    }

    #[test]
    fn test_rank_is_at_least_one() {
        let engine = PercentileRankingEngine::new();
        let mut group = catalog().get("whale").unwrap().clone();
        group.member_count = 10;
        let ranking = engine.rank(5000.0, &group);
        assert_eq!(ranking.percentile, 99.0);
        assert_eq!(ranking.rank, 1);
        assert_eq!(ranking.category, PerformanceCategory::Excellent);
        assert_eq!(ranking.improvement_potential, 0.0);
    }

    #[test]
    fn test_category_thresholds() {
        assert_eq!(PerformanceCategory::from_value(90.0), PerformanceCategory::Excellent);
        assert_eq!(PerformanceCategory::from_value(70.0), PerformanceCategory::Good);
        assert_eq!(PerformanceCategory::from_value(40.0), PerformanceCategory::Average);
        assert_eq!(PerformanceCategory::from_value(20.0), PerformanceCategory::BelowAverage);
        assert_eq!(PerformanceCategory::from_value(19.9), PerformanceCategory::Poor);
    }

    #[test]
    fn test_components_use_rescaled_distribution() {
        let engine = PercentileRankingEngine::new();
        let group = catalog().get("active_trader").unwrap();
        let components = BTreeMap::from([
            ("activity".to_string(), 65.0),
            ("risk".to_string(), 10.0),
        ]);
        let ranked = engine.rank_components(&components, group);

        assert_eq!(ranked["activity"].percentile, 50.0);
        assert_eq!(ranked["activity"].category, PerformanceCategory::Average);
        assert_eq!(ranked["activity"].improvement_potential, 5.0);
        assert_eq!(ranked["risk"].percentile, 1.0);
        assert_eq!(ranked["risk"].category, PerformanceCategory::Poor);
    }

    #[test]
    fn test_ranking_basis_prefers_snapshot() {
        let group = catalog().get("newcomer").unwrap();
        assert_eq!(&ranking_basis(group, None), group);

        let snapshot = PeerGroupSnapshot {
            id: Some(1),
            peer_group_id: group.id.clone(),
            member_count: 42,
            average_score: 500.0,
            score_distribution: distribution(),
            snapshot_timestamp: chrono::Utc::now(),
            is_active: true,
        };
        let basis = ranking_basis(group, Some(&snapshot));
        assert_eq!(basis.member_count, 42);
        assert_eq!(basis.score_range, distribution());
    }
}
