//! Peer group classifier: assign an address to its comparison cohort
//!
//! Each group is scored by the weighted fraction of its criteria the address
//! satisfies. Criteria the metrics cannot evaluate (e.g. no staking data) are
//! left out of both sides of the fraction, except a group's signature
//! criterion: without it, or with it unmet, the group does not match at all.

use crate::catalog::{Criterion, CriterionRange, PeerGroupCatalog, PeerGroupDefinition};
use crate::types::{AddressMetrics, TransactionSummary};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use std::collections::HashSet;

pub const MIN_CONFIDENCE: f64 = 30.0;
pub const MAX_CONFIDENCE: f64 = 95.0;
/// Match-score gap (as a fraction) that earns full confidence
const FULL_CONFIDENCE_GAP: f64 = 0.5;
/// Minimum match score for an alternative group
const ALTERNATIVE_MIN_MATCH: f64 = 0.5;
const MAX_ALTERNATIVES: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerGroupClassification {
    pub address: String,
    pub primary_peer_group: String,
    pub alternative_peer_groups: Vec<String>,
    pub classification_confidence: f64,
    pub classification_reasons: Vec<String>,
}

/// Metric values in the units the criteria are expressed in
#[derive(Debug, Clone, Copy)]
struct Observed {
    account_age_days: f64,
    transaction_count: f64,
    portfolio_size: Option<f64>,
    staking_ratio: Option<f64>,
    protocol_diversity: Option<f64>,
}

impl Observed {
    fn value(&self, criterion: Criterion) -> Option<f64> {
        match criterion {
            Criterion::AccountAge => Some(self.account_age_days),
            Criterion::Activity => Some(self.transaction_count),
            Criterion::PortfolioSize => self.portfolio_size,
            Criterion::StakingRatio => self.staking_ratio,
            Criterion::ProtocolDiversity => self.protocol_diversity,
        }
    }
}

#[derive(Debug, Clone)]
struct GroupMatch<'c> {
    group: &'c PeerGroupDefinition,
    score: f64,
    satisfied: Vec<(Criterion, CriterionRange, f64)>,
}

pub struct PeerGroupClassifier<'c> {
    catalog: &'c PeerGroupCatalog,
}

impl<'c> PeerGroupClassifier<'c> {
    pub fn new(catalog: &'c PeerGroupCatalog) -> Self {
        Self { catalog }
    }

    /// Classify an address. Never fails: unusable metrics land in the default group.
    pub fn classify(
        &self,
        address: &str,
        metrics: &AddressMetrics,
        transactions: Option<&[TransactionSummary]>,
    ) -> PeerGroupClassification {
        let observed = match observe(metrics, transactions) {
            Ok(observed) => observed,
            Err(problem) => {
                return self.fallback(address, format!("Insufficient data: {problem}"));
            }
        };

        let mut matches: Vec<GroupMatch<'c>> = self
            .catalog
            .groups()
            .iter()
            .map(|group| match_group(group, &observed))
            .collect();

        // Highest match first; catalog is id-sorted and the sort is stable,
        // so equal scores keep the smaller id first.
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let primary = &matches[0];
        if primary.score <= 0.0 {
            return self.fallback(
                address,
                "Insufficient data: no peer group criteria matched".to_string(),
            );
        }

        let runner_up = matches.get(1);
        let runner_up_score = runner_up.map_or(0.0, |m| m.score);
        let gap = primary.score - runner_up_score;
        let confidence = (MIN_CONFIDENCE
            + (MAX_CONFIDENCE - MIN_CONFIDENCE) * (gap / FULL_CONFIDENCE_GAP).min(1.0))
        .clamp(MIN_CONFIDENCE, MAX_CONFIDENCE);

        let alternative_peer_groups = matches
            .iter()
            .skip(1)
            .filter(|m| m.score >= ALTERNATIVE_MIN_MATCH)
            .take(MAX_ALTERNATIVES)
            .map(|m| m.group.id.clone())
            .collect();

        PeerGroupClassification {
            address: address.to_string(),
            primary_peer_group: primary.group.id.clone(),
            alternative_peer_groups,
            classification_confidence: round2(confidence),
            classification_reasons: decisive_reasons(primary, runner_up),
        }
    }

    fn fallback(&self, address: &str, reason: String) -> PeerGroupClassification {
        PeerGroupClassification {
            address: address.to_string(),
            primary_peer_group: self.catalog.default_group().id.clone(),
            alternative_peer_groups: Vec::new(),
            classification_confidence: MIN_CONFIDENCE,
            classification_reasons: vec![reason],
        }
    }
}

fn observe(
    metrics: &AddressMetrics,
    transactions: Option<&[TransactionSummary]>,
) -> Result<Observed, &'static str> {
    if !metrics.account_age_days.is_finite() || metrics.account_age_days < 0.0 {
        return Err("account age is negative or not a number");
    }
    if metrics.total_volume.is_sign_negative() && !metrics.total_volume.is_zero() {
        return Err("total volume is negative");
    }
    if let Some(value) = metrics.portfolio_value {
        if value.is_sign_negative() && !value.is_zero() {
            return Err("portfolio value is negative");
        }
    }
    if let Some(ratio) = metrics.staking_ratio {
        if !ratio.is_finite() || !(0.0..=1.0).contains(&ratio) {
            return Err("staking ratio outside [0, 1]");
        }
    }

    let portfolio_size = metrics
        .portfolio_value
        .unwrap_or(metrics.total_volume)
        .to_f64();

    let protocol_diversity = match (metrics.protocol_count, transactions) {
        (Some(count), _) => Some(count as f64),
        (None, Some(history)) if !history.is_empty() => {
            let protocols: HashSet<&str> =
                history.iter().filter_map(|t| t.protocol.as_deref()).collect();
            Some(protocols.len() as f64)
        }
        _ => None,
    };

    Ok(Observed {
        account_age_days: metrics.account_age_days,
        transaction_count: metrics.total_transactions as f64,
        portfolio_size,
        staking_ratio: metrics.staking_ratio,
        protocol_diversity,
    })
}

fn match_group<'c>(group: &'c PeerGroupDefinition, observed: &Observed) -> GroupMatch<'c> {
    let mut evaluable = 0.0;
    let mut satisfied_weight = 0.0;
    let mut satisfied = Vec::new();

    for (criterion, range) in group.criteria.defined() {
        let Some(value) = observed.value(criterion) else {
            continue;
        };
        evaluable += criterion.weight();
        if range.contains(value) {
            satisfied_weight += criterion.weight();
            satisfied.push((criterion, range, value));
        }
    }

    let signature_met = group.criteria.signature.map_or(true, |criterion| {
        satisfied.iter().any(|(c, _, _)| *c == criterion)
    });

    let score = if evaluable > 0.0 && signature_met {
        satisfied_weight / evaluable
    } else {
        0.0
    };

    GroupMatch {
        group,
        score,
        satisfied,
    }
}

/// Criteria the primary group satisfied that the runner-up did not
fn decisive_reasons(primary: &GroupMatch<'_>, runner_up: Option<&GroupMatch<'_>>) -> Vec<String> {
    let mut reasons = vec![format!(
        "Matched {:.0}% of evaluable criteria for {}",
        primary.score * 100.0,
        primary.group.name
    )];

    let runner_satisfied: HashSet<Criterion> = runner_up
        .map(|m| m.satisfied.iter().map(|(c, _, _)| *c).collect())
        .unwrap_or_default();

    let mut decisive: Vec<_> = primary
        .satisfied
        .iter()
        .filter(|(criterion, _, _)| !runner_satisfied.contains(criterion))
        .collect();
    // heavier criteria first
    decisive.sort_by(|a, b| {
        b.0.weight()
            .partial_cmp(&a.0.weight())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    for (criterion, range, value) in decisive {
        reasons.push(format!(
            "{} {} within {}",
            capitalize(criterion.label()),
            format_value(*criterion, *value),
            format_range(*criterion, range)
        ));
    }

    if let Some(runner_up) = runner_up {
        if runner_up.score == primary.score {
            reasons.push(format!(
                "Tied with {} at {:.0}%, resolved by group order",
                runner_up.group.name,
                runner_up.score * 100.0
            ));
        }
    }

    reasons
}

fn format_value(criterion: Criterion, value: f64) -> String {
    match criterion {
        Criterion::AccountAge => format!("{value:.0} days"),
        Criterion::Activity => format!("{value:.0} transactions"),
        Criterion::PortfolioSize => format!("{value:.2}"),
        Criterion::StakingRatio => format!("{:.0}%", value * 100.0),
        Criterion::ProtocolDiversity => format!("{value:.0} protocols"),
    }
}

fn format_range(criterion: Criterion, range: &CriterionRange) -> String {
    let min = format_value(criterion, range.min);
    match range.max {
        Some(max) => format!("[{min}, {})", format_value(criterion, max)),
        None => format!(">= {min}"),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{catalog, DEFAULT_PEER_GROUP_ID};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn metrics(age: f64, txs: u64, volume: Decimal) -> AddressMetrics {
        AddressMetrics {
            account_age_days: age,
            total_transactions: txs,
            total_volume: volume,
            portfolio_value: None,
            staking_ratio: None,
            protocol_count: None,
        }
    }

    #[test]
    fn test_high_activity_address_is_active_trader() {
        let classifier = PeerGroupClassifier::new(catalog());
        let result = classifier.classify("0xabc", &metrics(400.0, 250, dec!(150)), None);

        assert_eq!(result.primary_peer_group, "active_trader");
        assert!(result.classification_confidence >= 60.0);
        assert_eq!(
            result.alternative_peer_groups,
            vec!["defi_power_user".to_string(), "whale".to_string()]
        );
        assert!(result
            .classification_reasons
            .iter()
            .any(|r| r.starts_with("Transaction activity")));
    }

    #[test]
    fn test_classification_is_pure() {
        let classifier = PeerGroupClassifier::new(catalog());
        let m = metrics(800.0, 40, dec!(20));
        let first = classifier.classify("0xabc", &m, None);
        for _ in 0..5 {
            assert_eq!(classifier.classify("0xabc", &m, None), first);
        }
    }

    #[test]
    fn test_confidence_bounds() {
        let classifier = PeerGroupClassifier::new(catalog());
        let cases = [
            metrics(0.0, 0, Decimal::ZERO),
            metrics(10.0, 3, dec!(1)),
            metrics(5000.0, 100_000, dec!(1000000)),
            metrics(200.0, 150, dec!(50)),
            metrics(f64::NAN, 10, dec!(5)),
        ];
        for m in &cases {
            let c = classifier.classify("0x1", m, None).classification_confidence;
            assert!((MIN_CONFIDENCE..=MAX_CONFIDENCE).contains(&c), "confidence {c}");
        }
    }

    #[test]
    fn test_degenerate_metrics_fall_back_to_default_group() {
        let classifier = PeerGroupClassifier::new(catalog());
        let mut m = metrics(-5.0, 10, dec!(5));
        let result = classifier.classify("0x1", &m, None);
        assert_eq!(result.primary_peer_group, DEFAULT_PEER_GROUP_ID);
        assert_eq!(result.classification_confidence, MIN_CONFIDENCE);
        assert!(result.classification_reasons[0].contains("Insufficient data"));

        m.account_age_days = 100.0;
        m.staking_ratio = Some(1.7);
        let result = classifier.classify("0x1", &m, None);
        assert_eq!(result.primary_peer_group, DEFAULT_PEER_GROUP_ID);
        assert!(result.alternative_peer_groups.is_empty());
    }

    #[test]
    fn test_staker_needs_staking_ratio() {
        let classifier = PeerGroupClassifier::new(catalog());
        let mut m = metrics(1200.0, 60, dec!(500));
        m.staking_ratio = Some(0.8);
        let result = classifier.classify("0x1", &m, None);
        assert_eq!(result.primary_peer_group, "long_term_staker");

        // old and quiet is not enough without a meaningful staking ratio
        for ratio in [Some(0.0), Some(0.3), None] {
            m.staking_ratio = ratio;
            let result = classifier.classify("0x1", &m, None);
            assert_eq!(result.primary_peer_group, "casual_holder", "staking ratio {ratio:?}");
            assert!(!result
                .alternative_peer_groups
                .contains(&"long_term_staker".to_string()));
        }
    }

    #[test]
    fn test_protocol_diversity_from_history() {
        let classifier = PeerGroupClassifier::new(catalog());
        let history: Vec<TransactionSummary> = ["uniswap", "aave", "curve", "aave"]
            .iter()
            .enumerate()
            .map(|(i, p)| TransactionSummary {
                timestamp: i as i64,
                protocol: Some(p.to_string()),
                value: None,
            })
            .collect();
        let m = metrics(400.0, 250, dec!(150));
        let result = classifier.classify("0x1", &m, Some(&history));
        assert_eq!(result.primary_peer_group, "active_trader");
        assert!(result
            .classification_reasons
            .iter()
            .any(|r| r.contains("3 protocols")));
    }
}
