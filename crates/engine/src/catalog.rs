//! Peer group catalog: static cohort definitions loaded once per process

use crate::error::{BenchmarkError, BenchmarkResult};
use crate::types::ScoreRange;
use serde::Serialize;
use std::sync::OnceLock;

/// Group every address falls back to when its metrics are unusable
pub const DEFAULT_PEER_GROUP_ID: &str = "newcomer";

/// Behavioral dimension a peer group can be defined on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    AccountAge,
    Activity,
    PortfolioSize,
    StakingRatio,
    ProtocolDiversity,
}

impl Criterion {
    /// Activity and portfolio size dominate, diversity matters least
    pub fn weight(&self) -> f64 {
        match self {
            Self::Activity => 0.30,
            Self::PortfolioSize => 0.25,
            Self::AccountAge => 0.20,
            Self::StakingRatio => 0.15,
            Self::ProtocolDiversity => 0.10,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::AccountAge => "account age",
            Self::Activity => "transaction activity",
            Self::PortfolioSize => "portfolio size",
            Self::StakingRatio => "staking ratio",
            Self::ProtocolDiversity => "protocol diversity",
        }
    }
}

/// Half-open range `[min, max)`; no `max` means unbounded
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CriterionRange {
    pub min: f64,
    pub max: Option<f64>,
}

impl CriterionRange {
    pub const fn between(min: f64, max: f64) -> Self {
        Self { min, max: Some(max) }
    }

    pub const fn at_least(min: f64) -> Self {
        Self { min, max: None }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && self.max.map_or(true, |max| value < max)
    }
}

/// Only the criteria that characterize a group are set
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeerGroupCriteria {
    pub account_age_days: Option<CriterionRange>,
    pub transaction_count: Option<CriterionRange>,
    pub portfolio_size: Option<CriterionRange>,
    pub staking_ratio: Option<CriterionRange>,
    pub protocol_diversity: Option<CriterionRange>,
    /// Criterion membership hinges on: the group scores 0 unless the
    /// metrics provide it and it is satisfied
    pub signature: Option<Criterion>,
}

impl PeerGroupCriteria {
    pub fn defined(&self) -> Vec<(Criterion, CriterionRange)> {
        [
            (Criterion::AccountAge, self.account_age_days),
            (Criterion::Activity, self.transaction_count),
            (Criterion::PortfolioSize, self.portfolio_size),
            (Criterion::StakingRatio, self.staking_ratio),
            (Criterion::ProtocolDiversity, self.protocol_diversity),
        ]
        .into_iter()
        .filter_map(|(criterion, range)| range.map(|r| (criterion, r)))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerGroupDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub criteria: PeerGroupCriteria,
    pub member_count: u64,
    pub average_score: f64,
    pub score_range: ScoreRange,
}

/// Immutable set of peer groups, sorted by id (the classification tie-break order)
#[derive(Debug, Clone, Serialize)]
pub struct PeerGroupCatalog {
    groups: Vec<PeerGroupDefinition>,
}

impl PeerGroupCatalog {
    /// Rejects an empty group list and duplicate ids
    pub fn new(groups: Vec<PeerGroupDefinition>) -> BenchmarkResult<Self> {
        if groups.is_empty() {
            return Err(BenchmarkError::Configuration(
                "peer group catalog must define at least one group".into(),
            ));
        }
        let catalog = Self::sorted(groups);
        if let Some(pair) = catalog.groups.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(BenchmarkError::Configuration(format!(
                "duplicate peer group id {}",
                pair[0].id
            )));
        }
        Ok(catalog)
    }

    fn sorted(mut groups: Vec<PeerGroupDefinition>) -> Self {
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Self { groups }
    }

    pub fn groups(&self) -> &[PeerGroupDefinition] {
        &self.groups
    }

    pub fn get(&self, id: &str) -> Option<&PeerGroupDefinition> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// The lowest-activity group (falls back to the first group of a custom catalog)
    pub fn default_group(&self) -> &PeerGroupDefinition {
        // non-empty by construction
        self.get(DEFAULT_PEER_GROUP_ID).unwrap_or(&self.groups[0])
    }
}

/// Process-wide built-in catalog
pub fn catalog() -> &'static PeerGroupCatalog {
    static CATALOG: OnceLock<PeerGroupCatalog> = OnceLock::new();
    CATALOG.get_or_init(|| PeerGroupCatalog::sorted(builtin_groups()))
}

fn group(
    id: &str,
    name: &str,
    description: &str,
    criteria: PeerGroupCriteria,
    member_count: u64,
    average_score: f64,
    score_range: ScoreRange,
) -> PeerGroupDefinition {
    PeerGroupDefinition {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        criteria,
        member_count,
        average_score,
        score_range,
    }
}

fn builtin_groups() -> Vec<PeerGroupDefinition> {
    vec![
        group(
            "newcomer",
            "Newcomer",
            "Recently created addresses with little on-chain history",
            PeerGroupCriteria {
                account_age_days: Some(CriterionRange::between(0.0, 90.0)),
                transaction_count: Some(CriterionRange::between(0.0, 25.0)),
                ..Default::default()
            },
            48_000,
            360.0,
            ScoreRange { min: 0.0, p25: 250.0, p50: 350.0, p75: 450.0, p90: 540.0, max: 700.0 },
        ),
        group(
            "casual_holder",
            "Casual Holder",
            "Established addresses that hold small balances and transact rarely",
            PeerGroupCriteria {
                account_age_days: Some(CriterionRange::at_least(90.0)),
                transaction_count: Some(CriterionRange::between(0.0, 100.0)),
                portfolio_size: Some(CriterionRange::between(0.0, 100.0)),
                ..Default::default()
            },
            31_000,
            470.0,
            ScoreRange { min: 150.0, p25: 380.0, p50: 470.0, p75: 560.0, p90: 640.0, max: 800.0 },
        ),
        group(
            "active_trader",
            "Active Trader",
            "Mature addresses with sustained trading activity across several protocols",
            PeerGroupCriteria {
                account_age_days: Some(CriterionRange::at_least(180.0)),
                transaction_count: Some(CriterionRange::between(100.0, 1_000.0)),
                portfolio_size: Some(CriterionRange::between(10.0, 1_000.0)),
                protocol_diversity: Some(CriterionRange::at_least(3.0)),
                ..Default::default()
            },
            12_500,
            640.0,
            ScoreRange { min: 300.0, p25: 520.0, p50: 650.0, p75: 800.0, p90: 880.0, max: 1000.0 },
        ),
        group(
            "defi_power_user",
            "DeFi Power User",
            "Very high activity spread across many DeFi protocols",
            PeerGroupCriteria {
                account_age_days: Some(CriterionRange::at_least(365.0)),
                transaction_count: Some(CriterionRange::at_least(1_000.0)),
                portfolio_size: Some(CriterionRange::at_least(100.0)),
                protocol_diversity: Some(CriterionRange::at_least(8.0)),
                ..Default::default()
            },
            3_200,
            720.0,
            ScoreRange { min: 400.0, p25: 630.0, p50: 720.0, p75: 830.0, p90: 910.0, max: 1000.0 },
        ),
        group(
            "long_term_staker",
            "Long-Term Staker",
            "Old addresses that keep most of their holdings staked and rarely trade",
            PeerGroupCriteria {
                account_age_days: Some(CriterionRange::at_least(730.0)),
                transaction_count: Some(CriterionRange::between(0.0, 200.0)),
                staking_ratio: Some(CriterionRange::between(0.5, 1.01)),
                signature: Some(Criterion::StakingRatio),
                ..Default::default()
            },
            6_400,
            690.0,
            ScoreRange { min: 350.0, p25: 600.0, p50: 690.0, p75: 780.0, p90: 850.0, max: 980.0 },
        ),
        group(
            "whale",
            "Whale",
            "Addresses controlling very large portfolios",
            PeerGroupCriteria {
                transaction_count: Some(CriterionRange::at_least(50.0)),
                portfolio_size: Some(CriterionRange::at_least(1_000.0)),
                ..Default::default()
            },
            900,
            750.0,
            ScoreRange { min: 420.0, p25: 660.0, p50: 750.0, p75: 850.0, p90: 920.0, max: 1000.0 },
        ),
    ]
}
