//! Peer benchmarking engine
//!
//! Ranks an address's behavioral score against a dynamically assigned peer
//! cohort and keeps the rankings fresh in the background:
//! - Peer group catalog and classifier
//! - Percentile ranking against parametric or snapshot distributions
//! - Benchmark store with stale-tolerant reads
//! - Durable job queue with bounded retries
//! - Timer-driven refresh scheduler

pub mod benchmark;
pub mod catalog;
pub mod classifier;
pub mod config;
pub mod error;
pub mod jobs;
pub mod provider;
pub mod ranking;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use benchmark::{
    is_stale, validate_address, BenchmarkService, PeerGroupRefresh, RefreshOutcome, ScoreUpdateOutcome,
};
pub use catalog::{catalog, PeerGroupCatalog, PeerGroupDefinition, DEFAULT_PEER_GROUP_ID};
pub use classifier::{PeerGroupClassification, PeerGroupClassifier};
pub use config::{PriorityThresholds, SchedulerConfig, SchedulerConfigUpdate};
pub use error::{BenchmarkError, BenchmarkResult};
pub use jobs::{BenchmarkUpdateJob, JobKind, JobPriority, JobQueue, JobStatus};
pub use provider::{ScoreProvider, StoredInputsProvider};
pub use ranking::{PercentileRanking, PercentileRankingEngine, PerformanceCategory};
pub use scheduler::{RefreshScheduler, SchedulerStats, SchedulerStatus, TickOutcome, TickReport};
pub use store::{BenchmarkPatch, BenchmarkStore};
pub use types::*;
