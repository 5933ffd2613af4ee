//! Error taxonomy for the benchmarking core

use persistence::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchmarkError {
    /// Malformed input, rejected before classification
    #[error("validation error: {0}")]
    Validation(String),

    /// Classification / ranking inputs could not be produced; retried through the job path
    #[error("transient compute error: {0}")]
    TransientCompute(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] DbError),

    /// Rejected `update_config`; the active config is left unchanged
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for BenchmarkError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence(DbError::Serialization(e))
    }
}

pub type BenchmarkResult<T> = Result<T, BenchmarkError>;
