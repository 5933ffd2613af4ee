//! Source of the upstream score inputs a benchmark is computed from

use crate::error::{BenchmarkError, BenchmarkResult};
use crate::store::BenchmarkStore;
use crate::types::ScoreInputs;
use async_trait::async_trait;

/// Supplies metrics, transaction history and the base score for an address.
///
/// Failures are reported as `TransientCompute` so refreshes go through the
/// job retry path.
#[async_trait]
pub trait ScoreProvider: Send + Sync {
    async fn fetch_inputs(&self, address: &str) -> BenchmarkResult<ScoreInputs>;
}

/// Reads the latest inputs pushed through `record_score_update`
pub struct StoredInputsProvider {
    store: BenchmarkStore,
}

impl StoredInputsProvider {
    pub fn new(store: BenchmarkStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ScoreProvider for StoredInputsProvider {
    async fn fetch_inputs(&self, address: &str) -> BenchmarkResult<ScoreInputs> {
        self.store.get_inputs(address).await?.ok_or_else(|| {
            BenchmarkError::TransientCompute(format!("no score inputs recorded for {address}"))
        })
    }
}

/// In-memory provider for exercising the refresh paths
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::types::{AddressMetrics, ScoreBreakdown};
    use rust_decimal::Decimal;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    pub(crate) struct FixedProvider {
        inputs: Mutex<HashMap<String, ScoreInputs>>,
        calls: AtomicUsize,
        failing: AtomicBool,
        delay: Option<Duration>,
    }

    impl FixedProvider {
        pub(crate) fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        pub(crate) fn set(&self, address: &str, inputs: ScoreInputs) {
            self.inputs.lock().unwrap().insert(address.to_string(), inputs);
        }

        pub(crate) fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ScoreProvider for FixedProvider {
        async fn fetch_inputs(&self, address: &str) -> BenchmarkResult<ScoreInputs> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(BenchmarkError::TransientCompute("upstream unavailable".into()));
            }
            self.inputs
                .lock()
                .unwrap()
                .get(address)
                .cloned()
                .ok_or_else(|| BenchmarkError::TransientCompute(format!("unknown address {address}")))
        }
    }

    pub(crate) fn inputs(age: f64, txs: u64, volume: Decimal, score: f64) -> ScoreInputs {
        ScoreInputs {
            metrics: AddressMetrics {
                account_age_days: age,
                total_transactions: txs,
                total_volume: volume,
                portfolio_value: None,
                staking_ratio: None,
                protocol_count: None,
            },
            transactions: Vec::new(),
            breakdown: ScoreBreakdown {
                score,
                components: BTreeMap::from([
                    ("activity".to_string(), score / 10.0),
                    ("diversification".to_string(), 50.0),
                ]),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AddressMetrics, ScoreBreakdown};
    use persistence::Database;
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_missing_inputs_are_transient() {
        let db = Database::in_memory().await.unwrap();
        let store = BenchmarkStore::new(db.pool_clone());
        let provider = StoredInputsProvider::new(store.clone());

        let err = provider.fetch_inputs("0xabc").await.unwrap_err();
        assert!(matches!(err, BenchmarkError::TransientCompute(_)));

        let inputs = ScoreInputs {
            metrics: AddressMetrics {
                account_age_days: 10.0,
                total_transactions: 3,
                total_volume: Decimal::ONE,
                portfolio_value: None,
                staking_ratio: None,
                protocol_count: None,
            },
            transactions: Vec::new(),
            breakdown: ScoreBreakdown {
                score: 320.0,
                components: BTreeMap::new(),
            },
        };
        store.save_inputs("0xabc", &inputs).await.unwrap();
        assert_eq!(provider.fetch_inputs("0xabc").await.unwrap(), inputs);
    }
}
