//! Balance manager (§4.2). Tracks per-signer balance with a short TTL
//! cache, decides affordability, and drives auto-fueling transfers from a
//! treasury signer. De-duplication of concurrent fueling requests is
//! grounded on the teacher's `wake_up_notify`/single-flight pattern in
//! `task_monitor.rs`, adapted from "wake one worker" to "one outstanding
//! transfer per destination".
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ethers::types::U256;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::config::{AutoFuelingConfig, BalanceManagerConfig};
use crate::interfaces::LedgerRpc;
use crate::types::{Address, PtxId};

#[derive(Debug, Error, Clone)]
pub enum FuelingError {
    #[error("auto-fueling is not configured")]
    NotConfigured,

    #[error("treasury {source} balance would fall below its configured minimum")]
    SourceBelowMinimum { source: Address },

    #[error("fueling transfer submission failed: {0}")]
    SubmissionFailed(String),
}

/// Submits a fueling PTX on behalf of the Balance Manager. Implemented by
/// the Engine (it alone can route a new PTX onto the treasury signer's
/// Orchestrator) and injected here as a capability object, per §9's
/// "EngineHandle" design note — the Balance Manager never holds a
/// back-reference to the Engine itself.
#[async_trait]
pub trait FuelingSubmitter: Send + Sync {
    async fn submit_fueling_transfer(
        &self,
        source: Address,
        target: Address,
        amount: U256,
    ) -> Result<PtxId, String>;
}

struct BalanceCacheEntry {
    balance: U256,
    fetched_at: Instant,
}

/// One outstanding fueling transfer: later callers for the same
/// destination subscribe to the same completion signal instead of
/// submitting a second transfer (§4.2 point 4).
struct InFlightFueling {
    result: watch::Receiver<Option<Result<PtxId, FuelingError>>>,
}

pub struct BalanceManager {
    ledger: Arc<dyn LedgerRpc>,
    config: BalanceManagerConfig,
    cache: RwLock<HashMap<Address, BalanceCacheEntry>>,
    in_flight: RwLock<HashMap<Address, InFlightFueling>>,
}

impl BalanceManager {
    #[must_use]
    pub fn new(config: BalanceManagerConfig, ledger: Arc<dyn LedgerRpc>) -> Self {
        Self {
            ledger,
            config,
            cache: RwLock::new(HashMap::new()),
            in_flight: RwLock::new(HashMap::new()),
        }
    }

    /// Current balance for `address`, TTL-cached; reads are lock-free on
    /// a cache hit in the sense that they only take the shared read lock
    /// (§5: "reads are lock-free on cache hit").
    pub async fn get_balance(&self, address: Address) -> Result<U256, String> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&address) {
                if entry.fetched_at.elapsed() < self.config.balance_cache_ttl {
                    return Ok(entry.balance);
                }
            }
        }

        let balance = self.ledger.get_balance(address).await?;
        self.cache.write().await.insert(
            address,
            BalanceCacheEntry {
                balance,
                fetched_at: Instant::now(),
            },
        );
        Ok(balance)
    }

    /// `required = gasLimit * gasPrice + value`; an IFT whose PTX cannot
    /// afford this is held Stalled-for-Funds (§4.2 point 2).
    #[must_use]
    pub fn required_balance(gas_limit: u64, gas_price: U256, value: U256) -> U256 {
        U256::from(gas_limit).saturating_mul(gas_price).saturating_add(value)
    }

    pub async fn is_affordable(
        &self,
        address: Address,
        gas_limit: u64,
        gas_price: U256,
        value: U256,
    ) -> Result<bool, String> {
        let balance = self.get_balance(address).await?;
        Ok(balance >= Self::required_balance(gas_limit, gas_price, value))
    }

    /// Requests (or attaches to an existing) fueling transfer for
    /// `target`, subject to `is_fueling_tx` forbidding recursion (§9 Open
    /// Question: fueling transfers never themselves request fueling).
    pub async fn ensure_fueling(
        &self,
        target: Address,
        is_fueling_tx: bool,
        submitter: &dyn FuelingSubmitter,
    ) -> Result<PtxId, FuelingError> {
        if is_fueling_tx {
            warn!(%target, "refusing to fuel a transaction that is itself a fueling transfer");
            return Err(FuelingError::NotConfigured);
        }

        let Some(auto_fueling) = self.config.auto_fueling.clone() else {
            return Err(FuelingError::NotConfigured);
        };

        // Fast path: attach to an outstanding transfer for this target.
        if let Some(mut receiver) = self.existing_receiver(target).await {
            loop {
                if let Some(result) = receiver.borrow().clone() {
                    return result;
                }
                if receiver.changed().await.is_err() {
                    return Err(FuelingError::SubmissionFailed(
                        "fueling coordinator dropped".into(),
                    ));
                }
            }
        }

        // Slow path: become the one in-flight request for this target.
        let (sender, receiver) = watch::channel(None);
        self.in_flight
            .write()
            .await
            .insert(target, InFlightFueling { result: receiver });

        let result = self.perform_fueling(target, &auto_fueling, submitter).await;
        let _ = sender.send(Some(result.clone()));
        self.in_flight.write().await.remove(&target);
        result
    }

    async fn existing_receiver(
        &self,
        target: Address,
    ) -> Option<watch::Receiver<Option<Result<PtxId, FuelingError>>>> {
        self.in_flight
            .read()
            .await
            .get(&target)
            .map(|entry| entry.result.clone())
    }

    async fn perform_fueling(
        &self,
        target: Address,
        auto_fueling: &AutoFuelingConfig,
        submitter: &dyn FuelingSubmitter,
    ) -> Result<PtxId, FuelingError> {
        let source_balance = self
            .get_balance(auto_fueling.source_address)
            .await
            .map_err(FuelingError::SubmissionFailed)?;

        let top_up = auto_fueling
            .target_dest_balance
            .saturating_sub(self.get_balance(target).await.map_err(FuelingError::SubmissionFailed)?);

        if source_balance.saturating_sub(top_up) < auto_fueling.source_address_minimum_balance {
            warn!(
                source = %auto_fueling.source_address,
                %source_balance,
                %top_up,
                "refusing to fuel: treasury would fall below its minimum balance"
            );
            return Err(FuelingError::SourceBelowMinimum {
                source: auto_fueling.source_address,
            });
        }

        info!(%target, %top_up, "submitting auto-fueling transfer");
        submitter
            .submit_fueling_transfer(auto_fueling.source_address, target, top_up)
            .await
            .map_err(FuelingError::SubmissionFailed)
    }

    /// Whether `target`'s balance is below the configured trigger (§4.2
    /// point 3), used by the Orchestrator to decide whether to call
    /// `ensure_fueling` at all.
    pub async fn needs_fueling(&self, target: Address) -> Result<bool, String> {
        let Some(auto_fueling) = self.config.auto_fueling.clone() else {
            return Ok(false);
        };
        let balance = self.get_balance(target).await?;
        Ok(balance < auto_fueling.min_dest_balance)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::interfaces::mock::MockLedger;

    struct CountingSubmitter {
        calls: AtomicU32,
    }

    #[async_trait]
    impl FuelingSubmitter for CountingSubmitter {
        async fn submit_fueling_transfer(
            &self,
            _source: Address,
            _target: Address,
            _amount: U256,
        ) -> Result<PtxId, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PtxId(uuid::Uuid::new_v4()))
        }
    }

    fn test_config(source: Address) -> BalanceManagerConfig {
        BalanceManagerConfig {
            balance_cache_ttl: Duration::from_secs(30),
            auto_fueling: Some(AutoFuelingConfig {
                source_address: source,
                source_address_minimum_balance: U256::from(1_000),
                min_dest_balance: U256::from(100),
                target_dest_balance: U256::from(500),
            }),
        }
    }

    #[tokio::test]
    async fn required_balance_matches_formula() {
        let required = BalanceManager::required_balance(21_000, U256::from(10), U256::from(5));
        assert_eq!(required, U256::from(21_000 * 10 + 5));
    }

    #[tokio::test]
    async fn refuses_to_fuel_below_source_minimum() {
        let treasury = Address([0xaa; 20]);
        let target = Address([0xbb; 20]);
        let ledger = Arc::new(MockLedger::new());
        ledger.set_balance(treasury, U256::from(1_200));
        ledger.set_balance(target, U256::from(0));

        let manager = BalanceManager::new(test_config(treasury), ledger);
        let submitter = CountingSubmitter {
            calls: AtomicU32::new(0),
        };

        let result = manager.ensure_fueling(target, false, &submitter).await;
        assert!(matches!(result, Err(FuelingError::SourceBelowMinimum { .. })));
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fuels_when_treasury_has_headroom() {
        let treasury = Address([0xaa; 20]);
        let target = Address([0xbb; 20]);
        let ledger = Arc::new(MockLedger::new());
        ledger.set_balance(treasury, U256::from(10_000));
        ledger.set_balance(target, U256::from(0));

        let manager = BalanceManager::new(test_config(treasury), ledger);
        let submitter = CountingSubmitter {
            calls: AtomicU32::new(0),
        };

        let result = manager.ensure_fueling(target, false, &submitter).await;
        assert!(result.is_ok());
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fueling_tx_never_requests_fueling() {
        let treasury = Address([0xaa; 20]);
        let target = Address([0xbb; 20]);
        let ledger = Arc::new(MockLedger::new());
        ledger.set_balance(treasury, U256::from(10_000));

        let manager = BalanceManager::new(test_config(treasury), ledger);
        let submitter = CountingSubmitter {
            calls: AtomicU32::new(0),
        };

        let result = manager.ensure_fueling(target, true, &submitter).await;
        assert!(result.is_err());
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 0);
    }
}
