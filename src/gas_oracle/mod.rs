//! Gas-price oracle (§4.1). Grounded on the teacher's `Cache<...>`
//! gas-oracle middleware stack in `ethereum/mod.rs`: a TTL-cached wrapper
//! around a pluggable source, with concurrent callers during a refresh
//! coalescing onto one upstream call.
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use prometheus::{register_gauge, Gauge};
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::config::GasOracleConfig;
use crate::error::{FailureClass, IftError};
use crate::interfaces::LedgerRpc;
use crate::types::GasPrice;

static GAS_PRICE_GAUGE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "pubtx_gas_price_wei",
        "Last gas price returned by the oracle (legacy price or EIP-1559 max fee)."
    )
    .unwrap()
});

#[derive(Debug, thiserror::Error)]
pub enum GasOracleError {
    #[error("gas price unavailable: {0}")]
    Unavailable(String),
}

impl GasOracleError {
    #[must_use]
    pub const fn classify(&self) -> FailureClass {
        FailureClass::Retryable
    }
}

impl From<GasOracleError> for IftError {
    fn from(err: GasOracleError) -> Self {
        Self::EstimateFailed(err.to_string())
    }
}

struct CacheEntry {
    price: GasPrice,
    fetched_at: Instant,
}

/// Produces the current recommended gas price, TTL-cached, with a
/// pluggable source and in-flight-refresh coalescing (§4.1).
pub struct GasPriceOracle {
    ledger: Option<Arc<dyn LedgerRpc>>,
    config: GasOracleConfig,
    cache: Mutex<Option<CacheEntry>>,
}

impl GasPriceOracle {
    #[must_use]
    pub fn new(config: GasOracleConfig, ledger: Option<Arc<dyn LedgerRpc>>) -> Self {
        Self {
            ledger,
            config,
            cache: Mutex::new(None),
        }
    }

    /// Never returns a negative price (guaranteed by `GasPrice`'s `U256`
    /// backing, which cannot be negative); on total failure surfaces
    /// `GasOracleError::Unavailable` (§4.1 contract).
    #[instrument(level = "debug", skip_all)]
    pub async fn get_gas_price(&self) -> Result<GasPrice, GasOracleError> {
        match &self.config {
            GasOracleConfig::Fixed { price } => Ok(GasPrice::Legacy(*price)),
            GasOracleConfig::Zero => Ok(GasPrice::zero()),
            GasOracleConfig::NodeDerived { cache_ttl } => self.node_derived(*cache_ttl).await,
        }
    }

    async fn node_derived(&self, ttl: Duration) -> Result<GasPrice, GasOracleError> {
        // Holding the mutex across the (possibly slow) RPC call is exactly
        // the coalescing behavior §4.1 asks for: concurrent callers queue
        // behind the single in-flight refresh rather than each issuing
        // their own upstream request.
        let mut cache = self.cache.lock().await;

        if let Some(entry) = cache.as_ref() {
            if entry.fetched_at.elapsed() < ttl {
                return Ok(entry.price);
            }
        }

        let ledger = self
            .ledger
            .as_ref()
            .ok_or_else(|| GasOracleError::Unavailable("no ledger RPC configured".into()))?;

        match ledger.get_gas_price().await {
            Ok(price) => {
                GAS_PRICE_GAUGE.set(price.effective_price().as_u128() as f64);
                *cache = Some(CacheEntry {
                    price,
                    fetched_at: Instant::now(),
                });
                Ok(price)
            }
            Err(err) => {
                if let Some(entry) = cache.as_ref() {
                    warn!(%err, "gas price refresh failed, serving last-known value");
                    Ok(entry.price)
                } else {
                    Err(GasOracleError::Unavailable(err))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use ethers::types::U256;

    use super::*;
    use crate::interfaces::ledger::{Receipt, UnsignedTx};
    use crate::types::{Address, TxHash};

    struct FlakyLedger {
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl LedgerRpc for FlakyLedger {
        async fn gas_estimate(&self, _tx: &UnsignedTx) -> Result<u64, String> {
            unimplemented!()
        }
        async fn get_transaction_count(&self, _a: Address, _p: bool) -> Result<u64, String> {
            unimplemented!()
        }
        async fn send_raw_transaction(&self, _raw: &[u8]) -> Result<TxHash, String> {
            unimplemented!()
        }
        async fn get_transaction_receipt(&self, _h: TxHash) -> Result<Option<Receipt>, String> {
            unimplemented!()
        }
        async fn get_balance(&self, _a: Address) -> Result<U256, String> {
            unimplemented!()
        }
        async fn get_gas_price(&self) -> Result<GasPrice, String> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                Ok(GasPrice::Legacy(U256::from(42)))
            } else {
                Err("node unreachable".into())
            }
        }
    }

    #[tokio::test]
    async fn fixed_source_never_calls_ledger() {
        let oracle = GasPriceOracle::new(
            GasOracleConfig::Fixed {
                price: U256::from(7),
            },
            None,
        );
        let price = oracle.get_gas_price().await.unwrap();
        assert_eq!(price, GasPrice::Legacy(U256::from(7)));
    }

    #[tokio::test]
    async fn zero_source_returns_zero() {
        let oracle = GasPriceOracle::new(GasOracleConfig::Zero, None);
        assert_eq!(oracle.get_gas_price().await.unwrap(), GasPrice::zero());
    }

    #[tokio::test]
    async fn node_derived_falls_back_to_last_known_value_on_failure() {
        let ledger = Arc::new(FlakyLedger {
            calls: std::sync::atomic::AtomicU32::new(0),
        });
        let oracle = GasPriceOracle::new(
            GasOracleConfig::NodeDerived {
                cache_ttl: Duration::from_millis(0),
            },
            Some(ledger),
        );

        let first = oracle.get_gas_price().await.unwrap();
        assert_eq!(first, GasPrice::Legacy(U256::from(42)));

        // TTL expired immediately, but the upstream call now fails; we
        // must still get the last-known value rather than an error.
        let second = oracle.get_gas_price().await.unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn node_derived_without_ledger_surfaces_unavailable() {
        let oracle = GasPriceOracle::new(
            GasOracleConfig::NodeDerived {
                cache_ttl: Duration::from_secs(10),
            },
            None,
        );
        assert!(oracle.get_gas_price().await.is_err());
    }
}
