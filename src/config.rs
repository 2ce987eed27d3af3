use std::path::Path;
use std::time::Duration;

use ethers::types::U256;
use serde::{Deserialize, Serialize};

use crate::types::Address;

/// Loads configuration by layering a config file (if given) under
/// environment variables prefixed `PTX__`, mirroring the teacher's
/// `load_config` in `config.rs` (`config::Config::builder()` +
/// `config::Environment::with_prefix`).
pub fn load_config(config_file_path: Option<&Path>) -> anyhow::Result<Config> {
    let mut settings = config::Config::builder();

    if let Some(path) = config_file_path {
        settings = settings.add_source(config::File::from(path).required(true));
    }

    let settings = settings
        .add_source(
            config::Environment::with_prefix("PTX")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize::<Config>()?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub orchestrator: OrchestratorConfig,
    pub gas_oracle: GasOracleConfig,
    #[serde(default)]
    pub balance_manager: BalanceManagerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine poll period (§6 `engine.intervalDuration`).
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::engine_interval")]
    pub interval_duration: Duration,

    /// Global cap on live Orchestrators; `-1` = unlimited (§6
    /// `engine.maxInFlightOrchestrators`).
    #[serde(default = "default::max_in_flight_orchestrators")]
    pub max_in_flight_orchestrators: i64,

    /// Reap idle Orchestrators after this much inactivity (§6
    /// `engine.maxOrchestratorIdle`).
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::max_orchestrator_idle")]
    pub max_orchestrator_idle: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Orchestrator poll period (§6 `orchestrator.intervalDuration`).
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::orchestrator_interval")]
    pub interval_duration: Duration,

    /// Per-signer cap on in-flight transactions; `-1` = unlimited (§6
    /// `orchestrator.maxInFlightTransactions`).
    #[serde(default = "default::max_in_flight_transactions")]
    pub max_in_flight_transactions: i64,

    /// Retries for transient submit errors (§6
    /// `orchestrator.submissionRetryCount`).
    #[serde(default = "default::submission_retry_count")]
    pub submission_retry_count: u32,

    /// Absolute ceiling on bumped gas price (§6
    /// `orchestrator.gasPriceIncreaseMax`).
    #[serde(default = "default::gas_price_increase_max")]
    pub gas_price_increase_max: U256,

    /// Relative bump percentage (§6 `orchestrator.gasPriceIncreasePercent`).
    #[serde(default = "default::gas_price_increase_percent")]
    pub gas_price_increase_percent: u32,

    /// Absolute bump floor, added to `previousGasPrice` alongside the
    /// percentage bump (§4.3).
    #[serde(default = "default::gas_price_increase_absolute")]
    pub gas_price_increase_absolute: U256,

    /// How long a submitted transaction may go unconfirmed before it is
    /// eligible for a gas-price bump (§4.3 "staleness threshold").
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::staleness_threshold")]
    pub staleness_threshold: Duration,

    /// Minimum amount the current gas price must exceed the submitted
    /// price by before a bump is triggered (§4.3 "margin").
    #[serde(default = "default::staleness_margin")]
    pub staleness_margin: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source")]
pub enum GasOracleConfig {
    Fixed { price: U256 },
    Zero,
    NodeDerived {
        #[serde(with = "humantime_serde")]
        #[serde(default = "default::gas_oracle_ttl")]
        cache_ttl: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BalanceManagerConfig {
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::balance_cache_ttl")]
    pub balance_cache_ttl: Duration,

    #[serde(default)]
    pub auto_fueling: Option<AutoFuelingConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoFuelingConfig {
    /// Treasury signer (§6 `balanceManager.autoFueling.sourceAddress`).
    pub source_address: Address,

    /// Refuse to fuel below this balance (§6
    /// `balanceManager.autoFueling.sourceAddressMinimumBalance`).
    pub source_address_minimum_balance: U256,

    /// Trigger fueling below this balance (§6
    /// `balanceManager.autoFueling.minDestBalance`).
    pub min_dest_balance: U256,

    /// Top up to this balance (§6
    /// `balanceManager.autoFueling.targetDestBalance`).
    pub target_dest_balance: U256,
}

mod default {
    use std::time::Duration;

    use ethers::types::U256;

    pub const fn engine_interval() -> Duration {
        Duration::from_secs(5)
    }

    pub const fn max_in_flight_orchestrators() -> i64 {
        -1
    }

    pub const fn max_orchestrator_idle() -> Duration {
        Duration::from_secs(600)
    }

    pub const fn orchestrator_interval() -> Duration {
        Duration::from_secs(2)
    }

    pub const fn max_in_flight_transactions() -> i64 {
        50
    }

    pub const fn submission_retry_count() -> u32 {
        3
    }

    pub fn gas_price_increase_max() -> U256 {
        U256::from(500_000_000_000u64)
    }

    pub const fn gas_price_increase_percent() -> u32 {
        10
    }

    pub fn gas_price_increase_absolute() -> U256 {
        U256::from(1_000_000_000u64)
    }

    pub const fn staleness_threshold() -> Duration {
        Duration::from_secs(120)
    }

    pub fn staleness_margin() -> U256 {
        U256::from(1_000_000_000u64)
    }

    pub const fn gas_oracle_ttl() -> Duration {
        Duration::from_secs(10)
    }

    pub const fn balance_cache_ttl() -> Duration {
        Duration::from_secs(15)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_deserializes_from_minimal_json() {
        let json = serde_json::json!({
            "engine": {},
            "orchestrator": {},
            "gas_oracle": { "source": "zero" },
        });

        let config: Config = serde_json::from_value(json).unwrap();
        assert_eq!(config.engine.max_in_flight_orchestrators, -1);
        assert_eq!(config.orchestrator.submission_retry_count, 3);
        assert_eq!(config.gas_oracle, GasOracleConfig::Zero);
    }

    #[test]
    fn fixed_gas_oracle_config_round_trips() {
        let json = serde_json::json!({
            "engine": {},
            "orchestrator": {},
            "gas_oracle": { "source": "fixed", "price": "1000000000" },
        });
        let config: Config = serde_json::from_value(json).unwrap();
        assert_eq!(
            config.gas_oracle,
            GasOracleConfig::Fixed {
                price: U256::from(1_000_000_000u64)
            }
        );
    }
}
