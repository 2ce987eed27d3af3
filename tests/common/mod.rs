//! Shared scenario-test scaffolding. Each integration test builds its own
//! `Engine` against the in-memory reference collaborators and drives it
//! through `HandleNewTransaction`/`HandleSuspendTransaction`/etc.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ethers::types::U256;
use pubtx_engine::config::{
    BalanceManagerConfig, Config, EngineConfig, GasOracleConfig, OrchestratorConfig,
};
use pubtx_engine::interfaces::mock::{InMemoryStore, MockKeyManager, MockLedger, MockNotifier};
use pubtx_engine::interfaces::{ReceiptResult, TransactionStore};
use pubtx_engine::types::{Address, PtxId, TxHash};
use pubtx_engine::Engine;

#[must_use]
pub fn fast_config() -> Config {
    Config {
        engine: EngineConfig {
            interval_duration: Duration::from_millis(5),
            max_in_flight_orchestrators: -1,
            max_orchestrator_idle: Duration::from_secs(600),
        },
        orchestrator: OrchestratorConfig {
            interval_duration: Duration::from_millis(5),
            max_in_flight_transactions: -1,
            submission_retry_count: 3,
            gas_price_increase_max: U256::from(1_000_000_000u64),
            gas_price_increase_percent: 10,
            gas_price_increase_absolute: U256::from(1),
            staleness_threshold: Duration::from_secs(1_000),
            staleness_margin: U256::from(1),
        },
        gas_oracle: GasOracleConfig::Zero,
        balance_manager: BalanceManagerConfig::default(),
    }
}

pub struct TestHarness {
    pub engine: Arc<Engine>,
    pub ledger: Arc<MockLedger>,
    pub notifier: Arc<MockNotifier>,
    pub store: Arc<dyn TransactionStore>,
}

#[must_use]
pub fn harness_with_config(config: Config) -> TestHarness {
    let ledger = Arc::new(MockLedger::new());
    let notifier = Arc::new(MockNotifier::new());
    let store: Arc<dyn TransactionStore> = Arc::new(InMemoryStore::new());
    let engine = Engine::new(
        config,
        ledger.clone(),
        Arc::new(MockKeyManager::new()),
        store.clone(),
        notifier.clone(),
    );
    TestHarness {
        engine,
        ledger,
        notifier,
        store,
    }
}

#[must_use]
pub fn harness() -> TestHarness {
    harness_with_config(fast_config())
}

#[must_use]
pub fn new_id() -> PtxId {
    PtxId(uuid::Uuid::new_v4())
}

#[must_use]
pub fn signer(byte: u8) -> Address {
    Address([byte; 20])
}

#[must_use]
pub fn transfer_payload(to: Address, value: u64) -> serde_json::Value {
    serde_json::json!({ "kind": "transfer", "to": to, "value": value.to_string() })
}

/// Funds `address` well above anything these tests transfer, since
/// `BalanceManager::is_affordable` is checked against the real ledger
/// balance regardless of whether a scenario cares about balances.
pub fn fund(ledger: &MockLedger, address: Address, amount: u64) {
    ledger.set_balance(address, U256::from(amount));
}

/// Replicates `MockLedger::synthesize_hash`'s numbering so tests can
/// pre-arm receipts for transactions they are about to submit, without
/// reaching into `Ift`'s private `latest_attempt` state.
#[must_use]
pub fn synthetic_hash(n: u64) -> TxHash {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    TxHash(bytes)
}

/// Pre-arms receipts for the next `count` transactions `ledger` will be
/// asked to submit, starting at synthesized hash index `start`.
pub fn confirm_next_submissions(ledger: &MockLedger, start: u64, count: u64, result: ReceiptResult) {
    for (offset, n) in (start..start + count).enumerate() {
        ledger.confirm(synthetic_hash(n), 1 + offset as u64, result);
    }
}

/// Polls `condition` every `step` until it returns `true` or `timeout`
/// elapses, since the Orchestrator advances IFTs on its own poll loop
/// rather than synchronously within `HandleNewTransaction`.
pub async fn wait_until<F, Fut>(timeout: Duration, step: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(step).await;
    }
}

/// Fetches `id`'s current status from `store`, if it exists yet.
pub async fn status_of(store: &Arc<dyn TransactionStore>, id: PtxId) -> Option<pubtx_engine::types::TxStatus> {
    store.get_transaction_by_id(id).await.ok().flatten().map(|ptx| ptx.status)
}
