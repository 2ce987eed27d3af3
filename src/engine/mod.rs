//! Process-wide Engine (§4.5): owns one Orchestrator per signer, routes
//! incoming requests to the right one, and dispatches confirmed-transaction
//! batches from the block indexer. Grounded on the teacher's
//! `App`/`identity_manager.rs` shape (a single entry point holding a map of
//! per-key workers behind a lock) and on `task_monitor.rs`'s
//! spawn-and-track-a-handle pattern.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::U256;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

mod calldata;

use crate::balance_manager::{BalanceManager, FuelingSubmitter};
use crate::config::Config;
use crate::error::{EngineError, IftError};
use crate::gas_oracle::GasPriceOracle;
use crate::ift::IftDeps;
use crate::interfaces::{
    EventNotifier, IndexedBatch, KeyManager, LedgerRpc, SigningAlgorithm, TransactionStore, UnsignedTx,
};
use crate::orchestrator::{Lifecycle, Orchestrator, OrchestratorCommand};
use crate::types::{Address, GasPrice, PayloadVariant, PtxId, PublicTransaction, TxStatus};
use crate::utils::spawn_monitored_with_backoff;

struct OrchestratorHandle {
    command_tx: tokio::sync::mpsc::Sender<OrchestratorCommand>,
    lifecycle_rx: watch::Receiver<crate::orchestrator::LifecycleSnapshot>,
    join_handle: JoinHandle<()>,
}

/// Owns every live per-signer Orchestrator and the shared collaborators
/// they're built from. Always held behind an `Arc` so it can hand a
/// `FuelingSubmitter` capability back to its own `BalanceManager` without a
/// circular field reference (§9's "EngineHandle" design note).
pub struct Engine {
    config: Config,
    ledger: Arc<dyn LedgerRpc>,
    key_manager: Arc<dyn KeyManager>,
    store: Arc<dyn TransactionStore>,
    notifier: Arc<dyn EventNotifier>,
    gas_oracle: Arc<GasPriceOracle>,
    balance_manager: Arc<BalanceManager>,
    orchestrators: Mutex<HashMap<Address, OrchestratorHandle>>,
    /// Set once by `shutdown` (§8 scenario 6's "under context cancel, the
    /// next call returns `ContextCancelled`"): this crate has no per-call
    /// cancellation token, so the equivalent is a one-way shutdown latch
    /// every request-handling method checks first.
    shutting_down: AtomicBool,
}

impl Engine {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        ledger: Arc<dyn LedgerRpc>,
        key_manager: Arc<dyn KeyManager>,
        store: Arc<dyn TransactionStore>,
        notifier: Arc<dyn EventNotifier>,
    ) -> Arc<Self> {
        let gas_oracle = Arc::new(GasPriceOracle::new(config.gas_oracle.clone(), Some(ledger.clone())));
        let balance_manager = Arc::new(BalanceManager::new(config.balance_manager.clone(), ledger.clone()));

        Arc::new(Self {
            config,
            ledger,
            key_manager,
            store,
            notifier,
            gas_oracle,
            balance_manager,
            orchestrators: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    fn check_not_shutting_down(&self) -> Result<(), EngineError> {
        if self.shutting_down.load(Ordering::Acquire) {
            Err(EngineError::context_cancelled())
        } else {
            Ok(())
        }
    }

    /// §4.5 `HandleNewTransaction`: validates the payload, resolves the
    /// signing key, builds calldata, and (when `gas_limit` is absent)
    /// estimates gas — all synchronously on the caller's path, before any
    /// store write. §8 scenarios 2/3: an estimate that reverts or otherwise
    /// fails is returned here with no PTX ever persisted, not discovered
    /// later as an eventual terminal status. Only once all of that succeeds
    /// is the PTX persisted and routed onto `from`'s Orchestrator, spawning
    /// one if none exists yet. Duplicate `id`s return the already-stored
    /// PTX's id rather than erroring (§9 Open Question: idempotent by
    /// request id).
    #[instrument(level = "info", skip(self, payload), fields(%id, %from))]
    pub async fn handle_new_transaction(
        self: &Arc<Self>,
        id: PtxId,
        from: Address,
        payload: serde_json::Value,
        gas_limit: Option<u64>,
    ) -> Result<PtxId, EngineError> {
        self.check_not_shutting_down()?;
        let payload: PayloadVariant = serde_json::from_value(payload)
            .map_err(|error| EngineError::unsupported_payload_variant(error.to_string()))?;

        self.submit_internal(id, from, payload, gas_limit, false).await
    }

    async fn submit_internal(
        self: &Arc<Self>,
        id: PtxId,
        from: Address,
        payload: PayloadVariant,
        gas_limit: Option<u64>,
        is_fueling_tx: bool,
    ) -> Result<PtxId, EngineError> {
        if let Some(existing) = self
            .store
            .get_transaction_by_id(id)
            .await
            .map_err(EngineError::Store)?
        {
            return Ok(existing.id);
        }

        self.key_manager
            .resolve_key(&from.to_string(), SigningAlgorithm::EcdsaSecp256k1)
            .await
            .map_err(EngineError::KeyResolutionFailed)?;

        let input = calldata::build_calldata(&payload).map_err(EngineError::AbiParseFailed)?;

        let gas_limit = match gas_limit {
            Some(limit) => limit,
            None => {
                let unsigned = UnsignedTx {
                    from,
                    to: payload.to_address(),
                    value: payload.value(),
                    data: input.clone(),
                    nonce: 0,
                    gas_limit: 0,
                    gas_price: GasPrice::zero(),
                };
                self.ledger
                    .gas_estimate(&unsigned)
                    .await
                    .map_err(|message| EngineError::Ift(IftError::from_estimate_failure(message)))?
            }
        };

        let mut ptx = PublicTransaction::new(id, from, payload, input, Some(gas_limit));
        ptx.is_fueling_tx = is_fueling_tx;

        self.store
            .insert_transaction(ptx.clone())
            .await
            .map_err(EngineError::Store)?;

        self.dispatch(from, OrchestratorCommand::Submit(ptx)).await?;
        Ok(id)
    }

    /// §4.5 `HandleSuspendTransaction`: idempotent — suspending an
    /// already-suspended PTX is a no-op, suspending a terminal one is
    /// rejected with `TerminalStatusUpdate`.
    #[instrument(level = "info", skip(self), fields(%id))]
    pub async fn handle_suspend_transaction(self: &Arc<Self>, id: PtxId) -> Result<(), EngineError> {
        self.check_not_shutting_down()?;
        let ptx = self
            .store
            .get_transaction_by_id(id)
            .await
            .map_err(EngineError::Store)?
            .ok_or_else(EngineError::transaction_id_missing)?;

        if ptx.status.is_terminal() {
            return Err(EngineError::terminal_status_update(
                "cannot suspend a transaction that has already reached a terminal status",
            ));
        }
        if ptx.status == TxStatus::Suspended {
            return Ok(());
        }

        self.store
            .update_transaction(
                id,
                crate::interfaces::TransactionUpdate {
                    status: Some(TxStatus::Suspended),
                    ..Default::default()
                },
            )
            .await
            .map_err(EngineError::Store)?;

        self.dispatch(ptx.from, OrchestratorCommand::Suspend(id)).await
    }

    /// §4.5 `HandleResumeTransaction`: idempotent — resuming a PTX that
    /// isn't suspended is a no-op rather than an error.
    #[instrument(level = "info", skip(self), fields(%id))]
    pub async fn handle_resume_transaction(self: &Arc<Self>, id: PtxId) -> Result<(), EngineError> {
        self.check_not_shutting_down()?;
        let ptx = self
            .store
            .get_transaction_by_id(id)
            .await
            .map_err(EngineError::Store)?
            .ok_or_else(EngineError::transaction_id_missing)?;

        if ptx.status.is_terminal() {
            return Err(EngineError::terminal_status_update(
                "cannot resume a transaction that has already reached a terminal status",
            ));
        }
        if ptx.status != TxStatus::Suspended {
            return Ok(());
        }

        self.store
            .update_transaction(
                id,
                crate::interfaces::TransactionUpdate {
                    status: Some(TxStatus::Pending),
                    ..Default::default()
                },
            )
            .await
            .map_err(EngineError::Store)?;

        self.dispatch(ptx.from, OrchestratorCommand::Resume(id)).await
    }

    /// §4.5 `HandleConfirmedTransactions`: groups the batch by signer and
    /// forwards each group to that signer's Orchestrator, if one is
    /// currently live. A signer with no live Orchestrator has nothing
    /// in-flight to confirm, so its events are dropped with a warning.
    #[instrument(level = "info", skip(self, batch), fields(len = batch.len()))]
    pub async fn handle_confirmed_transactions(self: &Arc<Self>, batch: IndexedBatch) {
        let mut by_signer: HashMap<Address, Vec<_>> = HashMap::new();
        for indexed in batch {
            by_signer.entry(indexed.from).or_default().push(indexed);
        }

        let orchestrators = self.orchestrators.lock().await;
        for (signer, events) in by_signer {
            let Some(handle) = orchestrators.get(&signer) else {
                warn!(%signer, "confirmed transactions for a signer with no live orchestrator");
                continue;
            };
            if handle
                .command_tx
                .send(OrchestratorCommand::Confirmed(events))
                .await
                .is_err()
            {
                warn!(%signer, "orchestrator task is gone, dropping confirmed batch");
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, signer: Address, command: OrchestratorCommand) -> Result<(), EngineError> {
        let mut orchestrators = self.orchestrators.lock().await;

        if !orchestrators.contains_key(&signer) {
            let max = self.config.engine.max_in_flight_orchestrators;
            if max >= 0 && orchestrators.len() as i64 >= max {
                return Err(EngineError::OrchestratorBoundReached);
            }
            let handle = self.spawn_orchestrator(signer);
            orchestrators.insert(signer, handle);
            info!(%signer, "spawned orchestrator");
        }

        let handle = orchestrators.get(&signer).expect("just inserted or already present");
        handle
            .command_tx
            .send(command)
            .await
            .map_err(|_| EngineError::Store("orchestrator task is gone".into()))
    }

    fn spawn_orchestrator(self: &Arc<Self>, signer: Address) -> OrchestratorHandle {
        let deps = Arc::new(IftDeps {
            ledger: self.ledger.clone(),
            key_manager: self.key_manager.clone(),
            store: self.store.clone(),
            gas_oracle: self.gas_oracle.clone(),
            balance_manager: self.balance_manager.clone(),
            config: self.config.orchestrator.clone(),
        });

        let fueling_submitter: Arc<dyn FuelingSubmitter> = Arc::new(EngineFuelingHandle(self.clone()));
        let (orchestrator, command_tx, lifecycle_rx) =
            Orchestrator::new(signer, deps, self.notifier.clone(), fueling_submitter);

        let mut orchestrator = Some(orchestrator);
        let join_handle = spawn_monitored_with_backoff("orchestrator", move || {
            let orchestrator = orchestrator
                .take()
                .expect("orchestrator's run loop only ever returns Ok, so it is never restarted");
            orchestrator.run()
        });

        OrchestratorHandle {
            command_tx,
            lifecycle_rx,
            join_handle,
        }
    }

    /// Reaps Orchestrators that have sat `Idle` past `maxOrchestratorIdle`
    /// (§4.5). Dropping an `OrchestratorHandle` drops its `command_tx`,
    /// which the orchestrator's own select loop observes as `None` and
    /// exits gracefully on its next iteration; its `JoinHandle` is not
    /// aborted here, only detached.
    #[instrument(level = "debug", skip(self))]
    async fn reap_idle_orchestrators(self: &Arc<Self>) {
        let idle_timeout = self.config.engine.max_orchestrator_idle;
        let mut orchestrators = self.orchestrators.lock().await;
        orchestrators.retain(|signer, handle| {
            let snapshot = *handle.lifecycle_rx.borrow();
            let reap = snapshot.lifecycle == Lifecycle::Idle && snapshot.state_entered_at.elapsed() >= idle_timeout;
            if reap {
                info!(%signer, "reaping idle orchestrator");
            }
            !reap
        });
    }

    /// Drains and joins every live Orchestrator task (§10): dropping each
    /// `command_tx` makes its select loop observe `None` and exit on its
    /// next iteration, mirroring the teacher's `RunningInstance::shutdown`
    /// broadcast-then-join-all sequence.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::Release);
        let handles: Vec<OrchestratorHandle> = self.orchestrators.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            let OrchestratorHandle {
                command_tx,
                join_handle,
                ..
            } = handle;
            drop(command_tx);
            if let Err(error) = join_handle.await {
                warn!(%error, "orchestrator task panicked during shutdown");
            }
        }
    }

    /// Spawns the Engine's own background janitor loop, reaping idle
    /// Orchestrators on the configured interval. The returned handle is
    /// not awaited by `Engine` itself; callers keep it to bound the
    /// process's shutdown sequence.
    pub fn spawn_janitor(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.engine.interval_duration);
            loop {
                interval.tick().await;
                engine.reap_idle_orchestrators().await;
            }
        })
    }

    #[cfg(test)]
    async fn orchestrator_count(&self) -> usize {
        self.orchestrators.lock().await.len()
    }
}

/// Capability object handed to each Orchestrator's `BalanceManager` call so
/// it can submit a fueling transfer without the Balance Manager (or the
/// Orchestrator) holding a reference back to the `Engine` itself.
struct EngineFuelingHandle(Arc<Engine>);

#[async_trait]
impl FuelingSubmitter for EngineFuelingHandle {
    async fn submit_fueling_transfer(
        &self,
        source: Address,
        target: Address,
        amount: U256,
    ) -> Result<PtxId, String> {
        let id = PtxId(Uuid::new_v4());
        self.0
            .submit_internal(
                id,
                source,
                PayloadVariant::Transfer { to: target, value: amount },
                None,
                true,
            )
            .await
            .map_err(|error| error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{BalanceManagerConfig, EngineConfig, GasOracleConfig, OrchestratorConfig};
    use crate::interfaces::mock::{InMemoryStore, MockKeyManager, MockLedger, MockNotifier};

    fn test_config() -> Config {
        Config {
            engine: EngineConfig {
                interval_duration: Duration::from_millis(10),
                max_in_flight_orchestrators: -1,
                max_orchestrator_idle: Duration::from_millis(50),
            },
            orchestrator: OrchestratorConfig {
                interval_duration: Duration::from_millis(10),
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

    fn test_engine(ledger: Arc<MockLedger>) -> Arc<Engine> {
        Engine::new(
            test_config(),
            ledger,
            Arc::new(MockKeyManager::new()),
            Arc::new(InMemoryStore::new()),
            Arc::new(MockNotifier::new()),
        )
    }

    fn transfer_payload(to: Address) -> serde_json::Value {
        serde_json::json!({ "kind": "transfer", "to": to, "value": "100" })
    }

    #[tokio::test]
    async fn new_transaction_spawns_an_orchestrator_and_is_stored() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_next_nonce(Address([0x11; 20]), 0);
        let engine = test_engine(ledger);

        let id = PtxId(Uuid::new_v4());
        let result = engine
            .handle_new_transaction(id, Address([0x11; 20]), transfer_payload(Address([0x22; 20])), Some(21_000))
            .await
            .unwrap();

        assert_eq!(result, id);
        assert_eq!(engine.orchestrator_count().await, 1);
        assert!(engine.store.get_transaction_by_id(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_id_is_idempotent() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_next_nonce(Address([0x11; 20]), 0);
        let engine = test_engine(ledger);

        let id = PtxId(Uuid::new_v4());
        let from = Address([0x11; 20]);
        let payload = transfer_payload(Address([0x22; 20]));

        engine
            .handle_new_transaction(id, from, payload.clone(), Some(21_000))
            .await
            .unwrap();
        let second = engine
            .handle_new_transaction(id, from, payload, Some(21_000))
            .await
            .unwrap();

        assert_eq!(second, id);
        assert_eq!(engine.orchestrator_count().await, 1);
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_as_unsupported() {
        let ledger = Arc::new(MockLedger::new());
        let engine = test_engine(ledger);

        let id = PtxId(Uuid::new_v4());
        let bad_payload = serde_json::json!({ "kind": "not_a_real_variant" });

        let err = engine
            .handle_new_transaction(id, Address([0x11; 20]), bad_payload, None)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::UnsupportedPayloadVariant(..)));
        assert!(err.is_submission_rejected());
    }

    #[tokio::test]
    async fn suspend_on_unknown_id_reports_transaction_id_missing() {
        let ledger = Arc::new(MockLedger::new());
        let engine = test_engine(ledger);

        let err = engine
            .handle_suspend_transaction(PtxId(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TransactionIdMissing(_)));
    }

    #[tokio::test]
    async fn suspend_is_idempotent_when_already_suspended() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_next_nonce(Address([0x11; 20]), 0);
        let engine = test_engine(ledger);

        let id = PtxId(Uuid::new_v4());
        engine
            .handle_new_transaction(id, Address([0x11; 20]), transfer_payload(Address([0x22; 20])), Some(21_000))
            .await
            .unwrap();

        engine.handle_suspend_transaction(id).await.unwrap();
        engine.handle_suspend_transaction(id).await.unwrap();

        let stored = engine.store.get_transaction_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status, TxStatus::Suspended);
    }

    #[tokio::test]
    async fn orchestrator_bound_reached_rejects_a_new_signer() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_next_nonce(Address([0x11; 20]), 0);
        ledger.set_next_nonce(Address([0x33; 20]), 0);

        let mut config = test_config();
        config.engine.max_in_flight_orchestrators = 1;

        let engine = Engine::new(
            config,
            ledger,
            Arc::new(MockKeyManager::new()),
            Arc::new(InMemoryStore::new()),
            Arc::new(MockNotifier::new()),
        );

        engine
            .handle_new_transaction(
                PtxId(Uuid::new_v4()),
                Address([0x11; 20]),
                transfer_payload(Address([0x22; 20])),
                Some(21_000),
            )
            .await
            .unwrap();

        let err = engine
            .handle_new_transaction(
                PtxId(Uuid::new_v4()),
                Address([0x33; 20]),
                transfer_payload(Address([0x22; 20])),
                Some(21_000),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::OrchestratorBoundReached));
    }
}
