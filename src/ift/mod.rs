//! In-flight transaction stage controller (§4.3). Drives a single PTX
//! from nonce assignment through confirmation. Grounded on the teacher's
//! `identity_committer/tasks/*` (read state, decide, perform I/O, persist)
//! and the stage-tagged-variant shape of `identity_tree/status.rs`.
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use ethers::types::U256;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::balance_manager::BalanceManager;
use crate::config::OrchestratorConfig;
use crate::error::IftError;
use crate::gas_oracle::GasPriceOracle;
use crate::interfaces::indexer::IndexedTransaction;
use crate::interfaces::ledger::{ReceiptResult, UnsignedTx};
use crate::interfaces::{KeyManager, LedgerRpc, TransactionStore};
use crate::types::{Address, GasPrice, PayloadVariant, PtxId, SubStatus, SubmissionAttempt, TxHash};

/// Stage diagram from §4.3. `Suspended` and `StalledForFunds` are lateral
/// states reachable from any non-terminal stage; `suspended_from` records
/// where to resume to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IftStage {
    Received,
    SigningPending,
    Signed,
    SubmissionPending,
    Submitted,
    Tracking,
    RetryGasBump,
    Confirmed,
    Failed,
    Suspended,
    StalledForFunds,
}

impl IftStage {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

/// Dependencies an IFT needs to advance, bundled so `Orchestrator::tick`
/// can pass one reference per tick instead of threading five.
pub struct IftDeps {
    pub ledger: Arc<dyn LedgerRpc>,
    pub key_manager: Arc<dyn KeyManager>,
    pub store: Arc<dyn TransactionStore>,
    pub gas_oracle: Arc<GasPriceOracle>,
    pub balance_manager: Arc<BalanceManager>,
    pub config: OrchestratorConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Made progress; caller should keep ticking this IFT.
    Advanced,
    /// Nothing to do this tick (e.g. waiting on tracker staleness window).
    Idle,
    /// Reached `Confirmed`.
    Confirmed,
    /// Reached `Failed`; `retryable` is false (Fatal) or true in the
    /// narrow sense that the orchestrator may still retry a *different*
    /// payload (it never retries the same one once Failed).
    Failed,
    /// Entered `StalledForFunds`.
    StalledForFunds,
}

pub struct Ift {
    pub ptx_id: PtxId,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub payload: PayloadVariant,
    pub input: Vec<u8>,
    pub is_fueling_tx: bool,
    pub stage: IftStage,
    suspended_from: Option<Box<IftStage>>,
    pub nonce: Option<u64>,
    pub gas_limit: Option<u64>,
    pub gas_price: Option<GasPrice>,
    pub latest_attempt: Option<SubmissionAttempt>,
    pub attempts: Vec<SubmissionAttempt>,
    last_submitted_at: Option<Instant>,
    pub warning_count: u32,
    pub error_count: u32,
    gas_cap_warned: bool,
}

impl Ift {
    #[must_use]
    pub fn new(
        ptx_id: PtxId,
        from: Address,
        payload: PayloadVariant,
        input: Vec<u8>,
        gas_limit: Option<u64>,
        is_fueling_tx: bool,
    ) -> Self {
        Self {
            ptx_id,
            from,
            to: payload.to_address(),
            value: payload.value(),
            payload,
            input,
            is_fueling_tx,
            stage: IftStage::Received,
            suspended_from: None,
            nonce: None,
            gas_limit,
            gas_price: None,
            latest_attempt: None,
            attempts: Vec::new(),
            last_submitted_at: None,
            warning_count: 0,
            error_count: 0,
            gas_cap_warned: false,
        }
    }

    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        matches!(self.stage, IftStage::Suspended)
    }

    #[must_use]
    pub const fn is_stalled(&self) -> bool {
        matches!(self.stage, IftStage::StalledForFunds)
    }

    /// Called by the Orchestrator under the per-signer nonce lock (§4.3
    /// `assignNonce`).
    #[instrument(level = "debug", skip(self, deps), fields(ptx = %self.ptx_id))]
    pub async fn assign_nonce(&mut self, deps: &IftDeps, next_nonce_hint: u64) -> Result<u64, IftError> {
        let nonce = next_nonce_hint;
        deps.store
            .update_transaction(
                self.ptx_id,
                crate::interfaces::store::TransactionUpdate {
                    nonce: Some(nonce),
                    ..Default::default()
                },
            )
            .await
            .map_err(IftError::StoreFailed)?;
        self.record_sub_status(deps, SubStatus::AssignNonce, "assign_nonce", None, None)
            .await;
        self.nonce = Some(nonce);
        Ok(nonce)
    }

    async fn record_sub_status(
        &self,
        deps: &IftDeps,
        sub_status: SubStatus,
        action: &str,
        info: Option<String>,
        err: Option<String>,
    ) {
        if let Err(store_err) = deps
            .store
            .update_sub_status(self.ptx_id, sub_status, action, info, err)
            .await
        {
            warn!(ptx = %self.ptx_id, error = %store_err, "failed to persist sub-status");
        }
    }

    fn unsigned_tx(&self) -> UnsignedTx {
        UnsignedTx {
            from: self.from,
            to: self.to,
            value: self.value,
            data: self.input.clone(),
            nonce: self.nonce.unwrap_or(0),
            gas_limit: self.gas_limit.unwrap_or(0),
            gas_price: self.gas_price.unwrap_or_else(GasPrice::zero),
        }
    }

    /// §4.3 `estimateAndSign`: estimates gas if absent, classifies
    /// "execution reverted" as Fatal, signs via the key manager.
    #[instrument(level = "debug", skip(self, deps), fields(ptx = %self.ptx_id))]
    pub async fn estimate_and_sign(&mut self, deps: &IftDeps) -> Result<(), IftError> {
        if self.gas_limit.is_none() {
            let estimate = deps
                .ledger
                .gas_estimate(&self.unsigned_tx())
                .await
                .map_err(IftError::from_estimate_failure)?;
            self.gas_limit = Some(estimate);
        }

        if self.gas_price.is_none() {
            self.gas_price = Some(
                deps.gas_oracle
                    .get_gas_price()
                    .await
                    .map_err(|e| IftError::EstimateFailed(e.to_string()))?,
            );
        }

        let key_identifier = self.from.to_string();
        let (key_handle, _address) = deps
            .key_manager
            .resolve_key(&key_identifier, crate::interfaces::SigningAlgorithm::EcdsaSecp256k1)
            .await
            .map_err(IftError::SigningFailed)?;

        let unsigned = self.unsigned_tx();
        let signed_raw = deps
            .key_manager
            .sign(&key_handle, &bincode_like_encode(&unsigned))
            .await
            .map_err(IftError::SigningFailed)?;

        self.latest_attempt = Some(SubmissionAttempt {
            attempt_id: Uuid::new_v4(),
            nonce: self.nonce.unwrap_or(0),
            gas_price: self.gas_price.unwrap_or_else(GasPrice::zero),
            signed_raw: signed_raw.into(),
            tx_hash: TxHash([0; 32]),
            submitted_at: Utc::now(),
        });

        self.stage = IftStage::Signed;
        self.record_sub_status(deps, SubStatus::Signed, "sign", None, None).await;
        Ok(())
    }

    /// §4.3 `submit`: sends the signed transaction; "already known"/"nonce
    /// too low"/"replacement underpriced" defer to the tracker instead of
    /// failing.
    #[instrument(level = "debug", skip(self, deps), fields(ptx = %self.ptx_id))]
    pub async fn submit(&mut self, deps: &IftDeps) -> Result<(), IftError> {
        let Some(attempt) = self.latest_attempt.clone() else {
            return Err(IftError::SubmissionFailed("no signed attempt to submit".into()));
        };

        match deps.ledger.send_raw_transaction(&attempt.signed_raw).await {
            Ok(hash) => {
                let mut attempt = attempt;
                attempt.tx_hash = hash;
                self.attempts.push(attempt.clone());
                self.latest_attempt = Some(attempt);
                self.last_submitted_at = Some(Instant::now());
                self.stage = IftStage::Submitted;
                info!(ptx = %self.ptx_id, nonce = ?self.nonce, hash = %attempt.tx_hash, "submitted transaction");
                self.record_sub_status(deps, SubStatus::Submitted, "submit", None, None).await;
                Ok(())
            }
            Err(message) => {
                let lower = message.to_lowercase();
                if lower.contains("already known")
                    || lower.contains("nonce too low")
                    || lower.contains("replacement underpriced")
                {
                    info!(ptx = %self.ptx_id, %message, "submission deferred to tracker");
                    // Defer to the tracker rather than failing outright.
                    self.attempts.push(attempt.clone());
                    self.last_submitted_at = Some(Instant::now());
                    self.stage = IftStage::Submitted;
                    self.record_sub_status(
                        deps,
                        SubStatus::Submitted,
                        "submit",
                        Some(format!("deferring to tracker: {message}")),
                        None,
                    )
                    .await;
                    Ok(())
                } else {
                    Err(IftError::SubmissionFailed(message))
                }
            }
        }
    }

    /// §4.3 `track`: polls for a receipt; on staleness past the threshold
    /// plus margin, enters `RetryGasBump`.
    #[instrument(level = "debug", skip(self, deps), fields(ptx = %self.ptx_id))]
    pub async fn track(&mut self, deps: &IftDeps) -> Result<StepOutcome, IftError> {
        self.stage = IftStage::Tracking;
        let Some(attempt) = self.latest_attempt.clone() else {
            return Err(IftError::TrackingFailed("no submitted attempt to track".into()));
        };

        self.record_sub_status(deps, SubStatus::Tracking, "track", None, None).await;

        if let Some(receipt) = deps
            .ledger
            .get_transaction_receipt(attempt.tx_hash)
            .await
            .map_err(IftError::TrackingFailed)?
        {
            return match receipt.result {
                ReceiptResult::Success => {
                    self.stage = IftStage::Confirmed;
                    self.record_sub_status(deps, SubStatus::Confirmed, "confirmed", None, None).await;
                    Ok(StepOutcome::Confirmed)
                }
                ReceiptResult::Failed => {
                    self.stage = IftStage::Failed;
                    self.record_sub_status(deps, SubStatus::Failed, "reverted", None, None).await;
                    Ok(StepOutcome::Failed)
                }
            };
        }

        let elapsed = self
            .last_submitted_at
            .map_or(Duration::ZERO, |t| t.elapsed());
        if elapsed < deps.config.staleness_threshold {
            return Ok(StepOutcome::Idle);
        }

        let current_price = deps
            .gas_oracle
            .get_gas_price()
            .await
            .map_err(|e| IftError::EstimateFailed(e.to_string()))?;

        let margin_exceeded = current_price
            .effective_price()
            .saturating_sub(attempt.gas_price.effective_price())
            >= deps.config.staleness_margin;

        if !margin_exceeded {
            return Ok(StepOutcome::Idle);
        }

        if attempt.gas_price.at_ceiling(deps.config.gas_price_increase_max) {
            if !self.gas_cap_warned {
                warn!(ptx = %self.ptx_id, "gas price increase ceiling reached; continuing to track indefinitely");
                self.record_sub_status(
                    deps,
                    SubStatus::Stalled,
                    "gas_price_cap_reached",
                    Some("gas_price_cap_reached".into()),
                    None,
                )
                .await;
                self.gas_cap_warned = true;
            }
            return Ok(StepOutcome::Idle);
        }

        let bumped = attempt.gas_price.bump(
            deps.config.gas_price_increase_percent,
            deps.config.gas_price_increase_absolute,
            deps.config.gas_price_increase_max,
        );
        self.gas_price = Some(bumped);
        self.stage = IftStage::RetryGasBump;
        self.record_sub_status(deps, SubStatus::GasBumped, "gas_bump", None, None).await;
        Ok(StepOutcome::Advanced)
    }

    /// §4.3 `onConfirmed`: invoked by the Engine when the block indexer
    /// reports a match by `(from, nonce)`. Out-of-band hash mismatches are
    /// classified `NonceConsumedOutOfBand`.
    #[instrument(level = "debug", skip(self, deps, indexed), fields(ptx = %self.ptx_id))]
    pub async fn on_confirmed(
        &mut self,
        deps: &IftDeps,
        indexed: &IndexedTransaction,
    ) -> Result<StepOutcome, IftError> {
        if let Some(attempt) = &self.latest_attempt {
            if attempt.tx_hash != indexed.hash {
                self.stage = IftStage::Failed;
                self.record_sub_status(
                    deps,
                    SubStatus::Failed,
                    "nonce_consumed_out_of_band",
                    Some(format!("observed {}", indexed.hash)),
                    None,
                )
                .await;
                return Err(IftError::NonceConsumedOutOfBand {
                    nonce: indexed.nonce,
                    observed_hash: indexed.hash.to_string(),
                });
            }
        }

        match indexed.result {
            ReceiptResult::Success => {
                self.stage = IftStage::Confirmed;
                self.record_sub_status(deps, SubStatus::Confirmed, "confirmed", None, None).await;
                Ok(StepOutcome::Confirmed)
            }
            ReceiptResult::Failed => {
                self.stage = IftStage::Failed;
                self.record_sub_status(deps, SubStatus::Failed, "reverted", None, None).await;
                Ok(StepOutcome::Failed)
            }
        }
    }

    /// §4.3 `suspend`: moves to `Suspended` from any non-terminal stage.
    pub fn suspend(&mut self) {
        if self.stage.is_terminal() || matches!(self.stage, IftStage::Suspended) {
            return;
        }
        self.suspended_from = Some(Box::new(self.stage.clone()));
        self.stage = IftStage::Suspended;
    }

    /// §4.3 `resume`: moves from `Suspended` back to the prior stage.
    pub fn resume(&mut self) {
        if let IftStage::Suspended = self.stage {
            if let Some(prior) = self.suspended_from.take() {
                self.stage = *prior;
            } else {
                self.stage = IftStage::Received;
            }
        }
    }

    /// §4.2: checks affordability; holds the IFT at `StalledForFunds` if
    /// the PTX cannot be paid for right now.
    pub async fn check_affordable(&mut self, deps: &IftDeps) -> Result<bool, IftError> {
        let gas_limit = self.gas_limit.unwrap_or(21_000);
        let gas_price = self
            .gas_price
            .unwrap_or_else(GasPrice::zero)
            .effective_price();

        let affordable = deps
            .balance_manager
            .is_affordable(self.from, gas_limit, gas_price, self.value)
            .await
            .map_err(IftError::StoreFailed)?;

        if affordable {
            if matches!(self.stage, IftStage::StalledForFunds) {
                self.stage = IftStage::SigningPending;
            }
        } else {
            self.stage = IftStage::StalledForFunds;
            self.record_sub_status(deps, SubStatus::Stalled, "stalled_for_funds", None, None).await;
        }
        Ok(affordable)
    }
}

/// Best-effort deterministic serialization used only to hand the key
/// manager a stable byte representation to sign; production key managers
/// would instead receive properly RLP/typed-transaction-encoded bytes,
/// which is the responsibility of the (external) `LedgerRpc`/signer
/// integration, not this crate.
fn bincode_like_encode(tx: &UnsignedTx) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&tx.from.0);
    if let Some(to) = tx.to {
        out.extend_from_slice(&to.0);
    }
    out.extend_from_slice(&tx.nonce.to_be_bytes());
    out.extend_from_slice(&tx.gas_limit.to_be_bytes());
    out.extend_from_slice(&tx.data);
    out
}
