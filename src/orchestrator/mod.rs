//! Per-signer Orchestrator (§4.4): owns one signer's nonce sequence,
//! advances each of its in-flight transactions a step per tick, and reaps
//! confirmed/failed IFTs only when contiguous from the reap cursor.
//! Grounded on the teacher's `task_monitor.rs` poll-loop shape (an
//! `tokio::time::interval` tick combined with a command channel) and on
//! `identity_committer`'s ordered-processing-by-position discipline.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tracing::{info, instrument, warn};

use crate::balance_manager::FuelingSubmitter;
use crate::error::OrchestratorError;
use crate::ift::{Ift, IftDeps, IftStage, StepOutcome};
use crate::interfaces::{EventNotifier, IndexedTransaction, ProgressEvent};
use crate::types::{Address, PtxId, PublicTransaction, SubStatus, TxStatus};

#[derive(Debug)]
pub enum OrchestratorCommand {
    Submit(PublicTransaction),
    Suspend(PtxId),
    Resume(PtxId),
    Confirmed(Vec<IndexedTransaction>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Running,
}

#[derive(Clone, Copy, Debug)]
pub struct LifecycleSnapshot {
    pub lifecycle: Lifecycle,
    pub state_entered_at: Instant,
}

pub struct Orchestrator {
    signer: Address,
    deps: Arc<IftDeps>,
    notifier: Arc<dyn EventNotifier>,
    fueling_submitter: Arc<dyn FuelingSubmitter>,
    backlog: VecDeque<PublicTransaction>,
    /// Admitted, nonce-assigned IFTs, ordered by nonce.
    admitted: BTreeMap<u64, Ift>,
    by_id: HashMap<PtxId, u64>,
    next_nonce: Option<u64>,
    reap_cursor: Option<u64>,
    commands: mpsc::Receiver<OrchestratorCommand>,
    lifecycle: watch::Sender<LifecycleSnapshot>,
}

impl Orchestrator {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signer: Address,
        deps: Arc<IftDeps>,
        notifier: Arc<dyn EventNotifier>,
        fueling_submitter: Arc<dyn FuelingSubmitter>,
    ) -> (Self, mpsc::Sender<OrchestratorCommand>, watch::Receiver<LifecycleSnapshot>) {
        let (command_tx, command_rx) = mpsc::channel(256);
        let (lifecycle_tx, lifecycle_rx) = watch::channel(LifecycleSnapshot {
            lifecycle: Lifecycle::Idle,
            state_entered_at: Instant::now(),
        });

        let orchestrator = Self {
            signer,
            deps,
            notifier,
            fueling_submitter,
            backlog: VecDeque::new(),
            admitted: BTreeMap::new(),
            by_id: HashMap::new(),
            next_nonce: None,
            reap_cursor: None,
            commands: command_rx,
            lifecycle: lifecycle_tx,
        };
        (orchestrator, command_tx, lifecycle_rx)
    }

    #[must_use]
    pub const fn signer(&self) -> Address {
        self.signer
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.admitted.len() + self.backlog.len()
    }

    /// Drives the Orchestrator's command loop and poll tick until the
    /// Engine drops the command sender (shutdown, §5 "Orchestrators never
    /// crash the Engine" — a failing tick here is retried by
    /// `spawn_monitored_with_backoff`, not propagated).
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.deps.config.interval_duration);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(OrchestratorCommand::Submit(ptx)) => self.backlog.push_back(ptx),
                        Some(OrchestratorCommand::Suspend(id)) => self.suspend(id),
                        Some(OrchestratorCommand::Resume(id)) => self.resume(id),
                        Some(OrchestratorCommand::Confirmed(batch)) => {
                            if let Err(error) = self.handle_confirmed(&batch).await {
                                warn!(signer = %self.signer, %error, "failed to process confirmed batch");
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn suspend(&mut self, id: PtxId) {
        if let Some(&nonce) = self.by_id.get(&id) {
            if let Some(ift) = self.admitted.get_mut(&nonce) {
                ift.suspend();
            }
        } else if let Some(ptx) = self.backlog.iter_mut().find(|ptx| ptx.id == id) {
            ptx.status = TxStatus::Suspended;
        }
    }

    fn resume(&mut self, id: PtxId) {
        if let Some(&nonce) = self.by_id.get(&id) {
            if let Some(ift) = self.admitted.get_mut(&nonce) {
                ift.resume();
            }
        } else if let Some(ptx) = self.backlog.iter_mut().find(|ptx| ptx.id == id) {
            ptx.status = TxStatus::Pending;
        }
    }

    /// One pass of the §4.4 algorithm: refresh the nonce cursor, admit
    /// from the backlog, advance every admitted IFT a step, reap
    /// contiguous terminal IFTs, publish lifecycle.
    #[instrument(level = "debug", skip(self), fields(signer = %self.signer))]
    async fn tick(&mut self) {
        if let Err(error) = self.refresh_nonce_cursor().await {
            warn!(signer = %self.signer, %error, "failed to refresh nonce cursor");
        }

        self.admit_from_backlog().await;

        let nonces: Vec<u64> = self.admitted.keys().copied().collect();
        for nonce in nonces {
            self.advance_one(nonce).await;
        }

        self.reap_contiguous().await;
        self.publish_lifecycle();
    }

    async fn refresh_nonce_cursor(&mut self) -> Result<(), String> {
        if self.next_nonce.is_none() {
            let nonce = self.deps.ledger.get_transaction_count(self.signer, true).await?;
            self.next_nonce = Some(nonce);
            self.reap_cursor = Some(nonce);
        }
        Ok(())
    }

    async fn admit_from_backlog(&mut self) {
        let max_in_flight = self.deps.config.max_in_flight_transactions;
        loop {
            if max_in_flight >= 0 && self.admitted.len() as i64 >= max_in_flight {
                break;
            }
            let Some(ptx) = self.backlog.pop_front() else {
                break;
            };
            let Some(next_nonce) = self.next_nonce else {
                self.backlog.push_front(ptx);
                break;
            };

            let mut ift = Ift::new(
                ptx.id,
                ptx.from,
                ptx.payload.clone(),
                ptx.input.to_vec(),
                ptx.gas_limit,
                ptx.is_fueling_tx,
            );
            if let Err(error) = ift.assign_nonce(&self.deps, next_nonce).await {
                warn!(ptx = %ptx.id, %error, "failed to assign nonce, returning to backlog");
                self.backlog.push_front(ptx);
                break;
            }

            self.by_id.insert(ptx.id, next_nonce);
            self.admitted.insert(next_nonce, ift);
            self.next_nonce = Some(next_nonce + 1);
            info!(ptx = %ptx.id, signer = %self.signer, nonce = next_nonce, "admitted transaction");
        }
    }

    async fn advance_one(&mut self, nonce: u64) {
        let Some(ift) = self.admitted.get_mut(&nonce) else {
            return;
        };

        match ift.stage.clone() {
            IftStage::Suspended | IftStage::Confirmed | IftStage::Failed => {}
            IftStage::StalledForFunds => {
                let target = ift.to;
                let is_fueling_tx = ift.is_fueling_tx;
                let ptx_id = ift.ptx_id;
                if let Some(target) = target {
                    match self
                        .deps
                        .balance_manager
                        .ensure_fueling(target, is_fueling_tx, self.fueling_submitter.as_ref())
                        .await
                    {
                        Ok(fueling_ptx) => {
                            info!(ptx = %ptx_id, %fueling_ptx, "auto-fueling transfer submitted");
                        }
                        Err(error) => {
                            warn!(ptx = %ptx_id, %error, "auto-fueling attempt failed, will retry next tick");
                        }
                    }
                }
            }
            IftStage::Received => {
                if let Err(error) = ift.check_affordable(&self.deps).await {
                    warn!(ptx = %ift.ptx_id, %error, "affordability check failed");
                    return;
                }
                if matches!(ift.stage, IftStage::SigningPending | IftStage::Received) {
                    if let Err(error) = ift.estimate_and_sign(&self.deps).await {
                        self.fail_or_retry(nonce, error).await;
                    }
                }
            }
            IftStage::SigningPending | IftStage::RetryGasBump => {
                // RetryGasBump arrives with `gas_price` already bumped by
                // `track`; `estimate_and_sign`'s `is_none()` guards skip
                // re-estimating it and just re-resolve the key and produce a
                // fresh signed attempt at the new price (§4.3: "re-signs,
                // resubmits. Same nonce, new hash").
                if let Err(error) = ift.estimate_and_sign(&self.deps).await {
                    self.fail_or_retry(nonce, error).await;
                }
            }
            IftStage::Signed | IftStage::SubmissionPending => {
                if let Err(error) = ift.submit(&self.deps).await {
                    self.fail_or_retry(nonce, error).await;
                }
            }
            IftStage::Submitted | IftStage::Tracking => match ift.track(&self.deps).await {
                Ok(StepOutcome::Confirmed) => self.finalize(nonce, TxStatus::Succeeded, SubStatus::Confirmed).await,
                Ok(StepOutcome::Failed) => self.finalize(nonce, TxStatus::Failed, SubStatus::Failed).await,
                Ok(_) => {}
                Err(error) => self.fail_or_retry(nonce, error).await,
            },
        }
    }

    async fn fail_or_retry(&mut self, nonce: u64, error: crate::error::IftError) {
        use crate::error::FailureClass;
        let Some(ift) = self.admitted.get_mut(&nonce) else {
            return;
        };
        match error.classify() {
            FailureClass::FatalForPtx => {
                ift.stage = IftStage::Failed;
                warn!(ptx = %ift.ptx_id, %error, "transaction failed fatally");
                self.finalize(nonce, TxStatus::Failed, SubStatus::Failed).await;
            }
            FailureClass::Stalled => {
                ift.stage = IftStage::StalledForFunds;
            }
            FailureClass::Retryable | FailureClass::Infrastructural => {
                warn!(ptx = %ift.ptx_id, %error, "retryable error this tick, will retry");
            }
        }
    }

    /// Persists the PTX's durable `status` (§3: `Succeeded`/`Failed` are
    /// terminal and set exactly once, here, alongside the notification the
    /// teacher's workers fire on a terminal transition) and notifies.
    async fn finalize(&self, nonce: u64, status: TxStatus, sub_status: SubStatus) {
        let Some(ift) = self.admitted.get(&nonce) else {
            return;
        };
        if let Err(error) = self
            .deps
            .store
            .update_transaction(
                ift.ptx_id,
                crate::interfaces::store::TransactionUpdate {
                    status: Some(status),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(ptx = %ift.ptx_id, %error, "failed to persist terminal status");
        }
        self.notify(nonce, sub_status);
    }

    fn notify(&self, nonce: u64, sub_status: SubStatus) {
        if let Some(ift) = self.admitted.get(&nonce) {
            let notifier = self.notifier.clone();
            let event = ProgressEvent {
                ptx_id: ift.ptx_id,
                sub_status,
                detail: None,
            };
            tokio::spawn(async move { notifier.notify(event).await });
        }
    }

    /// Reaps terminal IFTs only while they form an unbroken run from the
    /// reap cursor (§4.4): a gap (an earlier nonce still in flight) halts
    /// reaping even if later nonces are already terminal.
    async fn reap_contiguous(&mut self) {
        let Some(mut cursor) = self.reap_cursor else {
            return;
        };

        loop {
            let Some(ift) = self.admitted.get(&cursor) else {
                break;
            };
            if !ift.stage.is_terminal() {
                break;
            }
            if let Some(ift) = self.admitted.remove(&cursor) {
                self.by_id.remove(&ift.ptx_id);
            }
            cursor += 1;
        }
        self.reap_cursor = Some(cursor);
    }

    fn publish_lifecycle(&self) {
        let lifecycle = if self.admitted.is_empty() && self.backlog.is_empty() {
            Lifecycle::Idle
        } else {
            Lifecycle::Running
        };

        self.lifecycle.send_if_modified(|current| {
            if current.lifecycle == lifecycle {
                false
            } else {
                current.lifecycle = lifecycle;
                current.state_entered_at = Instant::now();
                true
            }
        });
    }

    /// Dispatches a confirmed-transaction batch from the block indexer
    /// (§4.5 `HandleConfirmedTransactions`) to the owning IFTs by
    /// `(from, nonce)`.
    pub async fn handle_confirmed(&mut self, batch: &[IndexedTransaction]) -> Result<(), OrchestratorError> {
        let mut first_error = None;
        for indexed in batch {
            if indexed.from != self.signer {
                continue;
            }
            if !self.admitted.contains_key(&indexed.nonce) {
                continue;
            }
            let outcome = {
                let ift = self.admitted.get_mut(&indexed.nonce).expect("checked above");
                ift.on_confirmed(&self.deps, indexed).await
            };
            match outcome {
                Ok(StepOutcome::Confirmed) => {
                    self.finalize(indexed.nonce, TxStatus::Succeeded, SubStatus::Confirmed).await;
                }
                Ok(StepOutcome::Failed) => {
                    self.finalize(indexed.nonce, TxStatus::Failed, SubStatus::Failed).await;
                }
                Ok(_) => {}
                Err(error) => {
                    self.finalize(indexed.nonce, TxStatus::Failed, SubStatus::Failed).await;
                    first_error.get_or_insert(error);
                }
            }
        }
        self.reap_contiguous().await;
        if let Some(error) = first_error {
            return Err(error.into());
        }
        Ok(())
    }
}
