//! In-memory reference implementations of the five external interfaces,
//! used by the test suite. Grounded on the teacher's
//! `database/null_database.rs` (null-object store) and `database/sitter.rs`
//! (duplicate-id detection on insert).
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ethers::types::U256;
use tokio::sync::Mutex as AsyncMutex;

use crate::interfaces::indexer::IndexedBatch;
use crate::interfaces::key_manager::{KeyHandle, KeyManager, SigningAlgorithm};
use crate::interfaces::ledger::{is_execution_reverted, LedgerRpc, Receipt, ReceiptResult, UnsignedTx};
use crate::interfaces::notifier::{EventNotifier, ProgressEvent};
use crate::interfaces::store::{TransactionFilter, TransactionStore, TransactionUpdate};
use crate::types::{Address, GasPrice, PtxId, PublicTransaction, SubStatus, TxHash, TxStatus};

/// An in-memory `TransactionStore`. Inserting a PTX whose id already
/// exists returns the same `DuplicateId`-flavored error the teacher's
/// `sitter.rs` derives from a unique-constraint violation.
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<PtxId, PublicTransaction>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn insert_transaction(&self, ptx: PublicTransaction) -> Result<(), String> {
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&ptx.id) {
            return Err("duplicate transaction id".to_string());
        }
        records.insert(ptx.id, ptx);
        Ok(())
    }

    async fn update_transaction(
        &self,
        id: PtxId,
        updates: TransactionUpdate,
    ) -> Result<(), String> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| "transaction not found".to_string())?;

        if let Some(status) = updates.status {
            if record.status.is_terminal() && status != record.status {
                return Err("TerminalStatusUpdate".to_string());
            }
            record.status = status;
        }
        if let Some(nonce) = updates.nonce {
            record.nonce = Some(nonce);
        }
        if let Some(gas_limit) = updates.gas_limit {
            record.gas_limit = Some(gas_limit);
        }
        Ok(())
    }

    async fn get_transaction_by_id(&self, id: PtxId) -> Result<Option<PublicTransaction>, String> {
        Ok(self.records.lock().unwrap().get(&id).cloned())
    }

    async fn list_transactions(
        &self,
        filter: TransactionFilter,
    ) -> Result<Vec<PublicTransaction>, String> {
        let records = self.records.lock().unwrap();
        Ok(records
            .values()
            .filter(|tx| filter.from.map_or(true, |from| tx.from == from))
            .filter(|tx| filter.status.map_or(true, |status| tx.status == status))
            .cloned()
            .collect())
    }

    async fn update_sub_status(
        &self,
        id: PtxId,
        sub_status: SubStatus,
        action: &str,
        info: Option<String>,
        err: Option<String>,
    ) -> Result<(), String> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| "transaction not found".to_string())?;
        record
            .sub_status_history
            .append(chrono::Utc::now(), sub_status, action, info, err);
        Ok(())
    }
}

/// A programmable ledger double for scenario tests (§8). Each signer has
/// an independent nonce counter and receipts are keyed by hash.
#[derive(Default)]
pub struct MockLedger {
    next_nonce: Mutex<HashMap<Address, u64>>,
    receipts: Mutex<HashMap<TxHash, Receipt>>,
    gas_estimate_failure: Mutex<Option<String>>,
    gas_price: Mutex<GasPrice>,
    balances: Mutex<HashMap<Address, U256>>,
    hash_counter: AtomicU64,
}

impl MockLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            gas_price: Mutex::new(GasPrice::zero()),
            ..Self::default()
        }
    }

    pub fn set_next_nonce(&self, address: Address, nonce: u64) {
        self.next_nonce.lock().unwrap().insert(address, nonce);
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.balances.lock().unwrap().insert(address, balance);
    }

    pub fn set_gas_estimate_failure(&self, message: impl Into<String>) {
        *self.gas_estimate_failure.lock().unwrap() = Some(message.into());
    }

    pub fn set_gas_price(&self, price: GasPrice) {
        *self.gas_price.lock().unwrap() = price;
    }

    /// Delivers a receipt for a hash previously returned by
    /// `send_raw_transaction`, as if the indexer had observed it mined.
    pub fn confirm(&self, hash: TxHash, block_number: u64, result: ReceiptResult) {
        self.receipts.lock().unwrap().insert(
            hash,
            Receipt {
                tx_hash: hash,
                block_number,
                result,
            },
        );
    }

    fn synthesize_hash(&self) -> TxHash {
        let n = self.hash_counter.fetch_add(1, Ordering::SeqCst);
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&n.to_be_bytes());
        TxHash(bytes)
    }
}

#[async_trait]
impl LedgerRpc for MockLedger {
    async fn gas_estimate(&self, _tx: &UnsignedTx) -> Result<u64, String> {
        if let Some(message) = self.gas_estimate_failure.lock().unwrap().clone() {
            return Err(message);
        }
        Ok(21_000)
    }

    async fn get_transaction_count(&self, address: Address, _pending: bool) -> Result<u64, String> {
        Ok(*self.next_nonce.lock().unwrap().get(&address).unwrap_or(&0))
    }

    async fn send_raw_transaction(&self, _raw: &[u8]) -> Result<TxHash, String> {
        Ok(self.synthesize_hash())
    }

    async fn get_transaction_receipt(&self, hash: TxHash) -> Result<Option<Receipt>, String> {
        Ok(self.receipts.lock().unwrap().get(&hash).cloned())
    }

    async fn get_balance(&self, address: Address) -> Result<U256, String> {
        Ok(*self
            .balances
            .lock()
            .unwrap()
            .get(&address)
            .unwrap_or(&U256::zero()))
    }

    async fn get_gas_price(&self) -> Result<GasPrice, String> {
        Ok(*self.gas_price.lock().unwrap())
    }
}

/// Deterministic address derivation from a seed string.
#[derive(Default)]
pub struct MockKeyManager {
    addresses: AsyncMutex<HashMap<String, Address>>,
}

impl MockKeyManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyManager for MockKeyManager {
    async fn resolve_key(
        &self,
        identifier: &str,
        _algorithm: SigningAlgorithm,
    ) -> Result<(KeyHandle, Address), String> {
        let mut addresses = self.addresses.lock().await;
        let address = *addresses.entry(identifier.to_string()).or_insert_with(|| {
            let digest: Vec<u8> = identifier.bytes().cycle().take(20).collect();
            let mut bytes = [0u8; 20];
            bytes.copy_from_slice(&digest);
            Address(bytes)
        });
        Ok((KeyHandle(identifier.to_string()), address))
    }

    async fn sign(&self, _key: &KeyHandle, unsigned_tx: &[u8]) -> Result<Vec<u8>, String> {
        Ok(unsigned_tx.to_vec())
    }
}

/// Captures notifications for assertions.
#[derive(Default)]
pub struct MockNotifier {
    pub events: Mutex<Vec<ProgressEvent>>,
}

impl MockNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn drain(&self) -> Vec<ProgressEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

#[async_trait]
impl EventNotifier for MockNotifier {
    async fn notify(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Captures delivered batches for assertions. The indexer itself lives
/// outside this crate; tests call `Engine::handle_confirmed_transactions`
/// directly with a batch built here.
#[must_use]
pub fn indexed_batch_from(events: Vec<crate::interfaces::indexer::IndexedTransaction>) -> IndexedBatch {
    events
}

#[must_use]
pub fn execution_reverted_message(detail: &str) -> String {
    if is_execution_reverted(detail) {
        detail.to_string()
    } else {
        format!("execution reverted: {detail}")
    }
}
