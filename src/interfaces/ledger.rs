use async_trait::async_trait;
use ethers::types::U256;

use crate::types::{Address, GasPrice, TxHash};

/// A typed, unsigned transaction ready for gas estimation or signing.
#[derive(Clone, Debug)]
pub struct UnsignedTx {
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Vec<u8>,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: GasPrice,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiptResult {
    Success,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub result: ReceiptResult,
}

/// Ledger RPC client (§6 `LedgerRPC`). Implemented externally; this crate
/// only defines the boundary and a mock for tests.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    async fn gas_estimate(&self, tx: &UnsignedTx) -> Result<u64, String>;

    async fn get_transaction_count(&self, address: Address, pending: bool) -> Result<u64, String>;

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<TxHash, String>;

    async fn get_transaction_receipt(&self, hash: TxHash) -> Result<Option<Receipt>, String>;

    async fn get_balance(&self, address: Address) -> Result<U256, String>;

    /// Current network gas price, used by the node-derived gas oracle
    /// source (§4.1).
    async fn get_gas_price(&self) -> Result<GasPrice, String>;
}

/// Recognizes the "execution reverted" failure class named in §6 so the
/// node-derived fallback and `IftError::from_estimate_failure` share one
/// definition of the string match.
#[must_use]
pub fn is_execution_reverted(message: &str) -> bool {
    message.to_lowercase().contains("execution reverted")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_execution_reverted_case_insensitively() {
        assert!(is_execution_reverted("Execution Reverted: custom error"));
        assert!(!is_execution_reverted("timeout"));
    }
}
