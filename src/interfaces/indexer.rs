use crate::interfaces::ledger::ReceiptResult;
use crate::types::{Address, TxHash};

/// A confirmed transaction event delivered by the block indexer (§6
/// `BlockIndexer`), matched by `(from, nonce)` to the owning IFT.
#[derive(Clone, Debug)]
pub struct IndexedTransaction {
    pub block_number: u64,
    pub tx_index: u32,
    pub hash: TxHash,
    pub result: ReceiptResult,
    pub nonce: u64,
    pub from: Address,
}

/// Handler signature for `RegisterIndexedTransactionHandler` (§6). The
/// block indexer itself is an external collaborator; this crate only
/// defines what it hands to `Engine::handle_confirmed_transactions`.
pub type IndexedBatch = Vec<IndexedTransaction>;
