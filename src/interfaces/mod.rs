pub mod indexer;
pub mod key_manager;
pub mod ledger;
pub mod mock;
pub mod notifier;
pub mod store;

pub use indexer::{IndexedBatch, IndexedTransaction};
pub use key_manager::{KeyHandle, KeyManager, SigningAlgorithm};
pub use ledger::{LedgerRpc, Receipt, ReceiptResult, UnsignedTx};
pub use notifier::{EventNotifier, NullNotifier, ProgressEvent};
pub use store::{TransactionFilter, TransactionStore, TransactionUpdate};
