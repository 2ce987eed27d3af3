use async_trait::async_trait;

use crate::types::{PtxId, PublicTransaction, SubStatus, TxStatus};

/// Partial update applied to a PTX record (§6 `UpdateTransaction`).
#[derive(Clone, Debug, Default)]
pub struct TransactionUpdate {
    pub nonce: Option<u64>,
    pub status: Option<TxStatus>,
    pub gas_limit: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct TransactionFilter {
    pub from: Option<crate::types::Address>,
    pub status: Option<TxStatus>,
}

/// Persistent transaction store (§6 `TransactionStore`). Implemented
/// externally in production; this crate ships only `InMemoryStore` for
/// tests (see `interfaces::mock`).
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert_transaction(&self, ptx: PublicTransaction) -> Result<(), String>;

    async fn update_transaction(
        &self,
        id: PtxId,
        updates: TransactionUpdate,
    ) -> Result<(), String>;

    async fn get_transaction_by_id(&self, id: PtxId) -> Result<Option<PublicTransaction>, String>;

    async fn list_transactions(
        &self,
        filter: TransactionFilter,
    ) -> Result<Vec<PublicTransaction>, String>;

    #[allow(clippy::too_many_arguments)]
    async fn update_sub_status(
        &self,
        id: PtxId,
        sub_status: SubStatus,
        action: &str,
        info: Option<String>,
        err: Option<String>,
    ) -> Result<(), String>;
}
