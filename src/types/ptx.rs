use chrono::{DateTime, Utc};
use ethers::types::{Bytes, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::address::{Address, TxHash};
use super::gas::GasPrice;
use super::substatus::SubStatusHistory;

/// Request identifier, supplied by the caller of `HandleNewTransaction`
/// (§4.5, §8 scenario 1's `id=U1`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PtxId(pub Uuid);

impl std::fmt::Debug for PtxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PtxId({})", self.0)
    }
}

impl std::fmt::Display for PtxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three payload variants named in §4.5.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadVariant {
    Transfer {
        to: Address,
        value: U256,
    },
    Invoke {
        to: Address,
        value: U256,
        abi: String,
        method: String,
        args: Vec<serde_json::Value>,
    },
    Deploy {
        abi: String,
        bytecode: Bytes,
        constructor_args: Vec<serde_json::Value>,
    },
}

impl PayloadVariant {
    #[must_use]
    pub const fn to_address(&self) -> Option<Address> {
        match self {
            Self::Transfer { to, .. } | Self::Invoke { to, .. } => Some(*to),
            Self::Deploy { .. } => None,
        }
    }

    #[must_use]
    pub fn value(&self) -> U256 {
        match self {
            Self::Transfer { value, .. } | Self::Invoke { value, .. } => *value,
            Self::Deploy { .. } => U256::zero(),
        }
    }
}

/// Durable status of a PTX (§3). `Suspended` is lateral, not terminal;
/// `Succeeded`/`Failed` are terminal and never revisited (§3 invariant,
/// §8 partial order).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Suspended,
    Succeeded,
    Failed,
}

impl TxStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One signed/submitted attempt at a PTX. A PTX may accumulate several of
/// these via gas-bump replacement; the latest is the "live" one (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmissionAttempt {
    pub attempt_id: Uuid,
    pub nonce: u64,
    pub gas_price: GasPrice,
    pub signed_raw: Bytes,
    pub tx_hash: TxHash,
    pub submitted_at: DateTime<Utc>,
}

/// The durable transaction record (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublicTransaction {
    pub id: PtxId,
    pub from: Address,
    pub payload: PayloadVariant,
    pub input: Bytes,
    pub gas_limit: Option<u64>,
    pub nonce: Option<u64>,
    pub status: TxStatus,
    pub sub_status_history: SubStatusHistory,
    pub created_at: DateTime<Utc>,
    /// Set only for a fueling transfer submitted by the balance manager;
    /// forbids that PTX from itself triggering fueling (§9 Open Question,
    /// resolved explicitly in `DESIGN.md`).
    pub is_fueling_tx: bool,
}

impl PublicTransaction {
    #[must_use]
    pub fn new(
        id: PtxId,
        from: Address,
        payload: PayloadVariant,
        input: Vec<u8>,
        gas_limit: Option<u64>,
    ) -> Self {
        Self {
            id,
            from,
            input: input.into(),
            gas_limit,
            nonce: None,
            status: TxStatus::Pending,
            sub_status_history: SubStatusHistory::default(),
            created_at: Utc::now(),
            is_fueling_tx: false,
            payload,
        }
    }
}
