mod address;
mod gas;
mod ptx;
mod substatus;

pub use address::{Address, TxHash};
pub use gas::GasPrice;
pub use ptx::{PayloadVariant, PtxId, PublicTransaction, SubmissionAttempt, TxStatus};
pub use substatus::{SubStatus, SubStatusEntry, SubStatusHistory};
