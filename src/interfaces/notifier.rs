use async_trait::async_trait;

use crate::types::{PtxId, SubStatus};

/// A user-visible progress event (§6 `EventNotifier`).
#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub ptx_id: PtxId,
    pub sub_status: SubStatus,
    pub detail: Option<String>,
}

#[async_trait]
pub trait EventNotifier: Send + Sync {
    async fn notify(&self, event: ProgressEvent);
}

/// A notifier that discards every event, for components/tests that don't
/// care about user-visible progress (grounded on the teacher's
/// `database/null_database.rs` null-object pattern).
pub struct NullNotifier;

#[async_trait]
impl EventNotifier for NullNotifier {
    async fn notify(&self, _event: ProgressEvent) {}
}
