//! Small shared helpers. `spawn_monitored_with_backoff` generalizes the
//! teacher's `spawn_or_abort` (see the doc comment below for the one
//! deliberate behavior change).
use std::future::Future;
use std::time::Duration;

use anyhow::Result as AnyResult;
use tokio::task::JoinHandle;
use tracing::error;

/// Spawns `make_future` and restarts it with exponential backoff if it
/// ever returns `Err` or panics, instead of aborting the process the way
/// the teacher's `spawn_or_abort` does. Orchestrator and Engine poll loops
/// must outlive a single bad tick (§5): one signer's Orchestrator crashing
/// must never take the whole process down with it.
pub fn spawn_monitored_with_backoff<F, Fut>(name: &'static str, mut make_future: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = AnyResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = Duration::from_millis(100);
        const MAX_BACKOFF: Duration = Duration::from_secs(30);

        loop {
            let result = make_future().await;
            match result {
                Ok(()) => return,
                Err(error) => {
                    error!(task = name, ?error, ?backoff, "task exited with error, restarting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn restarts_after_failure_then_stops_on_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let handle = spawn_monitored_with_backoff("test-task", move || {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(anyhow::anyhow!("not yet"))
                } else {
                    Ok(())
                }
            }
        });

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("task should finish")
            .expect("task should not panic");

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
