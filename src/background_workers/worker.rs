use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Trait for long-running background workers.
///
/// A worker is handed to a [`WorkerManager`](super::WorkerManager), which
/// runs `start` on its own tokio task. Cancellation is cooperative: the
/// manager can only signal the token, it never aborts the task.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Unique, human-readable name. Used as the worker's key in the manager.
    fn name(&self) -> &str;

    /// Run until `cancel` is triggered.
    ///
    /// Implementations must check the token at every loop boundary and
    /// return promptly once it is cancelled. Never block on an operation
    /// that ignores cancellation.
    async fn start(&self, cancel: CancellationToken);
}
