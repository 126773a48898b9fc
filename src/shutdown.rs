use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Hub-wide stop signal.
///
/// Carries both a stop flag, polled by the accept loop between timed
/// accepts, and a cancellation token for tasks that can select on it.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    requested: Arc<AtomicBool>,
    token: CancellationToken,
    done: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stop flag and cancel the token.
    ///
    /// Returns `true` for the first caller only; later calls are no-ops.
    pub fn request(&self) -> bool {
        let first = !self.requested.swap(true, Ordering::AcqRel);
        self.token.cancel();
        first
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Resolves once shutdown has been requested.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Mark the shutdown sequence as complete, waking every
    /// [`ShutdownCoordinator::finished`] waiter.
    pub fn finish(&self) {
        self.done.cancel();
    }

    /// Resolves once [`ShutdownCoordinator::finish`] has been called.
    pub fn finished(&self) -> WaitForCancellationFuture<'_> {
        self.done.cancelled()
    }

    /// Stop tasks without marking shutdown as requested. Used when the
    /// owner is dropped without an orderly shutdown.
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}
