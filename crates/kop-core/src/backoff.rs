use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capped exponential backoff: attempt `n` (1-based) waits
/// `min(base * 2^(n-1), cap)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Wait before retrying after `failures` consecutive failed attempts, the first
    /// attempt included. `None` once the budget of `max_attempts` is spent.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        (failures >= 1 && failures < self.max_attempts).then(|| self.delay_for(failures))
    }
}

/// A spawned task that runs once after a delay unless cancelled first.
pub struct ScheduledTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn spawn<F>(delay: Duration, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let tok = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
              _ = tok.cancelled() => {}
              _ = tokio::time::sleep(delay) => fut.await,
            }
        });
        Self { cancel, handle }
    }

    /// Cancel the timer. A body that already started keeps running to completion.
    pub fn cancel(self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// A spawned loop (health monitor, keep-alive, runners) stopped through its token.
pub struct BackgroundTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub fn spawn<F, Fut>(make: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(make(cancel.clone()));
        Self { cancel, handle }
    }

    /// Signal the loop to exit at its next `select!`. Safe to call from inside the
    /// task itself: the current iteration runs to completion.
    pub fn stop(self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
