//! One-shot cancellable timers, one per purpose.
//!
//! The alarm keeps one of these per timer purpose (authentication timeout,
//! post-authentication grace period), so at most one instance of each is ever
//! outstanding: scheduling replaces the pending one.

use parking_lot::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A purpose-keyed one-shot timer backed by a spawned task.
///
/// The callback runs at most once. Cancellation is idempotent and safe after
/// the timer already fired; cancellation concurrent with firing may lose the
/// race, so callbacks must re-check the state they act on.
pub struct Oneshot {
    purpose: &'static str,
    pending: Mutex<Option<CancellationToken>>,
}

impl Oneshot {
    pub fn new(purpose: &'static str) -> Self {
        Self {
            purpose,
            pending: Mutex::new(None),
        }
    }

    /// Schedule the callback after `delay`, replacing any pending instance.
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let token = CancellationToken::new();
        let previous = {
            let mut pending = self.pending.lock();
            pending.replace(token.clone())
        };
        if let Some(previous) = previous {
            previous.cancel();
        }

        let purpose = self.purpose;
        debug!("Scheduled {} timer for {:?}", purpose, delay);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("{} timer cancelled", purpose);
                }
                _ = tokio::time::sleep(delay) => {
                    debug!("{} timer fired", purpose);
                    callback();
                }
            }
        });
    }

    /// Cancel the pending timer, if any. Safe to call repeatedly or after
    /// the timer has already fired.
    pub fn cancel(&self) {
        if let Some(token) = self.pending.lock().take() {
            token.cancel();
        }
    }
}
