//! A one-shot, idempotent cancellation signal shared between a slot's
//! worker and whoever tears it down (the Link Engine on link loss, or the
//! worker itself on normal exit).
//!
//! `tokio-util`'s `CancellationToken` would be the obvious off-the-shelf
//! choice but does not appear anywhere in this crate's lineage; a signal
//! this small is built directly on `tokio::sync::Notify`, which the link
//! engine and stream worker already depend on for their own select loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cloneable handle to a single cancellation signal. `cancel()` may be
/// called any number of times, from any number of clones; only the first
/// call has an effect.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<Inner>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Idempotent: a slot already in quarantine
    /// (`freeing = true`) calling this again is a no-op, matching the
    /// source's "cancel() is idempotent when freeing is already set".
    pub fn cancel(&self) {
        if !self.0.cancelled.swap(true, Ordering::SeqCst) {
            self.0.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called. Resolves immediately if
    /// it already has been.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.0.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}
