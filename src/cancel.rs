//! Cooperative cancellation flag.
//!
//! Cancellation is polled at await points rather than forced: an in-flight
//! backend call finishes its current round trip before the owner notices.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared, clone-able flag. All clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
