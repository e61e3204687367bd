//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag, polled at chunk and entry boundaries.
///
/// Clones share the same flag, so a clone handed to another thread can stop
/// an operation running on this one. The flag is sticky until [`reset`](Self::reset).
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag; every top-level operation does this at entry.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
