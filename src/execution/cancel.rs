//! Cooperative cancellation
//!
//! ## Design
//!
//! A run holds a [`CancelToken`] and checks it between episodes, either
//! polling `is_cancelled` or bailing out with `check()?`. The signal path
//! cancels through a [`CancelHandle`] on the same atomic flag, so neither
//! side ever blocks the other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Returned by [`CancelToken::check`] once cancelled
#[derive(Debug, Clone, thiserror::Error)]
#[error("Run cancelled after {elapsed:?}")]
pub struct Cancelled {
    /// How long the run had been going
    pub elapsed: Duration,
}

/// Cancellation flag owned by one run
#[derive(Clone)]
pub struct CancelToken {
    /// Cancellation flag (shared across threads)
    cancelled: Arc<AtomicBool>,

    /// When the run started
    start_time: Instant,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            cancelled: Arc::new(AtomicBool::new(false)),
            start_time: Instant::now(),
        }
    }

    /// `Err` once cancellation has been requested
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled {
                elapsed: self.start_time.elapsed(),
            });
        }
        Ok(())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get a handle that can be used to cancel from another thread
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancelled: Arc::clone(&self.cancelled),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for cancelling a run from another thread
#[derive(Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}
