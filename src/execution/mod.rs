//! Run Execution Module
//!
//! Cooperative cancellation for training runs and the shutdown path that
//! drives it from process signals.

mod cancel;
mod shutdown;

pub use cancel::{CancelHandle, CancelToken, Cancelled};
pub use shutdown::{InterruptAction, ShutdownHandle};
