//! Signal-driven shutdown
//!
//! The launcher registers the active run with [`ShutdownHandle::begin_run`];
//! the signal task calls [`ShutdownHandle::interrupt`]. The first interrupt
//! during a run cancels it, closes its session as `stopped` and flushes the
//! store without waiting for the training loop. Any further interrupt, or
//! one with no run active, closes the store and asks the caller to exit.
//!
//! Closing the session here and again when the run returns is safe because
//! `end_session` is idempotent.

use parking_lot::Mutex;
use std::sync::Arc;

use super::{CancelHandle, CancelToken};
use crate::model::{Level, SessionResult};
use crate::store::TelemetryStore;

const SOURCE: &str = "launcher";

/// What the signal task should do after an interrupt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptAction {
    /// The active run was cancelled; keep the process alive
    StoppedRun { session_id: String },
    /// Store closed; exit the process
    Exit,
}

struct ActiveRun {
    session_id: String,
    cancel: CancelHandle,
    interrupted: bool,
}

/// Shared between the launcher and the signal task
pub struct ShutdownHandle {
    store: Option<Arc<TelemetryStore>>,
    active: Mutex<Option<ActiveRun>>,
}

impl ShutdownHandle {
    /// `store` is `None` when telemetry is unavailable
    pub fn new(store: Option<Arc<TelemetryStore>>) -> Self {
        ShutdownHandle {
            store,
            active: Mutex::new(None),
        }
    }

    /// Register a run and get its cancellation token. The handle keeps only
    /// the cancel side of it.
    pub fn begin_run(&self, session_id: &str) -> CancelToken {
        let token = CancelToken::new();
        *self.active.lock() = Some(ActiveRun {
            session_id: session_id.to_string(),
            cancel: token.cancel_handle(),
            interrupted: false,
        });
        token
    }

    pub fn end_run(&self) {
        self.active.lock().take();
    }

    /// Id of the session currently running, if any
    pub fn active_session(&self) -> Option<String> {
        self.active.lock().as_ref().map(|run| run.session_id.clone())
    }

    pub fn interrupt(&self) -> InterruptAction {
        let stop = {
            let mut active = self.active.lock();
            match active.as_mut() {
                Some(run) if !run.interrupted => {
                    run.interrupted = true;
                    run.cancel.cancel();
                    Some(run.session_id.clone())
                }
                _ => None,
            }
        };

        match stop {
            Some(session_id) => {
                self.stop_session(&session_id);
                InterruptAction::StoppedRun { session_id }
            }
            None => {
                if let Some(run) = self.active.lock().as_ref() {
                    run.cancel.cancel();
                }
                self.close_store();
                InterruptAction::Exit
            }
        }
    }

    fn stop_session(&self, session_id: &str) {
        tracing::warn!(session = %session_id, "interrupt received, stopping run");
        let Some(store) = &self.store else {
            return;
        };
        store.log(
            Level::Warning,
            SOURCE,
            &format!("Run interrupted by signal: {session_id}"),
            Some(session_id),
        );
        let result = SessionResult::stopped().with_detail("reason", "interrupted by signal");
        if let Err(e) = store.end_session(session_id, result) {
            tracing::error!(session = %session_id, error = %e, "failed to stop session");
        }
        if let Err(e) = store.flush() {
            tracing::error!(error = %e, "failed to flush telemetry store");
        }
    }

    /// Close the store once; later calls do nothing
    pub fn close_store(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.close() {
            tracing::error!(error = %e, "failed to close telemetry store");
        }
    }
}
