//! Telemetry Store
//!
//! The single, explicitly constructed handle for sessions, episode metrics
//! and events. Created once at startup, shared as `Arc<TelemetryStore>` by the
//! launcher, the training loop and the signal handler, closed once at
//! shutdown.
//!
//! ## Concurrency
//!
//! - All mutations take the tables write lock, append to the journal, then
//!   apply in memory. Conflicting writes are therefore serialized and a
//!   failed append leaves state untouched.
//! - The fsync of `Immediate` durability runs after the tables lock is
//!   released, so readers never wait on the disk.
//! - Checkpoints snapshot a clone of the tables outside the lock. They run
//!   at session boundaries, on `flush` and on `close` once the journal
//!   passes `compaction_threshold`; `log` and `record_progress` never pay
//!   for one.
//! - Reads take the tables read lock and never see a half-applied record.
//! - Lock order is always tables, then journal. No lock is held while
//!   calling back into user code.
//!
//! The operations are split by concern:
//! - [`registry`]: session lifecycle
//! - [`event_log`]: append-only events
//! - [`retention`]: age-based purge

pub mod event_log;
pub mod registry;
pub mod retention;

pub use event_log::EventQuery;
pub use registry::CloseOutcome;
pub use retention::PurgeReport;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{DurabilityMode, StorageConfig};
use crate::storage::{
    Journal, JournalEntry, JournalRecord, PurgeCounts, Tables, TelemetryError, TelemetryResult,
};

/// Subdirectory of `data_dir` holding the store
pub const TELEMETRY_DIR: &str = "telemetry";

/// Row counts and journal size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreCounts {
    pub sessions: usize,
    pub running_sessions: usize,
    pub episodes: usize,
    pub events: usize,
    pub journal_bytes: u64,
}

/// Durable, thread-safe telemetry store
pub struct TelemetryStore {
    dir: PathBuf,
    tables: RwLock<Tables>,
    /// `None` once closed
    journal: Mutex<Option<Journal>>,
    /// Set by a write that crossed the checkpoint threshold
    checkpoint_due: AtomicBool,
    /// One checkpoint at a time
    checkpoint_lock: Mutex<()>,
}

fn store_closed() -> TelemetryError {
    TelemetryError::StorageUnavailable("store is closed".into())
}

impl TelemetryStore {
    /// Open the store under `<data_dir>/telemetry`, recovering prior state
    pub fn open(config: &StorageConfig) -> TelemetryResult<Self> {
        Self::open_at(
            config.data_dir.join(TELEMETRY_DIR),
            config.durability_mode,
            config.compaction_threshold,
        )
    }

    /// Open the store in an explicit directory
    pub fn open_at(
        dir: impl Into<PathBuf>,
        durability: DurabilityMode,
        compaction_threshold: usize,
    ) -> TelemetryResult<Self> {
        let dir = dir.into();
        let mut tables = Tables::load_snapshot(&dir)?;
        let mut journal = Journal::open(&dir, durability)?;
        journal.set_checkpoint_threshold(compaction_threshold);

        let entries = journal.recover()?;
        journal.resume_after(tables.last_lsn);
        let recovered = entries.len();
        let replayed = tables.replay(entries);

        tracing::info!(
            dir = %dir.display(),
            sessions = tables.sessions.len(),
            events = tables.events.len(),
            replayed,
            already_in_snapshot = recovered - replayed,
            "telemetry store opened"
        );

        Ok(TelemetryStore {
            dir,
            tables: RwLock::new(tables),
            journal: Mutex::new(Some(journal)),
            checkpoint_due: AtomicBool::new(false),
            checkpoint_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Journal `record`, apply it, then release the tables lock before
    /// waiting for durability.
    pub(crate) fn commit(
        &self,
        mut tables: RwLockWriteGuard<'_, Tables>,
        record: JournalRecord,
    ) -> TelemetryResult<PurgeCounts> {
        let (lsn, due) = {
            let mut guard = self.journal.lock();
            let journal = guard.as_mut().ok_or_else(store_closed)?;
            let lsn = journal.append(&record).map_err(|e| {
                tracing::error!(error = %e, "journal append failed");
                TelemetryError::StorageUnavailable(e.to_string())
            })?;
            (lsn, journal.needs_checkpoint())
        };
        let counts = tables.apply_entry(JournalEntry { lsn, record });
        drop(tables);

        if due {
            self.checkpoint_due.store(true, Ordering::Release);
        }
        if let Some(journal) = self.journal.lock().as_mut() {
            // The record is applied; a failed sync means it may not survive a crash
            journal.sync_through(lsn).map_err(|e| {
                tracing::error!(error = %e, lsn, "journal sync failed");
                TelemetryError::StorageUnavailable(e.to_string())
            })?;
        }
        Ok(counts)
    }

    /// Run a checkpoint if a write asked for one. Failures are traced; the
    /// records stay in the journal.
    pub(crate) fn checkpoint_if_due(&self) {
        if self.checkpoint_due.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.checkpoint() {
                tracing::error!(error = %e, "automatic checkpoint failed");
            }
        }
    }

    /// Write a snapshot and drop the journal records it covers
    pub fn checkpoint(&self) -> TelemetryResult<()> {
        let _running = self.checkpoint_lock.lock();
        if self.is_closed() {
            return Err(store_closed());
        }

        let snapshot = self.tables.read().clone();
        snapshot.save_snapshot(&self.dir)?;

        let mut guard = self.journal.lock();
        let journal = guard.as_mut().ok_or_else(store_closed)?;
        let kept = journal.compact_through(snapshot.last_lsn)?;
        tracing::debug!(
            dir = %self.dir.display(),
            lsn = snapshot.last_lsn,
            kept,
            "telemetry checkpoint written"
        );
        Ok(())
    }

    /// Force journaled records to disk, checkpointing if one is due
    pub fn flush(&self) -> TelemetryResult<()> {
        if let Some(journal) = self.journal.lock().as_mut() {
            journal.sync()?;
        }
        self.checkpoint_if_due();
        Ok(())
    }

    /// Checkpoint and release the journal. Later writes fail with
    /// `StorageUnavailable`; closing twice is a no-op.
    pub fn close(&self) -> TelemetryResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let checkpointed = self.checkpoint();
        let Some(mut journal) = self.journal.lock().take() else {
            return Ok(());
        };
        let synced = journal.sync();
        tracing::info!(dir = %self.dir.display(), "telemetry store closed");
        checkpointed.and(synced)
    }

    pub fn is_closed(&self) -> bool {
        self.journal.lock().is_none()
    }

    pub fn counts(&self) -> StoreCounts {
        let tables = self.tables.read();
        let journal_bytes = self.journal.lock().as_ref().map_or(0, Journal::file_size);
        StoreCounts {
            sessions: tables.sessions.len(),
            running_sessions: tables
                .sessions
                .values()
                .filter(|e| e.session.is_running())
                .count(),
            episodes: tables.total_episodes(),
            events: tables.events.len(),
            journal_bytes,
        }
    }

    /// Read access for analysis code inside the crate
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read()
    }
}

impl Drop for TelemetryStore {
    fn drop(&mut self) {
        if let Some(journal) = self.journal.get_mut().as_mut() {
            if let Err(e) = journal.sync() {
                tracing::error!(error = %e, "failed to sync journal on drop");
            }
        }
    }
}
