//! Storage Module
//!
//! Durable backing for the telemetry store:
//! - Append-only journal with per-record CRC32 (O(1) writes, replay recovery)
//! - In-memory tables materialized from the journal
//! - Atomic checkpoint snapshots (temp file + rename)
//! - Error handling
//!
//! ## On-disk Layout
//!
//! ```text
//! <data_dir>/telemetry/
//!     snapshot.json   # last checkpoint of all tables
//!     journal.wal     # records appended since that checkpoint
//! ```
//!
//! Recovery loads the snapshot, then replays the journal records newer than
//! the snapshot's last LSN on top of it.

pub mod error;
pub mod journal;
pub mod tables;

// Re-export commonly used types
pub use error::{ErrorKind, TelemetryError, TelemetryResult};
pub use journal::{Journal, JournalEntry, JournalRecord, JOURNAL_FILE};
pub use tables::{PurgeCounts, SessionEntry, Tables, SNAPSHOT_FILE};
