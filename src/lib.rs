//! # TrafficRL Telemetry & Launcher
//!
//! Operator-facing half of a reinforcement-learning traffic-signal system:
//! a durable telemetry store for training sessions, statistics and reports
//! over the recorded episodes, session export, and an interactive launcher
//! that drives a training engine.
//!
//! ## Architecture
//! ```text
//! launcher (menus)
//!     ├── engine (TrainingEngine / SyntheticEngine) ── RunContext
//!     ├── store::TelemetryStore
//!     │       ├── registry   (sessions, episodes)
//!     │       ├── event_log  (operational events)
//!     │       └── retention  (purge)
//!     │           └── storage (journal.wal + snapshot.json)
//!     ├── statistics ── report
//!     ├── export
//!     └── execution (CancelToken, ShutdownHandle)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use trafficrl::config::DurabilityMode;
//! use trafficrl::{ConfigSnapshot, EpisodeMetrics, SessionResult, TelemetryStore};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let store = Arc::new(TelemetryStore::open_at(dir.path(), DurabilityMode::Batched, 0).unwrap());
//!
//! store.start_session("train_20240101_120000", ConfigSnapshot::new()).unwrap();
//! store
//!     .record_progress("train_20240101_120000", EpisodeMetrics::new(1, 0.4, 0.7, 0.8))
//!     .unwrap();
//! store.end_session("train_20240101_120000", SessionResult::completed()).unwrap();
//!
//! let session = store.get_session("train_20240101_120000").unwrap();
//! assert_eq!(session.episode_count, 1);
//! assert_eq!(session.best_score, Some(0.4));
//! ```

// Configuration and data model
pub mod config;
pub mod model;

// Durable store
pub mod storage; // journal + snapshot internals
pub mod store; // TelemetryStore

// Analysis
pub mod export;
pub mod report;
pub mod statistics;

// Runs
pub mod engine;
pub mod execution;
pub mod launcher;

pub use config::{Capabilities, Config, ConfigError};
pub use engine::{EngineFactory, Progress, RunContext, RunOutcome, SyntheticEngine, TrainingEngine};
pub use execution::{CancelHandle, CancelToken, Cancelled, InterruptAction, ShutdownHandle};
pub use export::{ExportEngine, ExportReceipt};
pub use launcher::{Launcher, LauncherContext, LineSource, ScriptedInput, TerminalInput};
pub use model::{
    ConfigSnapshot, ConfigValue, EpisodeMetrics, Event, Level, RunMode, Session, SessionResult,
    SessionStatus,
};
pub use report::ReportGenerator;
pub use statistics::{GlobalSummary, SessionSummary, StatisticsAggregator};
pub use storage::{ErrorKind, TelemetryError, TelemetryResult};
pub use store::{CloseOutcome, EventQuery, PurgeReport, StoreCounts, TelemetryStore};
