//! Append-only event log
//!
//! Events are returned oldest first (write order). Ties on timestamp keep
//! write order because ordering is by sequence number, not by time.

use chrono::{DateTime, Utc};

use super::TelemetryStore;
use crate::model::{Event, Level};
use crate::storage::{JournalRecord, TelemetryResult};

/// Filter for [`TelemetryStore::query`]
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Only events attached to this session
    pub session_id: Option<String>,
    /// Only events at or above this severity
    pub min_level: Option<Level>,
    /// Keep the newest `limit` matches (still returned oldest first)
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn min_level(mut self, level: Level) -> Self {
        self.min_level = Some(level);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, event: &Event) -> bool {
        if let Some(id) = &self.session_id {
            if event.session_id.as_deref() != Some(id.as_str()) {
                return false;
            }
        }
        self.min_level.map_or(true, |min| event.level >= min)
    }
}

impl TelemetryStore {
    /// Append an event. Never fails: if the store cannot take the write, the
    /// event is echoed to stderr and a warning is traced instead. Never runs
    /// a checkpoint.
    pub fn log(&self, level: Level, source: &str, message: &str, session_id: Option<&str>) {
        self.log_at(level, source, message, session_id, Utc::now());
    }

    pub fn log_at(
        &self,
        level: Level,
        source: &str,
        message: &str,
        session_id: Option<&str>,
        timestamp: DateTime<Utc>,
    ) {
        if let Err(e) = self.try_log_at(level, source, message, session_id, timestamp) {
            eprintln!("[{level}] {source}: {message}");
            tracing::warn!(error = %e, %source, "event not recorded");
        }
    }

    /// Append an event, returning its sequence number
    pub fn try_log(
        &self,
        level: Level,
        source: &str,
        message: &str,
        session_id: Option<&str>,
    ) -> TelemetryResult<u64> {
        self.try_log_at(level, source, message, session_id, Utc::now())
    }

    fn try_log_at(
        &self,
        level: Level,
        source: &str,
        message: &str,
        session_id: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> TelemetryResult<u64> {
        let tables = self.tables.write();
        let seq = tables.next_event_seq;
        self.commit(
            tables,
            JournalRecord::Event {
                event: Event {
                    seq,
                    timestamp,
                    level,
                    source: source.to_string(),
                    message: message.to_string(),
                    session_id: session_id.map(str::to_string),
                },
            },
        )?;
        Ok(seq)
    }

    /// Events matching `query`, oldest first
    pub fn query(&self, query: &EventQuery) -> Vec<Event> {
        let tables = self.tables.read();
        let mut matched: Vec<&Event> = tables.events.iter().filter(|e| query.matches(e)).collect();
        if let Some(limit) = query.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched.into_iter().cloned().collect()
    }
}
