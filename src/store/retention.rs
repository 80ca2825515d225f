//! Age-based retention

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::TelemetryStore;
use crate::storage::{JournalRecord, TelemetryResult};

/// Rows removed by a purge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub cutoff: Option<DateTime<Utc>>,
    pub sessions: usize,
    pub episodes: usize,
    pub events: usize,
}

impl PurgeReport {
    pub fn is_empty(&self) -> bool {
        self.sessions == 0 && self.episodes == 0 && self.events == 0
    }
}

impl TelemetryStore {
    /// Delete closed sessions older than `days`, with their episodes and events
    pub fn purge_older_than(&self, days: u32) -> TelemetryResult<PurgeReport> {
        self.purge_older_than_at(days, Utc::now())
    }

    /// Purge relative to an explicit `now`.
    ///
    /// A session's age is its end time, or its start time if it never
    /// closed. Running sessions are kept regardless of age. The whole purge
    /// is one journal record applied under the write lock, so readers see
    /// either all of it or none of it.
    pub fn purge_older_than_at(&self, days: u32, now: DateTime<Utc>) -> TelemetryResult<PurgeReport> {
        let cutoff = now - Duration::days(i64::from(days));

        let counts = {
            let tables = self.tables.write();
            let expired: Vec<String> = tables
                .sessions
                .values()
                .filter(|e| !e.session.is_running() && e.session.age_reference() < cutoff)
                .map(|e| e.session.id.clone())
                .collect();
            self.commit(
                tables,
                JournalRecord::Purged {
                    cutoff,
                    sessions: expired,
                },
            )?
        };

        let report = PurgeReport {
            cutoff: Some(cutoff),
            sessions: counts.sessions,
            episodes: counts.episodes,
            events: counts.events,
        };
        tracing::info!(
            days,
            sessions = report.sessions,
            episodes = report.episodes,
            events = report.events,
            "purged telemetry"
        );

        if !report.is_empty() {
            self.checkpoint()?;
        }
        Ok(report)
    }
}
