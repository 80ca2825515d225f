//! Session registry: lifecycle and running totals

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::TelemetryStore;
use crate::model::{ConfigSnapshot, EpisodeMetrics, Session, SessionResult, SessionStatus};
use crate::storage::{JournalRecord, TelemetryError, TelemetryResult};

/// Result of `end_session`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseOutcome {
    /// The session transitioned to its terminal state
    Closed,
    /// The session was already terminal; nothing changed
    AlreadyClosed,
}

impl TelemetryStore {
    /// Register a new `running` session with zeroed totals
    pub fn start_session(&self, id: &str, config: ConfigSnapshot) -> TelemetryResult<()> {
        self.start_session_at(id, config, Utc::now())
    }

    pub fn start_session_at(
        &self,
        id: &str,
        config: ConfigSnapshot,
        started_at: DateTime<Utc>,
    ) -> TelemetryResult<()> {
        if id.trim().is_empty() {
            return Err(TelemetryError::InvalidInput("session id is empty".into()));
        }

        let tables = self.tables.write();
        if tables.sessions.contains_key(id) {
            return Err(TelemetryError::DuplicateSession(id.to_string()));
        }
        self.commit(
            tables,
            JournalRecord::SessionStarted {
                id: id.to_string(),
                started_at,
                config,
            },
        )?;
        self.checkpoint_if_due();

        tracing::info!(session = %id, "session started");
        Ok(())
    }

    /// Record one episode: bump the episode count and the best score
    pub fn record_progress(&self, id: &str, metrics: EpisodeMetrics) -> TelemetryResult<()> {
        metrics.validate().map_err(TelemetryError::InvalidInput)?;

        let tables = self.tables.write();
        let entry = tables
            .sessions
            .get(id)
            .ok_or_else(|| TelemetryError::NotFound(id.to_string()))?;
        if !entry.session.is_running() {
            return Err(TelemetryError::InvalidState {
                id: id.to_string(),
                actual: entry.session.status,
                expected: SessionStatus::Running,
            });
        }

        tracing::debug!(session = %id, episode = metrics.episode, reward = metrics.reward, "episode recorded");
        self.commit(
            tables,
            JournalRecord::EpisodeRecorded {
                id: id.to_string(),
                metrics,
            },
        )?;
        Ok(())
    }

    /// Close a session with the status carried by `result`.
    ///
    /// Closing an already-terminal session logs a warning and changes
    /// nothing, so a normal completion racing a signal-driven shutdown is
    /// harmless. The first close wins.
    pub fn end_session(&self, id: &str, result: SessionResult) -> TelemetryResult<CloseOutcome> {
        self.end_session_at(id, result, Utc::now())
    }

    pub fn end_session_at(
        &self,
        id: &str,
        result: SessionResult,
        ended_at: DateTime<Utc>,
    ) -> TelemetryResult<CloseOutcome> {
        if !result.status.is_terminal() {
            return Err(TelemetryError::InvalidInput(format!(
                "cannot close session '{id}' with status {}",
                result.status
            )));
        }

        let tables = self.tables.write();
        let entry = tables
            .sessions
            .get(id)
            .ok_or_else(|| TelemetryError::NotFound(id.to_string()))?;
        if entry.session.status.is_terminal() {
            tracing::warn!(
                session = %id,
                status = %entry.session.status,
                requested = %result.status,
                "session already closed, ignoring"
            );
            return Ok(CloseOutcome::AlreadyClosed);
        }

        let status = result.status;
        self.commit(
            tables,
            JournalRecord::SessionEnded {
                id: id.to_string(),
                ended_at,
                result,
            },
        )?;
        self.checkpoint_if_due();

        tracing::info!(session = %id, %status, "session closed");
        Ok(CloseOutcome::Closed)
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.tables.read().sessions.get(id).map(|e| e.session.clone())
    }

    /// Up to `limit` sessions, most recently started first
    pub fn get_sessions(&self, limit: usize) -> Vec<Session> {
        let tables = self.tables.read();
        let mut entries: Vec<_> = tables.sessions.values().collect();
        entries.sort_by(|a, b| {
            b.session
                .started_at
                .cmp(&a.session.started_at)
                .then(b.seq.cmp(&a.seq))
        });
        entries
            .into_iter()
            .take(limit)
            .map(|e| e.session.clone())
            .collect()
    }

    /// Episode rows of a session in write order
    pub fn episodes(&self, id: &str) -> TelemetryResult<Vec<EpisodeMetrics>> {
        self.tables
            .read()
            .sessions
            .get(id)
            .map(|e| e.episodes.clone())
            .ok_or_else(|| TelemetryError::NotFound(id.to_string()))
    }

    /// Close sessions left `running` by a previous process as `stopped`.
    /// Returns the ids that were closed.
    pub fn recover_interrupted(&self) -> TelemetryResult<Vec<String>> {
        let stale: Vec<String> = {
            let tables = self.tables.read();
            tables
                .sessions
                .values()
                .filter(|e| e.session.is_running())
                .map(|e| e.session.id.clone())
                .collect()
        };

        let mut closed = Vec::with_capacity(stale.len());
        for id in stale {
            let result =
                SessionResult::stopped().with_detail("reason", "recovered after restart");
            if self.end_session(&id, result)? == CloseOutcome::Closed {
                tracing::warn!(session = %id, "closed session interrupted by previous shutdown");
                closed.push(id);
            }
        }
        Ok(closed)
    }
}
