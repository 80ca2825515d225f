//! In-memory telemetry tables and checkpoint snapshots
//!
//! `Tables` is the materialized state of the journal. Live writes and
//! recovery replay both go through [`Tables::apply`], so a reopened store is
//! identical to the one that wrote the journal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use super::journal::{entries_after, JournalEntry, JournalRecord};
use super::{TelemetryError, TelemetryResult};
use crate::model::{EpisodeMetrics, Event, Session};

/// Snapshot file name inside the store directory
pub const SNAPSHOT_FILE: &str = "snapshot.json";

const SNAPSHOT_VERSION: u32 = 1;

/// A session and the episode rows that belong to it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    /// Registration order, breaks start-time ties in listings
    pub seq: u64,
    pub session: Session,
    pub episodes: Vec<EpisodeMetrics>,
}

/// Materialized telemetry state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    pub sessions: HashMap<String, SessionEntry>,
    /// Events in write order (ascending `seq`)
    pub events: Vec<Event>,
    pub next_session_seq: u64,
    pub next_event_seq: u64,
    /// LSN of the last journal record reflected here
    #[serde(default)]
    pub last_lsn: u64,
}

/// Rows removed by a purge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeCounts {
    pub sessions: usize,
    pub episodes: usize,
    pub events: usize,
}

#[derive(Deserialize)]
struct SnapshotFile {
    version: u32,
    tables: Tables,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    written_at: DateTime<Utc>,
    tables: &'a Tables,
}

impl Tables {
    /// Apply a journal entry and remember its LSN
    pub fn apply_entry(&mut self, entry: JournalEntry) -> PurgeCounts {
        self.last_lsn = self.last_lsn.max(entry.lsn);
        self.apply(entry.record)
    }

    /// Replay recovered journal entries on top of a snapshot. Entries the
    /// snapshot already holds are skipped. Returns how many were applied.
    pub fn replay(&mut self, entries: Vec<JournalEntry>) -> usize {
        let mut applied = 0;
        for entry in entries_after(entries, self.last_lsn) {
            self.apply_entry(entry);
            applied += 1;
        }
        applied
    }

    /// Apply one journaled mutation.
    ///
    /// Callers validate before journaling; records that no longer fit the
    /// state (possible only for hand-edited journals) are skipped.
    pub fn apply(&mut self, record: JournalRecord) -> PurgeCounts {
        match record {
            JournalRecord::SessionStarted {
                id,
                started_at,
                config,
            } => {
                if self.sessions.contains_key(&id) {
                    tracing::warn!(session = %id, "skipping duplicate session start in journal");
                    return PurgeCounts::default();
                }
                let seq = self.next_session_seq;
                self.next_session_seq += 1;
                self.sessions.insert(
                    id.clone(),
                    SessionEntry {
                        seq,
                        session: Session::new(id, config, started_at),
                        episodes: Vec::new(),
                    },
                );
            }
            JournalRecord::EpisodeRecorded { id, metrics } => match self.sessions.get_mut(&id) {
                Some(entry) if entry.session.is_running() => {
                    let session = &mut entry.session;
                    session.episode_count += 1;
                    session.best_score = Some(
                        session
                            .best_score
                            .map_or(metrics.reward, |best| best.max(metrics.reward)),
                    );
                    entry.episodes.push(metrics);
                }
                _ => tracing::warn!(session = %id, "skipping episode for unknown or closed session"),
            },
            JournalRecord::SessionEnded {
                id,
                ended_at,
                result,
            } => match self.sessions.get_mut(&id) {
                Some(entry) if entry.session.is_running() => {
                    let session = &mut entry.session;
                    session.status = result.status;
                    session.ended_at = Some(ended_at);
                    session.result = Some(result);
                }
                _ => tracing::warn!(session = %id, "skipping close for unknown or closed session"),
            },
            JournalRecord::Event { event } => {
                self.next_event_seq = self.next_event_seq.max(event.seq + 1);
                self.events.push(event);
            }
            JournalRecord::Purged { cutoff, sessions } => {
                return self.purge(cutoff, &sessions);
            }
        }
        PurgeCounts::default()
    }

    fn purge(&mut self, cutoff: DateTime<Utc>, ids: &[String]) -> PurgeCounts {
        let mut counts = PurgeCounts::default();
        for id in ids {
            match self.sessions.get(id) {
                // Running sessions are never purged, even if listed
                Some(entry) if !entry.session.is_running() => {
                    counts.sessions += 1;
                    counts.episodes += entry.episodes.len();
                    self.sessions.remove(id);
                }
                _ => {}
            }
        }

        let live: HashSet<&String> = self.sessions.keys().collect();
        let before = self.events.len();
        self.events.retain(|event| match &event.session_id {
            Some(id) => live.contains(id),
            None => event.timestamp >= cutoff,
        });
        counts.events = before - self.events.len();
        counts
    }

    pub fn total_episodes(&self) -> usize {
        self.sessions.values().map(|e| e.episodes.len()).sum()
    }

    /// Load a checkpoint, or empty tables when none exists
    pub fn load_snapshot(dir: &Path) -> TelemetryResult<Self> {
        let path = dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(Tables::default());
        }
        let file = File::open(&path)?;
        let snapshot: SnapshotFile = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| TelemetryError::Corrupt(format!("snapshot {}: {e}", path.display())))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(TelemetryError::Corrupt(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot.tables)
    }

    /// Write a checkpoint atomically (temp file + rename)
    pub fn save_snapshot(&self, dir: &Path) -> TelemetryResult<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join(SNAPSHOT_FILE);
        let tmp = dir.join(format!("{SNAPSHOT_FILE}.tmp"));

        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(
            &mut writer,
            &SnapshotRef {
                version: SNAPSHOT_VERSION,
                written_at: Utc::now(),
                tables: self,
            },
        )?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
