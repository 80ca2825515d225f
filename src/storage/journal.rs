//! Telemetry Journal (write-ahead log)
//!
//! Every mutation of the telemetry store is appended here before it is
//! applied in memory, giving O(1) durable writes and recovery by replay.
//!
//! ## Architecture
//!
//! ```text
//! start/record/end/log/purge -> Journal (append, O(1)) -> apply to tables
//!                                   |
//!                                   v
//!          checkpoint: snapshot.json (last LSN) + drop covered records
//! ```
//!
//! ## Line Format
//!
//! One record per line: the CRC32 of the rest of the line, the record's log
//! sequence number (LSN), then its JSON payload:
//! ```text
//! 1c291ca3 41 {"op":"session_started","id":"train_20240101_000000",...}
//! 8a0f33d1 42 {"op":"event","event":{"seq":0,"level":"INFO",...}}
//! ```
//!
//! The snapshot stores the LSN of the last record it contains. Replay skips
//! anything at or below it, so a crash between writing the snapshot and
//! compacting the journal cannot apply a record twice.
//!
//! A torn final line (crash mid-append) is dropped on recovery and the file
//! is truncated back to the last complete record. A bad line followed by
//! good ones means real corruption and recovery fails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{TelemetryError, TelemetryResult};
use crate::config::DurabilityMode;
use crate::model::{ConfigSnapshot, EpisodeMetrics, Event, SessionResult};

/// Journal file name inside the store directory
pub const JOURNAL_FILE: &str = "journal.wal";

/// A single journaled mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    SessionStarted {
        id: String,
        started_at: DateTime<Utc>,
        config: ConfigSnapshot,
    },
    EpisodeRecorded {
        id: String,
        metrics: EpisodeMetrics,
    },
    SessionEnded {
        id: String,
        ended_at: DateTime<Utc>,
        result: SessionResult,
    },
    Event {
        event: Event,
    },
    /// Retention purge: listed sessions go with their episodes and events;
    /// unattached events older than `cutoff` and orphaned events go too.
    Purged {
        cutoff: DateTime<Utc>,
        sessions: Vec<String>,
    },
}

/// A journaled record with its log sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub lsn: u64,
    pub record: JournalRecord,
}

/// Entries newer than `lsn`, in journal order
pub fn entries_after(entries: Vec<JournalEntry>, lsn: u64) -> impl Iterator<Item = JournalEntry> {
    entries.into_iter().filter(move |e| e.lsn > lsn)
}

/// Append-only journal for one telemetry store
pub struct Journal {
    /// Journal file path
    path: PathBuf,
    /// Lazily opened append writer
    writer: Option<BufWriter<File>>,
    durability: DurabilityMode,
    /// LSN given to the next append (LSNs start at 1)
    next_lsn: u64,
    /// Highest LSN known to be on stable storage
    synced_lsn: u64,
    /// File length up to the last complete record
    committed_len: u64,
    /// A failed append may have left bytes past `committed_len`
    needs_rollback: bool,
    /// Records appended since the last checkpoint
    entries_since_checkpoint: usize,
    /// Threshold for automatic checkpoint (0 = disabled)
    checkpoint_threshold: usize,
}

impl Journal {
    /// Open (or create) the journal in `dir`
    pub fn open(dir: &Path, durability: DurabilityMode) -> TelemetryResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE);
        let committed_len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Ok(Journal {
            path,
            writer: None,
            durability,
            next_lsn: 1,
            synced_lsn: 0,
            committed_len,
            needs_rollback: false,
            entries_since_checkpoint: 0,
            checkpoint_threshold: 10_000,
        })
    }

    fn ensure_writer(&mut self) -> TelemetryResult<&mut BufWriter<File>> {
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        self.writer
            .as_mut()
            .ok_or_else(|| TelemetryError::StorageUnavailable("journal writer not initialized".into()))
    }

    fn write_line(&mut self, line: &[u8]) -> TelemetryResult<()> {
        let writer = self.ensure_writer()?;
        writer.write_all(line)?;
        writer.flush()?;
        Ok(())
    }

    /// Append a record and hand it to the OS, returning its LSN.
    ///
    /// On failure nothing of the record survives: unwritten buffer contents
    /// are discarded and the file is cut back to the last complete record.
    /// Durability comes from [`Journal::sync_through`].
    pub fn append(&mut self, record: &JournalRecord) -> TelemetryResult<u64> {
        if self.needs_rollback {
            self.rollback()?;
        }

        let lsn = self.next_lsn;
        let line = encode_line(lsn, record)?;
        if let Err(e) = self.write_line(line.as_bytes()) {
            self.needs_rollback = true;
            if let Err(rollback) = self.rollback() {
                tracing::error!(
                    path = %self.path.display(),
                    error = %rollback,
                    "journal rollback failed, retrying before next append"
                );
            }
            return Err(e);
        }

        self.committed_len += line.len() as u64;
        self.next_lsn += 1;
        self.entries_since_checkpoint += 1;
        Ok(lsn)
    }

    /// Cut the file back to `committed_len`, dropping any buffered bytes
    fn rollback(&mut self) -> TelemetryResult<()> {
        let file = match self.writer.take() {
            // into_parts hands back the buffer instead of flushing it
            Some(writer) => writer.into_parts().0,
            None => OpenOptions::new().write(true).create(true).open(&self.path)?,
        };
        file.set_len(self.committed_len)?;
        file.sync_all()?;
        self.needs_rollback = false;
        tracing::warn!(
            path = %self.path.display(),
            len = self.committed_len,
            "journal rolled back to last complete record"
        );
        Ok(())
    }

    /// Make every record up to `lsn` durable. A no-op in `Batched` mode.
    pub fn sync_through(&mut self, lsn: u64) -> TelemetryResult<()> {
        if self.durability == DurabilityMode::Immediate && lsn > self.synced_lsn {
            self.sync()?;
        }
        Ok(())
    }

    /// Force buffered records to disk
    pub fn sync(&mut self) -> TelemetryResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        self.synced_lsn = self.next_lsn - 1;
        Ok(())
    }

    /// Read every complete record, truncating a torn tail in place
    pub fn recover(&mut self) -> TelemetryResult<Vec<JournalEntry>> {
        self.writer = None;
        self.needs_rollback = false;
        if !self.path.exists() {
            self.committed_len = 0;
            return Ok(Vec::new());
        }

        let bytes = fs::read(&self.path)?;
        let (entries, valid_len) = decode_records(&bytes)?;
        if valid_len < bytes.len() {
            tracing::warn!(
                path = %self.path.display(),
                dropped_bytes = bytes.len() - valid_len,
                "discarding torn journal tail"
            );
            let file = OpenOptions::new().write(true).open(&self.path)?;
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        self.committed_len = valid_len as u64;
        if let Some(last) = entries.last() {
            self.resume_after(last.lsn);
        }
        self.synced_lsn = self.next_lsn - 1;
        self.entries_since_checkpoint = entries.len();
        Ok(entries)
    }

    /// Continue numbering after `lsn` (the snapshot's last applied record)
    pub fn resume_after(&mut self, lsn: u64) {
        self.next_lsn = self.next_lsn.max(lsn + 1);
    }

    /// Drop records already covered by a checkpoint at `lsn`.
    ///
    /// Later records are rewritten into a fresh file that replaces the
    /// journal by rename, so a crash leaves either the old or the new file.
    /// Returns the number of records kept.
    pub fn compact_through(&mut self, lsn: u64) -> TelemetryResult<usize> {
        self.sync()?;
        self.writer = None;

        let kept: Vec<JournalEntry> = if self.path.exists() {
            let (entries, _) = decode_records(&fs::read(&self.path)?)?;
            entries_after(entries, lsn).collect()
        } else {
            Vec::new()
        };

        let mut content = String::new();
        for entry in &kept {
            content.push_str(&encode_line(entry.lsn, &entry.record)?);
        }

        let tmp = self.path.with_extension("wal.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;

        self.committed_len = content.len() as u64;
        self.entries_since_checkpoint = kept.len();
        Ok(kept.len())
    }

    /// Check if a checkpoint is due
    pub fn needs_checkpoint(&self) -> bool {
        self.checkpoint_threshold > 0 && self.entries_since_checkpoint >= self.checkpoint_threshold
    }

    /// Set the checkpoint threshold (0 = disabled)
    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.checkpoint_threshold = threshold;
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }

    /// LSN of the most recent append
    pub fn last_lsn(&self) -> u64 {
        self.next_lsn - 1
    }

    /// Journal file size in bytes
    pub fn file_size(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `{crc32:08x} {lsn} {json}\n`, the checksum covering `{lsn} {json}`
fn encode_line(lsn: u64, record: &JournalRecord) -> TelemetryResult<String> {
    let body = format!("{lsn} {}", serde_json::to_string(record)?);
    let crc = crc32fast::hash(body.as_bytes());
    Ok(format!("{crc:08x} {body}\n"))
}

fn decode_line(line: &[u8]) -> Option<JournalEntry> {
    let line = std::str::from_utf8(line).ok()?;
    let (crc_hex, body) = line.split_once(' ')?;
    let crc = u32::from_str_radix(crc_hex, 16).ok()?;
    if crc32fast::hash(body.as_bytes()) != crc {
        return None;
    }
    let (lsn, json) = body.split_once(' ')?;
    Some(JournalEntry {
        lsn: lsn.parse().ok()?,
        record: serde_json::from_str(json).ok()?,
    })
}

/// Decode journal bytes into entries plus the length of the valid prefix
fn decode_records(bytes: &[u8]) -> TelemetryResult<(Vec<JournalEntry>, usize)> {
    let mut records = Vec::new();
    let mut offset = 0;
    let mut chunks = bytes.split_inclusive(|b| *b == b'\n').peekable();

    while let Some(chunk) = chunks.next() {
        let is_last = chunks.peek().is_none();
        let complete = chunk.ends_with(b"\n");
        let line = chunk.strip_suffix(b"\n").unwrap_or(chunk);

        if line.iter().all(u8::is_ascii_whitespace) {
            offset += chunk.len();
            continue;
        }

        match decode_line(line) {
            Some(entry) if complete => {
                records.push(entry);
                offset += chunk.len();
            }
            _ if is_last => break,
            _ => {
                return Err(TelemetryError::Corrupt(format!(
                    "journal record at byte {offset} failed checksum or parse"
                )));
            }
        }
    }

    Ok((records, offset))
}
