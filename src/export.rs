//! Portable session export
//!
//! A session is exported as one self-describing JSON document:
//!
//! ```json
//! {
//!   "format": "trafficrl/session-export",
//!   "version": 1,
//!   "export_id": "…",
//!   "exported_at": "2024-01-01T12:00:00Z",
//!   "sha256": "…",
//!   "episodes": [ … ],
//!   "events": [ … ],
//!   "session": { … }
//! }
//! ```
//!
//! `sha256` is the digest of the compact JSON of `{episodes, events, session}`,
//! so a reader can check the payload without knowing the writer. The file is
//! written next to its destination and renamed into place; a failed export
//! leaves nothing behind.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::report::session_dir_name;
use crate::storage::{TelemetryError, TelemetryResult};
use crate::store::TelemetryStore;

pub const EXPORT_FORMAT: &str = "trafficrl/session-export";
pub const EXPORT_VERSION: u32 = 1;

const PAYLOAD_KEYS: [&str; 3] = ["episodes", "events", "session"];

/// What an export wrote
#[derive(Debug, Clone, Serialize)]
pub struct ExportReceipt {
    pub session_id: String,
    pub path: PathBuf,
    pub export_id: Uuid,
    pub sha256: String,
    pub episodes: usize,
    pub events: usize,
    pub bytes: u64,
}

/// Result of [`ExportEngine::verify`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedExport {
    pub session_id: String,
    pub sha256: String,
    pub episodes: usize,
    pub events: usize,
}

#[derive(Serialize)]
struct ExportDocument<'a> {
    format: &'static str,
    version: u32,
    export_id: Uuid,
    exported_at: DateTime<Utc>,
    sha256: &'a str,
    #[serde(flatten)]
    payload: &'a Map<String, Value>,
}

fn digest(payload: &Map<String, Value>) -> TelemetryResult<String> {
    let canonical = serde_json::to_string(payload)?;
    let hash = Sha256::digest(canonical.as_bytes());
    Ok(hash.iter().map(|b| format!("{b:02x}")).collect())
}

pub struct ExportEngine {
    store: Arc<TelemetryStore>,
}

impl ExportEngine {
    pub fn new(store: Arc<TelemetryStore>) -> Self {
        ExportEngine { store }
    }

    /// Default destination: `<export_dir>/export_<id>.json`
    pub fn default_path(export_dir: &Path, session_id: &str) -> PathBuf {
        export_dir.join(format!("export_{}.json", session_dir_name(session_id)))
    }

    /// Serialize a session with its episodes and events to `dest`
    pub fn export(&self, session_id: &str, dest: impl AsRef<Path>) -> TelemetryResult<ExportReceipt> {
        let dest = dest.as_ref();

        // One read lock: session, episodes and events from the same state
        let (payload, episodes, events) = {
            let tables = self.store.read();
            let entry = tables
                .sessions
                .get(session_id)
                .ok_or_else(|| TelemetryError::NotFound(session_id.to_string()))?;
            let events: Vec<_> = tables
                .events
                .iter()
                .filter(|e| e.session_id.as_deref() == Some(session_id))
                .collect();

            let mut payload = Map::new();
            payload.insert("session".into(), serde_json::to_value(&entry.session)?);
            payload.insert("episodes".into(), serde_json::to_value(&entry.episodes)?);
            payload.insert("events".into(), serde_json::to_value(&events)?);
            (payload, entry.episodes.len(), events.len())
        };

        let sha256 = digest(&payload)?;
        let export_id = Uuid::new_v4();
        let document = ExportDocument {
            format: EXPORT_FORMAT,
            version: EXPORT_VERSION,
            export_id,
            exported_at: Utc::now(),
            sha256: &sha256,
            payload: &payload,
        };

        let bytes = write_atomic(dest, &document)?;
        tracing::info!(
            session = %session_id,
            path = %dest.display(),
            episodes,
            events,
            "session exported"
        );

        Ok(ExportReceipt {
            session_id: session_id.to_string(),
            path: dest.to_path_buf(),
            export_id,
            sha256,
            episodes,
            events,
            bytes,
        })
    }

    /// Re-read an export document and check its digest
    pub fn verify(path: impl AsRef<Path>) -> TelemetryResult<VerifiedExport> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| TelemetryError::export_io(path, e))?;
        let document: Value = serde_json::from_str(&text)
            .map_err(|e| TelemetryError::Corrupt(format!("{}: {e}", path.display())))?;

        if document["format"] != EXPORT_FORMAT {
            return Err(TelemetryError::Corrupt(format!(
                "{} is not a session export",
                path.display()
            )));
        }
        if document["version"] != EXPORT_VERSION {
            return Err(TelemetryError::Corrupt(format!(
                "unsupported export version {}",
                document["version"]
            )));
        }

        let mut payload = Map::new();
        for key in PAYLOAD_KEYS {
            let value = document
                .get(key)
                .ok_or_else(|| TelemetryError::Corrupt(format!("export is missing '{key}'")))?;
            payload.insert(key.to_string(), value.clone());
        }

        let expected = document["sha256"].as_str().unwrap_or_default();
        let actual = digest(&payload)?;
        if expected != actual {
            return Err(TelemetryError::Corrupt(format!(
                "export digest mismatch: recorded {expected}, computed {actual}"
            )));
        }

        let count = |key: &str| payload[key].as_array().map_or(0, Vec::len);
        Ok(VerifiedExport {
            session_id: payload["session"]["id"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            sha256: actual,
            episodes: count("episodes"),
            events: count("events"),
        })
    }
}

/// Write pretty JSON to a sibling temp file, then rename over `dest`
fn write_atomic<T: Serialize>(dest: &Path, value: &T) -> TelemetryResult<u64> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| TelemetryError::InvalidInput(format!("{} is not a file path", dest.display())))?;
    let parent = dest.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent).map_err(|e| TelemetryError::export_io(parent, e))?;
    }
    let tmp = dest.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let body = serde_json::to_vec_pretty(value)?;
    let result = (|| -> io::Result<u64> {
        let mut file = File::create(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, dest)?;
        Ok(body.len() as u64)
    })()
    .map_err(|e| TelemetryError::export_io(dest, e));

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
