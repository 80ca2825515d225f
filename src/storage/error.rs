//! Telemetry Store Error Types

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::model::SessionStatus;

/// Telemetry store errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Unknown session id
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Session id already registered
    #[error("Session already exists: {0}")]
    DuplicateSession(String),

    /// Operation not valid in the session's current lifecycle state
    #[error("Session '{id}' is {actual}, expected {expected}")]
    InvalidState {
        id: String,
        actual: SessionStatus,
        expected: SessionStatus,
    },

    /// Rejected input (non-finite metrics, empty ids, non-terminal close status)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Backing store cannot be written
    #[error("Telemetry store unavailable: {0}")]
    StorageUnavailable(String),

    /// Report or export destination not writable
    #[error("Cannot write '{}': {source}", path.display())]
    ExportIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Journal or snapshot unreadable
    #[error("Corrupt telemetry data: {0}")]
    Corrupt(String),
}

/// Coarse error category, used for operator diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    DuplicateSession,
    InvalidState,
    InvalidInput,
    StorageUnavailable,
    ExportIo,
    Corrupt,
}

impl TelemetryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TelemetryError::NotFound(_) => ErrorKind::NotFound,
            TelemetryError::DuplicateSession(_) => ErrorKind::DuplicateSession,
            TelemetryError::InvalidState { .. } => ErrorKind::InvalidState,
            TelemetryError::InvalidInput(_) => ErrorKind::InvalidInput,
            TelemetryError::StorageUnavailable(_)
            | TelemetryError::Io(_)
            | TelemetryError::Json(_) => ErrorKind::StorageUnavailable,
            TelemetryError::ExportIo { .. } => ErrorKind::ExportIo,
            TelemetryError::Corrupt(_) => ErrorKind::Corrupt,
        }
    }

    pub(crate) fn export_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TelemetryError::ExportIo {
            path: path.into(),
            source,
        }
    }
}

/// Result type for telemetry operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;
