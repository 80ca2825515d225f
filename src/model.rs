//! Telemetry Data Model
//!
//! The records kept by the telemetry store:
//! - `Session`: one bounded training or deployment run
//! - `EpisodeMetrics`: per-episode KPIs written by the training loop
//! - `Event`: an immutable, leveled log record
//! - `ConfigSnapshot`: flattened hyperparameters captured at session start
//!
//! ## Session ids
//!
//! Ids are `<mode>_<YYYYmmdd_HHMMSS>` (e.g. `train_20240101_120000`). When a
//! second-resolution id collides, callers fall back to
//! [`precise_session_id`], which appends microseconds.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of run a session records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Train,
    Deploy,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Train => "train",
            RunMode::Deploy => "deploy",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a second-resolution session id: `<mode>_<YYYYmmdd_HHMMSS>`
pub fn session_id(mode: RunMode, at: DateTime<Local>) -> String {
    format!("{mode}_{}", at.format("%Y%m%d_%H%M%S"))
}

/// Generate a microsecond-resolution session id for collision fallback
pub fn precise_session_id(mode: RunMode, at: DateTime<Local>) -> String {
    format!("{mode}_{}", at.format("%Y%m%d_%H%M%S_%6f"))
}

/// Session lifecycle state
///
/// `Running` is the only non-terminal state. A session moves from `Running`
/// to exactly one terminal state, once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Stopped,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "stopped" => Ok(SessionStatus::Stopped),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

/// Payload recorded when a session is closed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    /// Terminal status the session transitions to
    pub status: SessionStatus,
    /// Free-form details (reason, final metrics, engine name, ...)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl SessionResult {
    pub fn new(status: SessionStatus) -> Self {
        SessionResult {
            status,
            details: serde_json::Map::new(),
        }
    }

    pub fn completed() -> Self {
        Self::new(SessionStatus::Completed)
    }

    pub fn stopped() -> Self {
        Self::new(SessionStatus::Stopped)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::new(SessionStatus::Failed).with_detail("reason", reason.into())
    }

    /// Attach a detail entry
    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// A scalar hyperparameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ConfigValue {
    /// Numeric view (ints widen to f64)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Int(v) => Some(*v as f64),
            ConfigValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(v) => write!(f, "{v}"),
            ConfigValue::Int(v) => write!(f, "{v}"),
            ConfigValue::Float(v) => write!(f, "{v}"),
            ConfigValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<u64> for ConfigValue {
    fn from(v: u64) -> Self {
        ConfigValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Text(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::Text(v)
    }
}

/// Flattened hyperparameters captured when a session starts.
///
/// Stored verbatim and never modified afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSnapshot(BTreeMap<String, ConfigValue>);

impl ConfigSnapshot {
    pub fn new() -> Self {
        ConfigSnapshot(BTreeMap::new())
    }

    /// Builder-style insert
    pub fn with(mut self, key: &str, value: impl Into<ConfigValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.0.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(ConfigValue::as_f64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, ConfigValue)> for ConfigSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, ConfigValue)>>(iter: I) -> Self {
        ConfigSnapshot(iter.into_iter().collect())
    }
}

/// A training or deployment session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    /// Absent while running
    pub ended_at: Option<DateTime<Utc>>,
    pub config: ConfigSnapshot,
    pub episode_count: u64,
    /// Highest episode reward seen so far; `None` before the first episode
    pub best_score: Option<f64>,
    /// Payload recorded at close
    pub result: Option<SessionResult>,
}

impl Session {
    pub(crate) fn new(id: String, config: ConfigSnapshot, started_at: DateTime<Utc>) -> Self {
        Session {
            id,
            status: SessionStatus::Running,
            started_at,
            ended_at: None,
            config,
            episode_count: 0,
            best_score: None,
            result: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }

    /// Time used for retention: end time, or start time if never closed
    pub fn age_reference(&self) -> DateTime<Utc> {
        self.ended_at.unwrap_or(self.started_at)
    }
}

/// Metrics reported by the training loop for a single episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMetrics {
    pub episode: u64,
    pub reward: f64,
    pub efficiency: f64,
    pub mobility: f64,
    /// Auxiliary KPIs (average speed, congestion ratio, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kpis: BTreeMap<String, f64>,
    pub recorded_at: DateTime<Utc>,
}

impl EpisodeMetrics {
    pub fn new(episode: u64, reward: f64, efficiency: f64, mobility: f64) -> Self {
        EpisodeMetrics {
            episode,
            reward,
            efficiency,
            mobility,
            kpis: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_kpi(mut self, name: &str, value: f64) -> Self {
        self.kpis.insert(name.to_string(), value);
        self
    }

    /// Reject NaN and infinities, which would poison maxima and means
    pub fn validate(&self) -> Result<(), String> {
        let core = [
            ("reward", self.reward),
            ("efficiency", self.efficiency),
            ("mobility", self.mobility),
        ];
        for (name, value) in core
            .into_iter()
            .chain(self.kpis.iter().map(|(k, v)| (k.as_str(), *v)))
        {
            if !value.is_finite() {
                return Err(format!(
                    "episode {} has non-finite {name}: {value}",
                    self.episode
                ));
            }
        }
        Ok(())
    }
}

/// Event severity, ordered `Info < Warning < Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INFO" => Ok(Level::Info),
            "WARN" | "WARNING" => Ok(Level::Warning),
            "ERROR" => Ok(Level::Error),
            other => Err(format!("unknown level '{other}'")),
        }
    }
}

/// An immutable log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Write sequence number; defines total order (ties on timestamp included)
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    /// Component that emitted the event (launcher, engine, ...)
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}
