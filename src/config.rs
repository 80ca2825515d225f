//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (TRAFFICRL_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [storage]
//! data_dir = "/var/lib/trafficrl/data"
//! durability_mode = "batched"
//!
//! [training]
//! target_efficiency = 0.8
//! max_episodes = 500
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! TRAFFICRL_STORAGE__DATA_DIR=/custom/path
//! TRAFFICRL_TRAINING__MAX_EPISODES=50
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::ConfigSnapshot;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("Cannot serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Refusing to overwrite existing file: {}", .0.display())]
    AlreadyExists(PathBuf),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Figment(Box::new(e))
    }
}

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Telemetry store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory; the store lives in `<data_dir>/telemetry`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Durability mode for journal writes
    #[serde(default)]
    pub durability_mode: DurabilityMode,

    /// Journal entries before an automatic checkpoint (0 = never)
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: usize,
}

/// Write durability mode - controls when writes are considered durable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityMode {
    /// Sync to disk after each journal append (safest, slowest)
    #[default]
    Immediate,

    /// Flush to the OS per append, sync on checkpoint and close.
    /// Recent records may be lost on power failure, not on process crash.
    Batched,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file; stderr when unset
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Session/event telemetry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Default retention window offered by the purge menu
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Number of sessions shown in listings
    #[serde(default = "default_session_list_limit")]
    pub session_list_limit: usize,
}

/// Analysis, report and export settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,

    /// Trailing window for moving-average smoothing
    #[serde(default = "default_moving_average_window")]
    pub moving_average_window: usize,

    /// Max change between consecutive window averages to call a run converged
    #[serde(default = "default_convergence_tolerance")]
    pub convergence_tolerance: f64,
}

/// Training targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_target_efficiency")]
    pub target_efficiency: f64,

    #[serde(default = "default_target_mobility")]
    pub target_mobility: f64,

    #[serde(default = "default_max_episodes")]
    pub max_episodes: u64,
}

/// Agent hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
}

/// Simulation environment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default = "default_num_vehicles")]
    pub num_vehicles: u32,
}

/// Web monitor settings (the dashboard itself runs elsewhere)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_web_host")]
    pub host: String,

    #[serde(default = "default_web_port")]
    pub port: u16,
}

/// Training engine selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub kind: EngineKind,

    /// RNG seed for the synthetic engine
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Pause between synthetic episodes in milliseconds
    #[serde(default = "default_episode_delay_ms")]
    pub episode_delay_ms: u64,
}

/// Which engine the launcher drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Built-in simulated learning curve
    #[default]
    Synthetic,
    /// No engine available
    None,
}

/// Subsystems available to the launcher, decided once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub telemetry: bool,
    pub analysis: bool,
    pub engine: bool,
    pub web_monitor: bool,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_compaction_threshold() -> usize {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_retention_days() -> u32 {
    30
}
fn default_session_list_limit() -> usize {
    20
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./analysis_output")
}
fn default_export_dir() -> PathBuf {
    PathBuf::from("./exports")
}
fn default_moving_average_window() -> usize {
    10
}
fn default_convergence_tolerance() -> f64 {
    0.01
}
fn default_target_efficiency() -> f64 {
    0.75
}
fn default_target_mobility() -> f64 {
    0.80
}
fn default_max_episodes() -> u64 {
    1000
}
fn default_learning_rate() -> f64 {
    0.001
}
fn default_num_vehicles() -> u32 {
    30
}
fn default_web_host() -> String {
    "localhost".to_string()
}
fn default_web_port() -> u16 {
    5000
}
fn default_seed() -> u64 {
    42
}
fn default_episode_delay_ms() -> u64 {
    20
}

const ENV_PREFIX: &str = "TRAFFICRL_";

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. config.toml (base configuration)
    /// 2. config.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (TRAFFICRL_* prefix)
    pub fn load() -> Result<Self, ConfigError> {
        let config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Load configuration from specific file path
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Write this configuration as TOML, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Write a commented sample configuration; never overwrites
    pub fn write_sample(path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let body = toml::to_string_pretty(&Config::default())?;
        fs::write(
            path,
            format!(
                "# TrafficRL configuration\n\
                 # Values here can be overridden by config.local.toml and\n\
                 # TRAFFICRL_<SECTION>__<KEY> environment variables.\n\n{body}"
            ),
        )?;
        Ok(())
    }

    /// Flattened hyperparameters recorded with every session
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot::new()
            .with("target_efficiency", self.training.target_efficiency)
            .with("target_mobility", self.training.target_mobility)
            .with("max_episodes", self.training.max_episodes)
            .with("learning_rate", self.agent.learning_rate)
            .with("num_vehicles", i64::from(self.environment.num_vehicles))
    }

    /// Decide the capability set given whether the store opened
    pub fn capabilities(&self, telemetry_available: bool) -> Capabilities {
        let telemetry = telemetry_available && self.telemetry.enabled;
        Capabilities {
            telemetry,
            analysis: telemetry && self.analysis.enabled,
            engine: self.engine.kind != EngineKind::None,
            web_monitor: self.web.enabled,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: default_data_dir(),
            durability_mode: DurabilityMode::Immediate,
            compaction_threshold: default_compaction_threshold(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            enabled: true,
            retention_days: default_retention_days(),
            session_list_limit: default_session_list_limit(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            enabled: true,
            output_dir: default_output_dir(),
            export_dir: default_export_dir(),
            moving_average_window: default_moving_average_window(),
            convergence_tolerance: default_convergence_tolerance(),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            target_efficiency: default_target_efficiency(),
            target_mobility: default_target_mobility(),
            max_episodes: default_max_episodes(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            learning_rate: default_learning_rate(),
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        EnvironmentConfig {
            num_vehicles: default_num_vehicles(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        WebConfig {
            enabled: true,
            host: default_web_host(),
            port: default_web_port(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            kind: EngineKind::Synthetic,
            seed: default_seed(),
            episode_delay_ms: default_episode_delay_ms(),
        }
    }
}
