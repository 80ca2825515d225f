//! Analysis reports
//!
//! Per-session reports go to `<output_dir>/<session_id>/`:
//!
//! ```text
//! report.json   # SessionSummary without the trend rows
//! trend.csv     # episode,reward,efficiency,mobility,reward_ma,...
//! ```
//!
//! The global summary goes to `<output_dir>/summary.json`. Report
//! generation only reads the store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::statistics::{GlobalSummary, SessionSummary, StatisticsAggregator, TrendPoint};
use crate::storage::{TelemetryError, TelemetryResult};

pub const REPORT_FILE: &str = "report.json";
pub const TREND_FILE: &str = "trend.csv";
pub const SUMMARY_FILE: &str = "summary.json";

const TREND_HEADER: [&str; 7] = [
    "episode",
    "reward",
    "efficiency",
    "mobility",
    "reward_ma",
    "efficiency_ma",
    "mobility_ma",
];

/// Where a session report was written
#[derive(Debug, Clone)]
pub struct ReportHandle {
    pub session_id: String,
    pub dir: PathBuf,
    pub report_path: PathBuf,
    pub trend_path: PathBuf,
    pub summary: SessionSummary,
}

/// Where the global summary was written
#[derive(Debug, Clone)]
pub struct SummaryHandle {
    pub path: PathBuf,
    pub summary: GlobalSummary,
}

#[derive(Serialize)]
struct SessionReport<'a> {
    generated_at: DateTime<Utc>,
    #[serde(flatten)]
    summary: &'a SessionSummary,
}

#[derive(Serialize)]
struct SummaryReport<'a> {
    generated_at: DateTime<Utc>,
    #[serde(flatten)]
    summary: &'a GlobalSummary,
}

pub struct ReportGenerator {
    stats: StatisticsAggregator,
    output_dir: PathBuf,
}

impl ReportGenerator {
    pub fn new(stats: StatisticsAggregator, output_dir: impl Into<PathBuf>) -> Self {
        ReportGenerator {
            stats,
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write the analysis of one session. `Ok(None)` if it does not exist.
    pub fn analyze(&self, session_id: &str) -> TelemetryResult<Option<ReportHandle>> {
        let summary = match self.stats.summarize_session(session_id) {
            Ok(summary) => summary,
            Err(TelemetryError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let dir = self.output_dir.join(session_dir_name(session_id));
        fs::create_dir_all(&dir).map_err(|e| TelemetryError::export_io(&dir, e))?;

        let report_path = dir.join(REPORT_FILE);
        let mut report = serde_json::to_value(SessionReport {
            generated_at: Utc::now(),
            summary: &summary,
        })?;
        // Trend rows live in the CSV
        if let Some(obj) = report.as_object_mut() {
            obj.remove("trend");
        }
        write_json(&report_path, &report)?;

        let trend_path = dir.join(TREND_FILE);
        write_trend_csv(&trend_path, &summary.trend)
            .map_err(|e| TelemetryError::export_io(&trend_path, e))?;

        tracing::info!(session = %session_id, dir = %dir.display(), "session report written");
        Ok(Some(ReportHandle {
            session_id: session_id.to_string(),
            dir,
            report_path,
            trend_path,
            summary,
        }))
    }

    /// Write the global summary
    pub fn summary_report(&self) -> TelemetryResult<SummaryHandle> {
        let summary = self.stats.summarize();
        fs::create_dir_all(&self.output_dir)
            .map_err(|e| TelemetryError::export_io(&self.output_dir, e))?;

        let path = self.output_dir.join(SUMMARY_FILE);
        write_json(
            &path,
            &SummaryReport {
                generated_at: Utc::now(),
                summary: &summary,
            },
        )?;
        tracing::info!(path = %path.display(), "summary report written");
        Ok(SummaryHandle { path, summary })
    }
}

/// Keep ids from escaping `output_dir`
pub(crate) fn session_dir_name(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> TelemetryResult<()> {
    let body = serde_json::to_vec_pretty(value)?;
    fs::write(path, body).map_err(|e| TelemetryError::export_io(path, e))
}

fn write_trend_csv(path: &Path, trend: &[TrendPoint]) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{}", TREND_HEADER.join(","))?;
    for p in trend {
        writeln!(
            writer,
            "{},{},{},{},{},{},{}",
            p.episode, p.reward, p.efficiency, p.mobility, p.reward_ma, p.efficiency_ma, p.mobility_ma
        )?;
    }
    writer.flush()
}
