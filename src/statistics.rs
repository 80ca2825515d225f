//! Training statistics over sessions and episodes.
//!
//! Nothing here is cached: every call reads the store at query time.
//!
//! - [`StatisticsAggregator::summarize`] aggregates across all sessions.
//!   Means are weighted by episode, so long sessions count proportionally
//!   more.
//! - [`StatisticsAggregator::summarize_session`] builds the per-session
//!   analysis (trends, moving averages, convergence).
//!
//! Ratio and mean fields are `Option<f64>`: `None` means the denominator was
//! zero and the value is undefined.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use trafficrl::config::DurabilityMode;
//! use trafficrl::model::{ConfigSnapshot, EpisodeMetrics};
//! use trafficrl::statistics::StatisticsAggregator;
//! use trafficrl::store::TelemetryStore;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let store = Arc::new(TelemetryStore::open_at(dir.path(), DurabilityMode::Batched, 0).unwrap());
//! store.start_session("train_1", ConfigSnapshot::new()).unwrap();
//! store.record_progress("train_1", EpisodeMetrics::new(1, 0.5, 0.7, 0.8)).unwrap();
//!
//! let stats = StatisticsAggregator::new(store, 10, 0.01);
//! let summary = stats.summarize();
//! assert_eq!(summary.total_episodes, 1);
//! assert_eq!(summary.avg_reward, Some(0.5));
//! ```

use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::AnalysisConfig;
use crate::model::{EpisodeMetrics, Session, SessionStatus};
use crate::storage::{SessionEntry, TelemetryError, TelemetryResult};
use crate::store::TelemetryStore;

/// Aggregates across every session in the store
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GlobalSummary {
    pub total_sessions: usize,
    pub running_sessions: usize,
    pub completed_sessions: usize,
    pub stopped_sessions: usize,
    pub failed_sessions: usize,
    pub total_episodes: usize,
    /// completed / total sessions
    pub completion_rate: Option<f64>,
    pub avg_reward: Option<f64>,
    pub avg_efficiency: Option<f64>,
    pub avg_mobility: Option<f64>,
    pub max_efficiency: Option<f64>,
    /// Highest episode reward of any session
    pub best_score: Option<f64>,
}

/// Partial sums for the parallel fold
#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    sessions: usize,
    running: usize,
    completed: usize,
    stopped: usize,
    failed: usize,
    episodes: usize,
    reward_sum: f64,
    efficiency_sum: f64,
    mobility_sum: f64,
    max_efficiency: Option<f64>,
    best_score: Option<f64>,
}

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

impl Totals {
    fn add_session(mut self, entry: &SessionEntry) -> Self {
        self.sessions += 1;
        match entry.session.status {
            SessionStatus::Running => self.running += 1,
            SessionStatus::Completed => self.completed += 1,
            SessionStatus::Stopped => self.stopped += 1,
            SessionStatus::Failed => self.failed += 1,
        }
        for m in &entry.episodes {
            self.episodes += 1;
            self.reward_sum += m.reward;
            self.efficiency_sum += m.efficiency;
            self.mobility_sum += m.mobility;
            self.max_efficiency = max_opt(self.max_efficiency, Some(m.efficiency));
        }
        self.best_score = max_opt(self.best_score, entry.session.best_score);
        self
    }

    fn merge(self, other: Self) -> Self {
        Totals {
            sessions: self.sessions + other.sessions,
            running: self.running + other.running,
            completed: self.completed + other.completed,
            stopped: self.stopped + other.stopped,
            failed: self.failed + other.failed,
            episodes: self.episodes + other.episodes,
            reward_sum: self.reward_sum + other.reward_sum,
            efficiency_sum: self.efficiency_sum + other.efficiency_sum,
            mobility_sum: self.mobility_sum + other.mobility_sum,
            max_efficiency: max_opt(self.max_efficiency, other.max_efficiency),
            best_score: max_opt(self.best_score, other.best_score),
        }
    }

    fn into_summary(self) -> GlobalSummary {
        let ratio = |num: f64, den: usize| (den > 0).then(|| num / den as f64);
        GlobalSummary {
            total_sessions: self.sessions,
            running_sessions: self.running,
            completed_sessions: self.completed,
            stopped_sessions: self.stopped,
            failed_sessions: self.failed,
            total_episodes: self.episodes,
            completion_rate: ratio(self.completed as f64, self.sessions),
            avg_reward: ratio(self.reward_sum, self.episodes),
            avg_efficiency: ratio(self.efficiency_sum, self.episodes),
            avg_mobility: ratio(self.mobility_sum, self.episodes),
            max_efficiency: self.max_efficiency,
            best_score: self.best_score,
        }
    }
}

/// Descriptive statistics of one metric over a session's episodes
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricStats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation
    pub std_dev: f64,
}

impl MetricStats {
    /// `None` for an empty slice
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        Some(MetricStats {
            count,
            mean,
            min,
            max,
            std_dev: variance.sqrt(),
        })
    }
}

/// An episode singled out by reward
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpisodeRef {
    pub episode: u64,
    pub reward: f64,
    pub efficiency: f64,
    pub mobility: f64,
}

impl From<&EpisodeMetrics> for EpisodeRef {
    fn from(m: &EpisodeMetrics) -> Self {
        EpisodeRef {
            episode: m.episode,
            reward: m.reward,
            efficiency: m.efficiency,
            mobility: m.mobility,
        }
    }
}

/// One row of the episode-indexed trend
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendPoint {
    pub episode: u64,
    pub reward: f64,
    pub efficiency: f64,
    pub mobility: f64,
    pub reward_ma: f64,
    pub efficiency_ma: f64,
    pub mobility_ma: f64,
}

/// Comparison of the last two full reward windows
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Convergence {
    pub window: usize,
    pub last_average: f64,
    pub previous_average: f64,
    /// `last_average - previous_average`
    pub delta: f64,
    /// `|delta| <= tolerance`
    pub converged: bool,
}

/// Per-session analysis
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session: Session,
    pub episodes: usize,
    pub reward: Option<MetricStats>,
    pub efficiency: Option<MetricStats>,
    pub mobility: Option<MetricStats>,
    /// Auxiliary KPIs, keyed by name
    pub kpis: BTreeMap<String, MetricStats>,
    pub best_episode: Option<EpisodeRef>,
    pub worst_episode: Option<EpisodeRef>,
    pub moving_average_window: usize,
    pub trend: Vec<TrendPoint>,
    /// `None` until two full windows exist
    pub convergence: Option<Convergence>,
    /// First episode meeting both efficiency and mobility targets
    pub first_target_episode: Option<u64>,
}

/// Trailing moving average; the first `window - 1` points average what is
/// available. A zero window is treated as 1.
pub fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, v) in values.iter().enumerate() {
        sum += v;
        if i >= window {
            sum -= values[i - window];
        }
        out.push(sum / (i + 1).min(window) as f64);
    }
    out
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Compare the mean of the last `window` rewards with the window before it
pub fn convergence(rewards: &[f64], window: usize, tolerance: f64) -> Option<Convergence> {
    let window = window.max(1);
    if rewards.len() < window * 2 {
        return None;
    }
    let n = rewards.len();
    let last_average = mean(&rewards[n - window..]);
    let previous_average = mean(&rewards[n - 2 * window..n - window]);
    let delta = last_average - previous_average;
    Some(Convergence {
        window,
        last_average,
        previous_average,
        delta,
        converged: delta.abs() <= tolerance,
    })
}

/// Computes summaries from a shared store
#[derive(Clone)]
pub struct StatisticsAggregator {
    store: Arc<TelemetryStore>,
    window: usize,
    tolerance: f64,
}

impl StatisticsAggregator {
    pub fn new(store: Arc<TelemetryStore>, window: usize, tolerance: f64) -> Self {
        StatisticsAggregator {
            store,
            window: window.max(1),
            tolerance,
        }
    }

    pub fn from_config(store: Arc<TelemetryStore>, config: &AnalysisConfig) -> Self {
        Self::new(
            store,
            config.moving_average_window,
            config.convergence_tolerance,
        )
    }

    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Global summary; an empty store yields zero counts and `None` ratios
    pub fn summarize(&self) -> GlobalSummary {
        let tables = self.store.read();
        tables
            .sessions
            .par_iter()
            .fold(Totals::default, |acc, (_, entry)| acc.add_session(entry))
            .reduce(Totals::default, Totals::merge)
            .into_summary()
    }

    /// Per-session analysis
    pub fn summarize_session(&self, id: &str) -> TelemetryResult<SessionSummary> {
        // Copy out under the read lock, compute without it
        let (session, episodes) = {
            let tables = self.store.read();
            let entry = tables
                .sessions
                .get(id)
                .ok_or_else(|| TelemetryError::NotFound(id.to_string()))?;
            (entry.session.clone(), entry.episodes.clone())
        };
        Ok(self.build_session_summary(session, &episodes))
    }

    fn build_session_summary(&self, session: Session, episodes: &[EpisodeMetrics]) -> SessionSummary {
        let rewards: Vec<f64> = episodes.iter().map(|m| m.reward).collect();
        let efficiency: Vec<f64> = episodes.iter().map(|m| m.efficiency).collect();
        let mobility: Vec<f64> = episodes.iter().map(|m| m.mobility).collect();

        let mut kpi_values: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for m in episodes {
            for (name, value) in &m.kpis {
                kpi_values.entry(name.clone()).or_default().push(*value);
            }
        }
        let kpis = kpi_values
            .into_iter()
            .filter_map(|(name, values)| MetricStats::from_values(&values).map(|s| (name, s)))
            .collect();

        // Ties keep the earliest episode
        let best_episode = episodes
            .iter()
            .reduce(|best, m| if m.reward > best.reward { m } else { best })
            .map(EpisodeRef::from);
        let worst_episode = episodes
            .iter()
            .reduce(|worst, m| if m.reward < worst.reward { m } else { worst })
            .map(EpisodeRef::from);

        let reward_ma = moving_average(&rewards, self.window);
        let efficiency_ma = moving_average(&efficiency, self.window);
        let mobility_ma = moving_average(&mobility, self.window);
        let trend = episodes
            .iter()
            .enumerate()
            .map(|(i, m)| TrendPoint {
                episode: m.episode,
                reward: m.reward,
                efficiency: m.efficiency,
                mobility: m.mobility,
                reward_ma: reward_ma[i],
                efficiency_ma: efficiency_ma[i],
                mobility_ma: mobility_ma[i],
            })
            .collect();

        let targets = (
            session.config.get_f64("target_efficiency"),
            session.config.get_f64("target_mobility"),
        );
        let first_target_episode = match targets {
            (Some(eff), Some(mob)) => episodes
                .iter()
                .find(|m| m.efficiency >= eff && m.mobility >= mob)
                .map(|m| m.episode),
            _ => None,
        };

        SessionSummary {
            episodes: episodes.len(),
            reward: MetricStats::from_values(&rewards),
            efficiency: MetricStats::from_values(&efficiency),
            mobility: MetricStats::from_values(&mobility),
            kpis,
            best_episode,
            worst_episode,
            moving_average_window: self.window,
            trend,
            convergence: convergence(&rewards, self.window, self.tolerance),
            first_target_episode,
            session,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurabilityMode;
    use crate::model::{ConfigSnapshot, SessionResult};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<TelemetryStore>) {
        let temp = TempDir::new().unwrap();
        let store =
            Arc::new(TelemetryStore::open_at(temp.path(), DurabilityMode::Batched, 0).unwrap());
        (temp, store)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_moving_average_partial_windows() {
        let ma = moving_average(&[1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(ma, vec![1.0, 1.5, 2.5, 3.5]);
        assert_eq!(moving_average(&[2.0, 4.0], 0), vec![2.0, 4.0]);
        assert!(moving_average(&[], 3).is_empty());
    }

    #[test]
    fn test_convergence_needs_two_windows() {
        assert!(convergence(&[1.0, 1.0, 1.0], 2, 0.1).is_none());

        let c = convergence(&[0.0, 0.2, 0.5, 0.5], 2, 0.01).unwrap();
        assert!(approx(c.previous_average, 0.1));
        assert!(approx(c.last_average, 0.5));
        assert!(!c.converged);

        let c = convergence(&[0.5, 0.5, 0.505, 0.5], 2, 0.01).unwrap();
        assert!(c.converged);
    }

    #[test]
    fn test_metric_stats() {
        assert!(MetricStats::from_values(&[]).is_none());
        let s = MetricStats::from_values(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(s.count, 8);
        assert!(approx(s.mean, 5.0));
        assert!(approx(s.std_dev, 2.0));
        assert_eq!(s.min, 2.0);
        assert_eq!(s.max, 9.0);
    }

    #[test]
    fn test_empty_store_summary() {
        let (_temp, store) = setup();
        let summary = StatisticsAggregator::new(store, 10, 0.01).summarize();
        assert_eq!(summary.total_sessions, 0);
        assert_eq!(summary.total_episodes, 0);
        assert_eq!(summary.completion_rate, None);
        assert_eq!(summary.avg_reward, None);
        assert_eq!(summary.max_efficiency, None);
    }

    #[test]
    fn test_episode_weighted_means() {
        let (_temp, store) = setup();
        store.start_session("long", ConfigSnapshot::new()).unwrap();
        for i in 0..3 {
            store
                .record_progress("long", EpisodeMetrics::new(i, 1.0, 0.5, 0.5))
                .unwrap();
        }
        store.end_session("long", SessionResult::completed()).unwrap();
        store.start_session("short", ConfigSnapshot::new()).unwrap();
        store
            .record_progress("short", EpisodeMetrics::new(0, 0.0, 0.9, 0.1))
            .unwrap();
        store.end_session("short", SessionResult::failed("x")).unwrap();

        let summary = StatisticsAggregator::new(store, 10, 0.01).summarize();
        assert_eq!(summary.total_sessions, 2);
        assert_eq!(summary.completed_sessions, 1);
        assert_eq!(summary.failed_sessions, 1);
        assert_eq!(summary.total_episodes, 4);
        assert_eq!(summary.completion_rate, Some(0.5));
        // (1+1+1+0)/4, not the per-session mean 0.5
        assert!(approx(summary.avg_reward.unwrap(), 0.75));
        assert_eq!(summary.max_efficiency, Some(0.9));
        assert_eq!(summary.best_score, Some(1.0));
    }

    #[test]
    fn test_session_summary_scenario() {
        let (_temp, store) = setup();
        store
            .start_session(
                "train_20240101_0000",
                ConfigSnapshot::new().with("max_episodes", 100_i64),
            )
            .unwrap();
        for (i, r) in [0.2, 0.5, 0.4].into_iter().enumerate() {
            store
                .record_progress("train_20240101_0000", EpisodeMetrics::new(i as u64 + 1, r, 0.5, 0.5))
                .unwrap();
        }
        store
            .end_session("train_20240101_0000", SessionResult::completed())
            .unwrap();

        let summary = StatisticsAggregator::new(store, 2, 0.01)
            .summarize_session("train_20240101_0000")
            .unwrap();
        assert_eq!(summary.session.episode_count, 3);
        assert_eq!(summary.session.best_score, Some(0.5));
        assert!(approx(summary.reward.unwrap().mean, 1.1 / 3.0));
        assert_eq!(summary.best_episode.unwrap().episode, 2);
        assert_eq!(summary.worst_episode.unwrap().episode, 1);
        assert_eq!(summary.trend.len(), 3);
        assert!(approx(summary.trend[2].reward_ma, 0.45));
        assert!(summary.convergence.is_none());
        assert_eq!(summary.first_target_episode, None);
    }

    #[test]
    fn test_first_target_episode() {
        let (_temp, store) = setup();
        let config = ConfigSnapshot::new()
            .with("target_efficiency", 0.75)
            .with("target_mobility", 0.8);
        store.start_session("s", config).unwrap();
        store.record_progress("s", EpisodeMetrics::new(1, 0.1, 0.8, 0.7)).unwrap();
        store.record_progress("s", EpisodeMetrics::new(2, 0.2, 0.76, 0.81)).unwrap();
        store.record_progress("s", EpisodeMetrics::new(3, 0.3, 0.9, 0.9)).unwrap();

        let summary = StatisticsAggregator::new(store, 10, 0.01)
            .summarize_session("s")
            .unwrap();
        assert_eq!(summary.first_target_episode, Some(2));
    }

    #[test]
    fn test_kpi_stats() {
        let (_temp, store) = setup();
        store.start_session("s", ConfigSnapshot::new()).unwrap();
        store
            .record_progress("s", EpisodeMetrics::new(1, 0.1, 0.1, 0.1).with_kpi("avg_speed", 20.0))
            .unwrap();
        store
            .record_progress("s", EpisodeMetrics::new(2, 0.1, 0.1, 0.1).with_kpi("avg_speed", 30.0))
            .unwrap();
        let summary = StatisticsAggregator::new(store, 10, 0.01)
            .summarize_session("s")
            .unwrap();
        assert!(approx(summary.kpis["avg_speed"].mean, 25.0));
    }

    #[test]
    fn test_unknown_session() {
        let (_temp, store) = setup();
        let err = StatisticsAggregator::new(store, 10, 0.01)
            .summarize_session("nope")
            .unwrap_err();
        assert!(matches!(err, TelemetryError::NotFound(_)));
    }

    #[test]
    fn test_empty_session_summary() {
        let (_temp, store) = setup();
        store.start_session("s", ConfigSnapshot::new()).unwrap();
        let summary = StatisticsAggregator::new(store, 10, 0.01)
            .summarize_session("s")
            .unwrap();
        assert_eq!(summary.episodes, 0);
        assert!(summary.reward.is_none());
        assert!(summary.best_episode.is_none());
        assert!(summary.trend.is_empty());
    }
}
