//! Training / deployment engines
//!
//! The launcher drives an engine through [`TrainingEngine`]: `initialize`
//! once, then a blocking `run`. The engine only sees a [`RunContext`], which
//! writes episode metrics and events through the store and exposes the
//! cancellation token.
//!
//! [`SyntheticEngine`] simulates a learning curve so the launcher works end
//! to end without the external simulator.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, EngineKind};
use crate::execution::{CancelToken, Cancelled};
use crate::model::{EpisodeMetrics, Level, RunMode};
use crate::storage::TelemetryError;
use crate::store::TelemetryStore;

const SOURCE: &str = "engine";

/// Whether the engine should keep going after an episode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Continue,
    Stop,
}

/// What an engine reports when `run` returns
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub episodes: u64,
    /// Merged into the session result payload
    pub details: Map<String, Value>,
}

/// Everything a run may touch
pub struct RunContext {
    store: Option<Arc<TelemetryStore>>,
    session_id: String,
    mode: RunMode,
    max_episodes: u64,
    token: CancelToken,
}

impl RunContext {
    pub fn new(
        store: Option<Arc<TelemetryStore>>,
        session_id: impl Into<String>,
        mode: RunMode,
        max_episodes: u64,
        token: CancelToken,
    ) -> Self {
        RunContext {
            store,
            session_id: session_id.into(),
            mode,
            max_episodes,
            token,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn max_episodes(&self) -> u64 {
        self.max_episodes
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(Cancelled)` once the run was cancelled, for engines that bail out
    /// with `?`. The launcher records such a run as `stopped`.
    pub fn check_cancelled(&self) -> Result<(), Cancelled> {
        self.token.check()
    }

    /// Record one episode. Returns `Stop` once the run is cancelled or its
    /// session has been closed underneath it. Storage failures are traced
    /// and do not stop the run.
    pub fn record_episode(&self, metrics: EpisodeMetrics) -> Progress {
        if self.is_cancelled() {
            return Progress::Stop;
        }
        let Some(store) = &self.store else {
            return Progress::Continue;
        };
        match store.record_progress(&self.session_id, metrics) {
            Ok(()) => Progress::Continue,
            Err(TelemetryError::InvalidState { .. } | TelemetryError::NotFound(_)) => {
                tracing::info!(session = %self.session_id, "session no longer running, stopping");
                Progress::Stop
            }
            Err(e) => {
                tracing::warn!(session = %self.session_id, error = %e, "episode not recorded");
                Progress::Continue
            }
        }
    }

    /// Log an event attached to this run's session
    pub fn log(&self, level: Level, message: &str) {
        match &self.store {
            Some(store) => store.log(level, SOURCE, message, Some(&self.session_id)),
            None => tracing::info!(session = %self.session_id, %level, "{message}"),
        }
    }
}

/// A training or deployment backend
pub trait TrainingEngine: Send {
    fn name(&self) -> &str;

    /// Prepare the engine; `false` means it cannot run
    fn initialize(&mut self) -> bool;

    /// Run until done, cancelled, or told to stop by the context
    fn run(&mut self, ctx: &RunContext) -> anyhow::Result<RunOutcome>;
}

/// Creates a fresh engine for each run
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Box<dyn TrainingEngine>;
}

/// Build the factory selected by `[engine]`, if any
pub fn factory_from_config(config: &Config) -> Option<Arc<dyn EngineFactory>> {
    match config.engine.kind {
        EngineKind::Synthetic => Some(Arc::new(SyntheticEngineFactory::new(
            config.engine.seed,
            Duration::from_millis(config.engine.episode_delay_ms),
        ))),
        EngineKind::None => None,
    }
}

/// Factory for [`SyntheticEngine`]; each run gets the next seed
pub struct SyntheticEngineFactory {
    seed: u64,
    runs: AtomicU64,
    episode_delay: Duration,
}

impl SyntheticEngineFactory {
    pub fn new(seed: u64, episode_delay: Duration) -> Self {
        SyntheticEngineFactory {
            seed,
            runs: AtomicU64::new(0),
            episode_delay,
        }
    }
}

impl EngineFactory for SyntheticEngineFactory {
    fn create(&self) -> Box<dyn TrainingEngine> {
        let run = self.runs.fetch_add(1, Ordering::Relaxed);
        Box::new(SyntheticEngine::new(
            self.seed.wrapping_add(run),
            self.episode_delay,
        ))
    }
}

/// Seeded learning-curve simulator.
///
/// Efficiency and mobility rise along `1 - exp(-t / tau)` with small noise;
/// reward follows their sum. Deployment runs start fully trained.
pub struct SyntheticEngine {
    rng: StdRng,
    episode_delay: Duration,
    initialized: bool,
}

impl SyntheticEngine {
    pub fn new(seed: u64, episode_delay: Duration) -> Self {
        SyntheticEngine {
            rng: StdRng::seed_from_u64(seed),
            episode_delay,
            initialized: false,
        }
    }

    fn episode(&mut self, episode: u64, mode: RunMode, max_episodes: u64) -> EpisodeMetrics {
        let progress = match mode {
            RunMode::Deploy => 1.0,
            RunMode::Train => {
                let tau = (max_episodes as f64 / 4.0).max(1.0);
                1.0 - (-(episode as f64) / tau).exp()
            }
        };
        let mut noise = |scale: f64| self.rng.gen_range(-scale..scale);

        let efficiency = (0.40 + 0.45 * progress + noise(0.03)).clamp(0.0, 1.0);
        let mobility = (0.45 + 0.42 * progress + noise(0.03)).clamp(0.0, 1.0);
        let reward = efficiency + mobility - 1.0 + noise(0.05);

        EpisodeMetrics::new(episode, reward, efficiency, mobility)
            .with_kpi("avg_speed", 18.0 + 30.0 * mobility)
            .with_kpi("congestion_ratio", 1.0 - efficiency)
    }
}

impl TrainingEngine for SyntheticEngine {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn initialize(&mut self) -> bool {
        self.initialized = true;
        true
    }

    fn run(&mut self, ctx: &RunContext) -> anyhow::Result<RunOutcome> {
        anyhow::ensure!(self.initialized, "engine not initialized");
        ctx.check_cancelled()?;

        ctx.log(
            Level::Info,
            &format!("{} run started ({} episodes)", ctx.mode(), ctx.max_episodes()),
        );

        let mut episodes = 0;
        let mut last = None;
        for episode in 1..=ctx.max_episodes() {
            if ctx.is_cancelled() {
                break;
            }
            let metrics = self.episode(episode, ctx.mode(), ctx.max_episodes());
            let reward = metrics.reward;
            let efficiency = metrics.efficiency;
            if ctx.record_episode(metrics) == Progress::Stop {
                break;
            }
            episodes = episode;
            last = Some((reward, efficiency));

            if episode % 10 == 0 {
                ctx.log(
                    Level::Info,
                    &format!("episode {episode}: reward {reward:.3}, efficiency {efficiency:.3}"),
                );
            }
            if !self.episode_delay.is_zero() {
                std::thread::sleep(self.episode_delay);
            }
        }

        let mut details = Map::new();
        details.insert("engine".into(), self.name().into());
        details.insert("episodes".into(), episodes.into());
        if let Some((reward, efficiency)) = last {
            details.insert("final_reward".into(), reward.into());
            details.insert("final_efficiency".into(), efficiency.into());
        }
        Ok(RunOutcome { episodes, details })
    }
}
