//! Interactive launcher
//!
//! Text menus over the telemetry store and the training engine. Every menu
//! action returns `anyhow::Result`; failures are printed and control goes
//! back to the menu.
//!
//! Input comes from a [`LineSource`] ([`TerminalInput`] with line editing,
//! or [`ScriptedInput`] for non-interactive runs) and output goes to any
//! `Write`, so the whole launcher can be driven from tests.

use anyhow::{bail, Context as _};
use chrono::{DateTime, Local, Utc};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Capabilities, Config, ConfigError};
use crate::engine::{EngineFactory, RunContext};
use crate::execution::{CancelToken, Cancelled, ShutdownHandle};
use crate::export::ExportEngine;
use crate::model::{precise_session_id, session_id, Level, RunMode, Session, SessionResult};
use crate::report::ReportGenerator;
use crate::statistics::StatisticsAggregator;
use crate::storage::TelemetryError;
use crate::store::{CloseOutcome, EventQuery, TelemetryStore};

const SOURCE: &str = "launcher";
const RULE: &str = "============================================================";

/// Directories the project setup menu checks for
pub const PROJECT_DIRS: [&str; 5] = ["models", "logs", "data", "analysis_output", "exports"];

/// Reward an operator should expect from a trained agent
const TARGET_REWARD: f64 = 0.5;

/// Source of operator input. `None` means no more input (EOF or Ctrl-C at
/// the prompt).
pub trait LineSource {
    fn read_line(&mut self, prompt: &str) -> Option<String>;
}

/// Terminal input with line editing and history
pub struct TerminalInput {
    editor: DefaultEditor,
}

impl TerminalInput {
    pub fn new() -> anyhow::Result<Self> {
        Ok(TerminalInput {
            editor: DefaultEditor::new().context("failed to initialize line editor")?,
        })
    }
}

impl LineSource for TerminalInput {
    fn read_line(&mut self, prompt: &str) -> Option<String> {
        match self.editor.readline(prompt) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = self.editor.add_history_entry(line.as_str());
                }
                Some(line)
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read input");
                None
            }
        }
    }
}

/// Pre-recorded input, one answer per line
pub struct ScriptedInput {
    lines: VecDeque<String>,
}

impl ScriptedInput {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScriptedInput {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?;
        Ok(Self::new(text.lines()))
    }
}

impl LineSource for ScriptedInput {
    fn read_line(&mut self, _prompt: &str) -> Option<String> {
        self.lines.pop_front()
    }
}

/// Everything the launcher is wired with at startup
pub struct LauncherContext {
    pub config: Config,
    /// Where "save config" writes
    pub config_path: PathBuf,
    pub capabilities: Capabilities,
    pub store: Option<Arc<TelemetryStore>>,
    pub engines: Option<Arc<dyn EngineFactory>>,
    pub shutdown: Arc<ShutdownHandle>,
    /// Base for the project setup checks
    pub project_root: PathBuf,
}

/// Why the menu loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Operator chose exit
    Requested,
    /// Input ended
    EndOfInput,
}

pub struct Launcher {
    ctx: LauncherContext,
    input: Box<dyn LineSource>,
    out: Box<dyn Write + Send>,
    end_of_input: bool,
}

impl Launcher {
    pub fn new(ctx: LauncherContext, input: Box<dyn LineSource>, out: Box<dyn Write + Send>) -> Self {
        Launcher {
            ctx,
            input,
            out,
            end_of_input: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    fn say(&mut self, line: impl AsRef<str>) {
        let _ = writeln!(self.out, "{}", line.as_ref());
    }

    fn prompt(&mut self, prompt: &str) -> Option<String> {
        let _ = self.out.flush();
        match self.input.read_line(prompt) {
            Some(line) => Some(line.trim().to_string()),
            None => {
                self.end_of_input = true;
                None
            }
        }
    }

    fn pause(&mut self) {
        self.prompt("Press Enter to return to the menu...");
    }

    fn store(&self) -> anyhow::Result<&Arc<TelemetryStore>> {
        match &self.ctx.store {
            Some(store) if self.ctx.capabilities.telemetry => Ok(store),
            _ => bail!("telemetry store is unavailable"),
        }
    }

    fn stats(&self) -> anyhow::Result<StatisticsAggregator> {
        Ok(StatisticsAggregator::from_config(
            Arc::clone(self.store()?),
            &self.ctx.config.analysis,
        ))
    }

    fn log_event(&self, level: Level, message: &str, session: Option<&str>) {
        if let Some(store) = &self.ctx.store {
            store.log(level, SOURCE, message, session);
        }
    }

    /// Main menu loop; closes the store on the way out
    pub fn run(&mut self) -> ExitReason {
        tracing::info!(capabilities = ?self.ctx.capabilities, "launcher started");
        let reason = loop {
            self.show_main_menu();
            let Some(choice) = self.prompt("Select an option (0-8): ") else {
                break ExitReason::EndOfInput;
            };
            let result = match choice.as_str() {
                "1" => self.start_run(RunMode::Train),
                "2" => self.start_deployment(),
                "3" => self.analysis_menu(),
                "4" => self.config_menu(),
                "5" => self.database_menu(),
                "6" => self.web_monitor(),
                "7" => self.system_info(),
                "8" => self.project_setup(),
                "0" => break ExitReason::Requested,
                _ => {
                    self.say("Invalid choice, enter 0-8");
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "menu action failed");
                self.say(format!("Error: {e:#}"));
            }
            if self.end_of_input {
                break ExitReason::EndOfInput;
            }
        };
        self.shutdown();
        reason
    }

    fn show_main_menu(&mut self) {
        self.say("");
        self.say(RULE);
        self.say("Traffic Signal Control - Launcher");
        self.say(RULE);
        self.say("1. Start training");
        self.say("2. Deployment mode");
        self.say("3. Performance analysis");
        self.say("4. Configuration");
        self.say("5. Database management");
        self.say("6. Web monitor");
        self.say("7. System information");
        self.say("8. Project setup");
        self.say("0. Exit");
        self.say(RULE);
    }

    fn shutdown(&mut self) {
        self.say("Shutting down...");
        self.ctx.shutdown.close_store();
        self.say("Shutdown complete");
    }

    // Runs

    fn start_deployment(&mut self) -> anyhow::Result<()> {
        self.say("Deployment mode drives traffic control with the trained model");
        if self.prompt("Press Enter to continue...").is_none() {
            return Ok(());
        }
        self.start_run(RunMode::Deploy)
    }

    /// Register a session under a fresh id, regenerating with microsecond
    /// precision on collision
    fn register_session(&mut self, store: &TelemetryStore, mode: RunMode) -> anyhow::Result<String> {
        let snapshot = self.ctx.config.snapshot();
        let now = Local::now();
        let id = session_id(mode, now);
        match store.start_session(&id, snapshot.clone()) {
            Ok(()) => Ok(id),
            Err(TelemetryError::DuplicateSession(_)) => {
                let id = precise_session_id(mode, Local::now());
                tracing::debug!(session = %id, "session id collided, using precise id");
                store.start_session(&id, snapshot)?;
                Ok(id)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn start_run(&mut self, mode: RunMode) -> anyhow::Result<()> {
        let factory = match (&self.ctx.engines, self.ctx.capabilities.engine) {
            (Some(factory), true) => Arc::clone(factory),
            _ => bail!("traffic system is unavailable, check the [engine] configuration"),
        };

        let store = self.ctx.store.clone().filter(|_| self.ctx.capabilities.telemetry);
        let (session_id, recorded) = match &store {
            Some(store) => match self.register_session(store, mode) {
                Ok(id) => (id, true),
                Err(e) => {
                    self.say(format!("Warning: session not recorded: {e:#}"));
                    (session_id(mode, Local::now()), false)
                }
            },
            None => (session_id(mode, Local::now()), false),
        };
        let store = store.filter(|_| recorded);

        if let Some(store) = &store {
            store.log(
                Level::Info,
                SOURCE,
                &format!("Started {mode} session: {session_id}"),
                Some(&session_id),
            );
        }
        self.say(format!("Session id: {session_id}"));
        self.say("Press Ctrl-C to stop the run");

        let token = self.ctx.shutdown.begin_run(&session_id);
        let mut engine = factory.create();
        let result = if !engine.initialize() {
            self.log_event(Level::Error, "Engine initialization failed", Some(&session_id));
            SessionResult::failed("engine initialization failed")
        } else {
            let run_ctx = RunContext::new(
                store.clone(),
                session_id.clone(),
                mode,
                self.ctx.config.training.max_episodes,
                token.clone(),
            );
            match engine.run(&run_ctx) {
                Ok(outcome) => {
                    let mut result = if token.is_cancelled() {
                        stopped_after(&token)
                    } else {
                        SessionResult::completed()
                    };
                    result.details.extend(outcome.details);
                    result
                }
                Err(e) if e.is::<Cancelled>() => {
                    tracing::info!(session = %session_id, "run bailed out after cancellation");
                    stopped_after(&token)
                }
                Err(e) => {
                    let message = format!("Run failed: {e:#}");
                    self.log_event(Level::Error, &message, Some(&session_id));
                    SessionResult::failed(format!("{e:#}"))
                }
            }
        };
        self.ctx.shutdown.end_run();

        let status = result.status;
        if let Some(store) = &store {
            match store.end_session(&session_id, result) {
                Ok(CloseOutcome::Closed) => {}
                Ok(CloseOutcome::AlreadyClosed) => {
                    tracing::debug!(session = %session_id, "session was closed by the interrupt path");
                }
                Err(e) => self.say(format!("Warning: failed to close session: {e}")),
            }
            if let Some(session) = store.get_session(&session_id) {
                self.say(format!(
                    "Session {} finished: {} | episodes: {} | best score: {}",
                    session.id,
                    session.status,
                    session.episode_count,
                    fmt_opt(session.best_score, 3)
                ));
                return Ok(());
            }
        }
        self.say(format!("Run {session_id} finished: {status}"));
        Ok(())
    }

    // Analysis

    fn analysis_menu(&mut self) -> anyhow::Result<()> {
        if !self.ctx.capabilities.analysis {
            bail!("analysis is unavailable");
        }
        loop {
            self.say("");
            self.say("Analysis:");
            self.say("1. Analyze a session");
            self.say("2. List sessions");
            self.say("3. Summary report");
            self.say("4. Compare sessions");
            self.say("0. Back");
            let Some(choice) = self.prompt("Select (0-4): ") else {
                return Ok(());
            };
            let result = match choice.as_str() {
                "1" => self.analyze_session(),
                "2" => self.list_sessions(),
                "3" => self.summary_report(),
                "4" => {
                    self.say("Session comparison is not available");
                    Ok(())
                }
                "0" => return Ok(()),
                _ => {
                    self.say("Invalid choice");
                    Ok(())
                }
            };
            if let Err(e) = result {
                self.say(format!("Error: {e:#}"));
            }
            if self.end_of_input {
                return Ok(());
            }
        }
    }

    /// Print a numbered list of recent sessions and read a selection
    fn pick_session(&mut self, heading: &str) -> anyhow::Result<Option<String>> {
        let sessions = self.store()?.get_sessions(10);
        if sessions.is_empty() {
            self.say("No sessions found");
            return Ok(None);
        }
        self.say("");
        self.say(heading);
        for (i, session) in sessions.iter().enumerate() {
            self.say(format!(
                "{}. {} - {} ({})",
                i + 1,
                session.id,
                fmt_time(session.started_at),
                session.status
            ));
        }
        let Some(answer) = self.prompt("Session number: ") else {
            return Ok(None);
        };
        match answer.parse::<usize>() {
            Ok(n) if (1..=sessions.len()).contains(&n) => Ok(Some(sessions[n - 1].id.clone())),
            _ => {
                self.say("Invalid session number");
                Ok(None)
            }
        }
    }

    fn analyze_session(&mut self) -> anyhow::Result<()> {
        let Some(id) = self.pick_session("Available sessions:")? else {
            return Ok(());
        };
        self.say(format!("Analyzing session {id}..."));
        let reports = ReportGenerator::new(self.stats()?, &self.ctx.config.analysis.output_dir);
        let Some(handle) = reports.analyze(&id)? else {
            self.say(format!("Session {id} no longer exists"));
            return Ok(());
        };

        let summary = &handle.summary;
        self.say(format!("Episodes: {}", summary.episodes));
        if let Some(reward) = &summary.reward {
            self.say(format!(
                "Reward: mean {:.3} | min {:.3} | max {:.3} | std {:.3}",
                reward.mean, reward.min, reward.max, reward.std_dev
            ));
        }
        if let (Some(best), Some(worst)) = (&summary.best_episode, &summary.worst_episode) {
            self.say(format!(
                "Best episode: {} ({:.3}) | worst episode: {} ({:.3})",
                best.episode, best.reward, worst.episode, worst.reward
            ));
        }
        match &summary.convergence {
            Some(c) => self.say(format!(
                "Convergence (window {}): delta {:+.4} -> {}",
                c.window,
                c.delta,
                if c.converged { "converged" } else { "still improving" }
            )),
            None => self.say("Convergence: not enough episodes"),
        }
        if let Some(episode) = summary.first_target_episode {
            self.say(format!("Targets first reached at episode {episode}"));
        }
        self.say(format!("Report written to {}", handle.dir.display()));
        Ok(())
    }

    fn list_sessions(&mut self) -> anyhow::Result<()> {
        let limit = self.ctx.config.telemetry.session_list_limit;
        let sessions = self.store()?.get_sessions(limit);
        self.say("");
        self.say(format!("Sessions (most recent {limit}):"));
        self.say("-".repeat(100));
        for session in &sessions {
            self.say(session_row(session));
        }
        self.say("-".repeat(100));
        Ok(())
    }

    fn summary_report(&mut self) -> anyhow::Result<()> {
        self.say("Generating summary report...");
        let reports = ReportGenerator::new(self.stats()?, &self.ctx.config.analysis.output_dir);
        let handle = reports.summary_report()?;
        let s = &handle.summary;
        self.say(format!("Total sessions: {}", s.total_sessions));
        self.say(format!("Total episodes: {}", s.total_episodes));
        self.say(format!("Average reward: {}", fmt_opt(s.avg_reward, 3)));
        self.say(format!("Completion rate: {}", fmt_pct(s.completion_rate)));
        self.say(format!("Report written to {}", handle.path.display()));
        Ok(())
    }

    // Configuration

    fn config_menu(&mut self) -> anyhow::Result<()> {
        loop {
            self.say("");
            self.say("Configuration:");
            self.say("1. View current configuration");
            self.say("2. Modify configuration");
            self.say("3. Save configuration");
            self.say("4. Create sample configuration");
            self.say("0. Back");
            let Some(choice) = self.prompt("Select (0-4): ") else {
                return Ok(());
            };
            let result = match choice.as_str() {
                "1" => self.view_config(),
                "2" => self.modify_config(),
                "3" => self.save_config(),
                "4" => self.create_sample_config(),
                "0" => return Ok(()),
                _ => {
                    self.say("Invalid choice");
                    Ok(())
                }
            };
            if let Err(e) = result {
                self.say(format!("Error: {e:#}"));
            }
            if self.end_of_input {
                return Ok(());
            }
        }
    }

    fn view_config(&mut self) -> anyhow::Result<()> {
        let text = toml::to_string_pretty(&self.ctx.config).map_err(ConfigError::from)?;
        self.say(text);
        Ok(())
    }

    fn modify_config(&mut self) -> anyhow::Result<()> {
        self.say("Tunable settings:");
        self.say("1. Target efficiency");
        self.say("2. Target mobility");
        self.say("3. Max episodes");
        self.say("4. Learning rate");
        self.say("5. Number of vehicles");
        let Some(choice) = self.prompt("Setting to change (1-5): ") else {
            return Ok(());
        };

        let config = &self.ctx.config;
        let (label, current) = match choice.as_str() {
            "1" => ("target efficiency", config.training.target_efficiency.to_string()),
            "2" => ("target mobility", config.training.target_mobility.to_string()),
            "3" => ("max episodes", config.training.max_episodes.to_string()),
            "4" => ("learning rate", config.agent.learning_rate.to_string()),
            "5" => ("number of vehicles", config.environment.num_vehicles.to_string()),
            _ => {
                self.say("Invalid choice");
                return Ok(());
            }
        };
        let Some(value) = self.prompt(&format!("New {label} (current: {current}): ")) else {
            return Ok(());
        };

        let config = &mut self.ctx.config;
        match choice.as_str() {
            "1" => config.training.target_efficiency = parse_value(&value, label)?,
            "2" => config.training.target_mobility = parse_value(&value, label)?,
            "3" => config.training.max_episodes = parse_value(&value, label)?,
            "4" => config.agent.learning_rate = parse_value(&value, label)?,
            _ => config.environment.num_vehicles = parse_value(&value, label)?,
        }
        self.say("Configuration updated");
        Ok(())
    }

    fn save_config(&mut self) -> anyhow::Result<()> {
        self.ctx.config.save(&self.ctx.config_path)?;
        self.say(format!("Configuration saved to {}", self.ctx.config_path.display()));
        Ok(())
    }

    fn create_sample_config(&mut self) -> anyhow::Result<()> {
        let path = self.ctx.project_root.join("config.sample.toml");
        Config::write_sample(&path)?;
        self.say(format!("Sample configuration written to {}", path.display()));
        Ok(())
    }

    // Database

    fn database_menu(&mut self) -> anyhow::Result<()> {
        self.store()?;
        loop {
            self.say("");
            self.say("Database:");
            self.say("1. Statistics");
            self.say("2. Purge old data");
            self.say("3. Export a session");
            self.say("4. View recent events");
            self.say("0. Back");
            let Some(choice) = self.prompt("Select (0-4): ") else {
                return Ok(());
            };
            let result = match choice.as_str() {
                "1" => self.database_statistics(),
                "2" => self.purge_old_data(),
                "3" => self.export_session(),
                "4" => self.view_events(),
                "0" => return Ok(()),
                _ => {
                    self.say("Invalid choice");
                    Ok(())
                }
            };
            if let Err(e) = result {
                self.say(format!("Error: {e:#}"));
            }
            if self.end_of_input {
                return Ok(());
            }
        }
    }

    fn database_statistics(&mut self) -> anyhow::Result<()> {
        let summary = self.stats()?.summarize();
        let counts = self.store()?.counts();
        self.say("");
        self.say("Database statistics:");
        self.say(format!("Total episodes: {}", summary.total_episodes));
        self.say(format!("Average reward: {}", fmt_opt(summary.avg_reward, 3)));
        self.say(format!("Average efficiency: {}", fmt_opt(summary.avg_efficiency, 3)));
        self.say(format!("Average mobility: {}", fmt_opt(summary.avg_mobility, 3)));
        self.say(format!("Total sessions: {}", summary.total_sessions));
        self.say(format!("Completed sessions: {}", summary.completed_sessions));
        self.say(format!("Events: {}", counts.events));
        self.say(format!("Journal size: {} bytes", counts.journal_bytes));
        Ok(())
    }

    fn purge_old_data(&mut self) -> anyhow::Result<()> {
        let default_days = self.ctx.config.telemetry.retention_days;
        let Some(answer) = self.prompt(&format!("Days of data to keep (default {default_days}): "))
        else {
            return Ok(());
        };
        let days = if answer.is_empty() {
            default_days
        } else {
            parse_value::<u32>(&answer, "number of days")?
        };

        let Some(confirm) = self.prompt(&format!("Delete data older than {days} days? (y/N): "))
        else {
            return Ok(());
        };
        if !confirm.eq_ignore_ascii_case("y") {
            self.say("Purge cancelled");
            return Ok(());
        }

        let report = self.store()?.purge_older_than(days)?;
        self.log_event(
            Level::Info,
            &format!(
                "Purged {} sessions, {} episodes, {} events older than {days} days",
                report.sessions, report.episodes, report.events
            ),
            None,
        );
        self.say(format!(
            "Purge complete: {} sessions, {} episodes, {} events removed",
            report.sessions, report.episodes, report.events
        ));
        Ok(())
    }

    fn export_session(&mut self) -> anyhow::Result<()> {
        let Some(id) = self.pick_session("Sessions available for export:")? else {
            return Ok(());
        };
        let path = ExportEngine::default_path(&self.ctx.config.analysis.export_dir, &id);
        let exports = ExportEngine::new(Arc::clone(self.store()?));
        match exports.export(&id, &path) {
            Ok(receipt) => self.say(format!(
                "Exported {} episodes and {} events to {}",
                receipt.episodes,
                receipt.events,
                receipt.path.display()
            )),
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "export failed");
                self.say(format!("Export failed: {e}"));
            }
        }
        Ok(())
    }

    fn view_events(&mut self) -> anyhow::Result<()> {
        let Some(answer) = self.prompt("Minimum level (INFO/WARNING/ERROR, default INFO): ") else {
            return Ok(());
        };
        let min_level = if answer.is_empty() {
            Level::Info
        } else {
            answer.parse::<Level>().map_err(anyhow::Error::msg)?
        };

        let events = self
            .store()?
            .query(&EventQuery::new().min_level(min_level).limit(20));
        if events.is_empty() {
            self.say("No events");
            return Ok(());
        }
        for event in events {
            let session = event
                .session_id
                .map(|id| format!(" [{id}]"))
                .unwrap_or_default();
            self.say(format!(
                "{} {:<7} {}: {}{}",
                fmt_time(event.timestamp),
                event.level,
                event.source,
                event.message,
                session
            ));
        }
        Ok(())
    }

    // Information

    fn web_monitor(&mut self) -> anyhow::Result<()> {
        let web = &self.ctx.config.web;
        if self.ctx.capabilities.web_monitor {
            let url = format!("http://{}:{}", web.host, web.port);
            self.say(format!("Web monitor: {url}"));
            self.say("Open the address above in a browser for live monitoring");
        } else {
            self.say("Web monitor is disabled, enable it in [web]");
        }
        self.pause();
        Ok(())
    }

    fn system_info(&mut self) -> anyhow::Result<()> {
        let caps = self.ctx.capabilities;
        let mark = |on: bool| if on { "[x]" } else { "[ ]" };
        self.say("");
        self.say(RULE);
        self.say("Traffic Signal Control");
        self.say("Reinforcement-learning traffic optimization");
        self.say(RULE);
        self.say("Components:");
        self.say(format!("  {} traffic engine", mark(caps.engine)));
        self.say(format!("  {} telemetry store", mark(caps.telemetry)));
        self.say(format!("  {} performance analysis", mark(caps.analysis)));
        self.say(format!("  {} web monitor", mark(caps.web_monitor)));

        let (efficiency, mobility) = (
            self.ctx.config.training.target_efficiency,
            self.ctx.config.training.target_mobility,
        );
        self.say("KPI targets:");
        self.say(format!("  efficiency >= {:.0}%", efficiency * 100.0));
        self.say(format!("  mobility   >= {:.0}%", mobility * 100.0));
        self.say(format!("  reward     >= {TARGET_REWARD}"));

        if let Ok(stats) = self.stats() {
            let summary = stats.summarize();
            if summary.total_episodes > 0 {
                self.say("History:");
                self.say(format!("  total episodes: {}", summary.total_episodes));
                self.say(format!("  average efficiency: {}", fmt_pct(summary.avg_efficiency)));
                self.say(format!("  best efficiency: {}", fmt_pct(summary.max_efficiency)));
            }
        }
        self.pause();
        Ok(())
    }

    // Project setup

    fn project_setup(&mut self) -> anyhow::Result<()> {
        loop {
            self.say("");
            self.say("Project setup:");
            self.say("1. Check project directories");
            self.say("2. Initialize configuration");
            self.say("3. Initialize telemetry store");
            self.say("4. Check components");
            self.say("5. Clean temporary files");
            self.say("0. Back");
            let Some(choice) = self.prompt("Select (0-5): ") else {
                return Ok(());
            };
            let result = match choice.as_str() {
                "1" => self.check_project_dirs(),
                "2" => self.init_config(),
                "3" => self.init_store(),
                "4" => self.check_components(),
                "5" => self.clean_temp_files(),
                "0" => return Ok(()),
                _ => {
                    self.say("Invalid choice");
                    Ok(())
                }
            };
            if let Err(e) = result {
                self.say(format!("Error: {e:#}"));
            }
            if self.end_of_input {
                return Ok(());
            }
        }
    }

    fn check_project_dirs(&mut self) -> anyhow::Result<()> {
        for name in PROJECT_DIRS {
            let dir = self.ctx.project_root.join(name);
            if dir.is_dir() {
                self.say(format!("ok      {name}/"));
            } else {
                fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
                self.say(format!("created {name}/"));
            }
        }
        Ok(())
    }

    fn init_config(&mut self) -> anyhow::Result<()> {
        match Config::write_sample(&self.ctx.config_path) {
            Ok(()) => self.say(format!(
                "Configuration initialized at {}",
                self.ctx.config_path.display()
            )),
            Err(ConfigError::AlreadyExists(path)) => {
                self.say(format!("Configuration already exists at {}", path.display()));
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn init_store(&mut self) -> anyhow::Result<()> {
        let store = self.store()?;
        let dir = store.dir().display().to_string();
        let counts = store.counts();
        self.say(format!(
            "Telemetry store ready at {dir} ({} sessions, {} events)",
            counts.sessions, counts.events
        ));
        Ok(())
    }

    fn check_components(&mut self) -> anyhow::Result<()> {
        let caps = self.ctx.capabilities;
        let engine = match &self.ctx.engines {
            Some(factory) if caps.engine => factory.create().name().to_string(),
            _ => "unavailable".to_string(),
        };
        self.say(format!("engine:    {engine}"));
        self.say(format!("telemetry: {}", availability(caps.telemetry)));
        self.say(format!("analysis:  {}", availability(caps.analysis)));
        self.say(format!("web:       {}", availability(caps.web_monitor)));
        Ok(())
    }

    fn clean_temp_files(&mut self) -> anyhow::Result<()> {
        if self.ctx.shutdown.active_session().is_some() {
            bail!("a run is active, try again after it finishes");
        }
        let roots = [
            self.ctx.config.storage.data_dir.clone(),
            self.ctx.config.analysis.output_dir.clone(),
            self.ctx.config.analysis.export_dir.clone(),
        ];
        let mut removed = 0;
        for root in roots.iter().filter(|r| r.is_dir()) {
            removed += remove_tmp_files(root)?;
        }
        self.say(format!("Cleanup complete, removed {removed} temporary files"));
        Ok(())
    }
}

/// Remove `*.tmp` files under `dir`, recursively
fn remove_tmp_files(dir: &Path) -> anyhow::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            removed += remove_tmp_files(&path)?;
        } else if path.extension().is_some_and(|ext| ext == "tmp") {
            fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
            tracing::debug!(path = %path.display(), "removed temporary file");
            removed += 1;
        }
    }
    Ok(removed)
}

fn parse_value<T: std::str::FromStr>(value: &str, label: &str) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid {label} '{value}': {e}"))
}

fn stopped_after(token: &CancelToken) -> SessionResult {
    SessionResult::stopped().with_detail("stopped_after_secs", token.elapsed().as_secs_f64())
}

fn availability(on: bool) -> &'static str {
    if on {
        "available"
    } else {
        "unavailable"
    }
}

fn fmt_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.precision$}"))
}

fn fmt_pct(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.1}%", v * 100.0))
}

fn session_row(session: &Session) -> String {
    format!(
        "{:<9} {} | {} | episodes: {} | best score: {}",
        session.status.as_str(),
        session.id,
        fmt_time(session.started_at),
        session.episode_count,
        fmt_opt(session.best_score, 3)
    )
}
