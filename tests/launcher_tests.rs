//! Launcher menus driven end to end with scripted input.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use trafficrl::config::DurabilityMode;
use trafficrl::engine::SyntheticEngineFactory;
use trafficrl::launcher::ExitReason;
use trafficrl::{
    Config, ConfigSnapshot, EngineFactory, EpisodeMetrics, EventQuery, Launcher, LauncherContext,
    Progress, RunContext, RunOutcome, ScriptedInput, SessionResult, SessionStatus,
    ShutdownHandle, TelemetryStore, TrainingEngine,
};

// ============================================================================
// Test Harness
// ============================================================================

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Harness {
    temp: TempDir,
    store: Arc<TelemetryStore>,
    shutdown: Arc<ShutdownHandle>,
    config: Config,
}

impl Harness {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = temp.path().join("data");
        config.analysis.output_dir = temp.path().join("analysis_output");
        config.analysis.export_dir = temp.path().join("exports");
        config.training.max_episodes = 5;
        config.engine.episode_delay_ms = 0;

        let store = Arc::new(
            TelemetryStore::open_at(
                config.storage.data_dir.join("telemetry"),
                DurabilityMode::Batched,
                0,
            )
            .unwrap(),
        );
        let shutdown = Arc::new(ShutdownHandle::new(Some(Arc::clone(&store))));
        Harness {
            temp,
            store,
            shutdown,
            config,
        }
    }

    fn root(&self) -> &Path {
        self.temp.path()
    }

    fn launcher_with(
        &self,
        engines: Option<Arc<dyn EngineFactory>>,
        script: &[&str],
    ) -> (Launcher, SharedBuffer) {
        let mut capabilities = self.config.capabilities(true);
        capabilities.engine = engines.is_some();
        let ctx = LauncherContext {
            config: self.config.clone(),
            config_path: self.root().join("config.toml"),
            capabilities,
            store: Some(Arc::clone(&self.store)),
            engines,
            shutdown: Arc::clone(&self.shutdown),
            project_root: self.root().to_path_buf(),
        };
        let out = SharedBuffer::default();
        let launcher = Launcher::new(
            ctx,
            Box::new(ScriptedInput::new(script.iter().copied())),
            Box::new(out.clone()),
        );
        (launcher, out)
    }

    fn launcher(&self, script: &[&str]) -> (Launcher, SharedBuffer) {
        let engines: Arc<dyn EngineFactory> =
            Arc::new(SyntheticEngineFactory::new(7, Duration::ZERO));
        self.launcher_with(Some(engines), script)
    }
}

/// Engines with scripted misbehavior
enum Behavior {
    InitFails,
    RunFails,
    /// Signal an interrupt after two episodes, then keep trying
    Interrupted(Arc<ShutdownHandle>),
    /// Signal an interrupt after two episodes, then bail out with `?`
    BailsOnCancel(Arc<ShutdownHandle>),
}

struct TestEngine(Arc<Behavior>);

impl TrainingEngine for TestEngine {
    fn name(&self) -> &str {
        "test"
    }

    fn initialize(&mut self) -> bool {
        !matches!(*self.0, Behavior::InitFails)
    }

    fn run(&mut self, ctx: &RunContext) -> anyhow::Result<RunOutcome> {
        match &*self.0 {
            Behavior::InitFails => unreachable!("run after failed initialize"),
            Behavior::RunFails => {
                ctx.record_episode(EpisodeMetrics::new(1, 0.1, 0.5, 0.5));
                anyhow::bail!("simulator connection lost")
            }
            Behavior::Interrupted(shutdown) => {
                let mut episodes = 0;
                for e in 1..=100 {
                    if e == 3 {
                        shutdown.interrupt();
                    }
                    if ctx.record_episode(EpisodeMetrics::new(e, 0.1, 0.5, 0.5)) == Progress::Stop {
                        break;
                    }
                    episodes = e;
                }
                Ok(RunOutcome {
                    episodes,
                    ..RunOutcome::default()
                })
            }
            Behavior::BailsOnCancel(shutdown) => {
                for e in 1..=2 {
                    ctx.record_episode(EpisodeMetrics::new(e, 0.1, 0.5, 0.5));
                }
                shutdown.interrupt();
                ctx.check_cancelled()?;
                anyhow::bail!("cancellation was not observed")
            }
        }
    }
}

struct TestFactory(Arc<Behavior>);

impl EngineFactory for TestFactory {
    fn create(&self) -> Box<dyn TrainingEngine> {
        Box::new(TestEngine(Arc::clone(&self.0)))
    }
}

fn factory(behavior: Behavior) -> Option<Arc<dyn EngineFactory>> {
    Some(Arc::new(TestFactory(Arc::new(behavior))))
}

// ============================================================================
// Run Tests
// ============================================================================

#[test]
fn test_training_run_records_completed_session() {
    let h = Harness::new();
    let (mut launcher, out) = h.launcher(&["1", "0"]);

    assert_eq!(launcher.run(), ExitReason::Requested);

    let sessions = h.store.get_sessions(10);
    assert_eq!(sessions.len(), 1);
    let session = &sessions[0];
    assert!(session.id.starts_with("train_"));
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.episode_count, 5);
    assert!(session.best_score.is_some());
    assert_eq!(session.config.get("max_episodes").unwrap().to_string(), "5");

    let text = out.text();
    assert!(text.contains("finished: completed"));

    let events = h.store.query(&EventQuery::new().session(&session.id));
    assert!(events
        .iter()
        .any(|e| e.message.starts_with("Started train session")));

    // Exit closes the store
    assert!(h.store.is_closed());
}

#[test]
fn test_deployment_run_uses_deploy_prefix() {
    let h = Harness::new();
    let (mut launcher, _out) = h.launcher(&["2", "", "0"]);
    launcher.run();

    let sessions = h.store.get_sessions(10);
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].id.starts_with("deploy_"));
    assert_eq!(sessions[0].status, SessionStatus::Completed);
}

#[test]
fn test_back_to_back_runs_get_distinct_ids() {
    let h = Harness::new();
    let (mut launcher, _out) = h.launcher(&["1", "1", "0"]);
    launcher.run();

    let sessions = h.store.get_sessions(10);
    assert_eq!(sessions.len(), 2);
    assert_ne!(sessions[0].id, sessions[1].id);
    assert!(sessions.iter().all(|s| s.status == SessionStatus::Completed));
}

#[test]
fn test_engine_unavailable() {
    let h = Harness::new();
    let (mut launcher, out) = h.launcher_with(None, &["1", "0"]);
    launcher.run();

    assert!(out.text().contains("traffic system is unavailable"));
    assert!(h.store.get_sessions(10).is_empty());
}

#[test]
fn test_initialize_failure_marks_session_failed() {
    let h = Harness::new();
    let (mut launcher, _out) = h.launcher_with(factory(Behavior::InitFails), &["1", "0"]);
    launcher.run();

    let session = &h.store.get_sessions(1)[0];
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.episode_count, 0);
}

#[test]
fn test_run_error_marks_session_failed_with_reason() {
    let h = Harness::new();
    let (mut launcher, out) = h.launcher_with(factory(Behavior::RunFails), &["1", "0"]);
    launcher.run();

    let session = &h.store.get_sessions(1)[0];
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.episode_count, 1);
    let reason = session.result.as_ref().unwrap().details["reason"].clone();
    assert!(reason.as_str().unwrap().contains("simulator connection lost"));
    assert!(out.text().contains("finished: failed"));
}

#[test]
fn test_interrupt_during_run_stops_session() {
    let h = Harness::new();
    let engines = factory(Behavior::Interrupted(Arc::clone(&h.shutdown)));
    let (mut launcher, _out) = h.launcher_with(engines, &["1", "0"]);
    launcher.run();

    let session = &h.store.get_sessions(1)[0];
    assert_eq!(session.status, SessionStatus::Stopped);
    assert_eq!(session.episode_count, 2);
    assert_eq!(
        session.result.as_ref().unwrap().details["reason"],
        serde_json::json!("interrupted by signal")
    );
    assert!(h.shutdown.active_session().is_none());
}

#[test]
fn test_engine_bailing_on_cancel_is_stopped_not_failed() {
    let mut h = Harness::new();
    // Interrupts reach the run only; the store is left to the launcher
    h.shutdown = Arc::new(ShutdownHandle::new(None));
    let engines = factory(Behavior::BailsOnCancel(Arc::clone(&h.shutdown)));
    let (mut launcher, out) = h.launcher_with(engines, &["1", "0"]);
    launcher.run();

    let session = &h.store.get_sessions(1)[0];
    assert_eq!(session.status, SessionStatus::Stopped);
    assert_eq!(session.episode_count, 2);
    let details = &session.result.as_ref().unwrap().details;
    assert!(details.contains_key("stopped_after_secs"));
    assert!(out.text().contains("finished: stopped"));
}

// ============================================================================
// Menu Tests
// ============================================================================

#[test]
fn test_invalid_choices_return_to_menu() {
    let h = Harness::new();
    let (mut launcher, out) = h.launcher(&["9", "abc", "0"]);
    assert_eq!(launcher.run(), ExitReason::Requested);
    assert_eq!(out.text().matches("Invalid choice").count(), 2);
}

#[test]
fn test_end_of_input_exits_and_closes_store() {
    let h = Harness::new();
    let (mut launcher, out) = h.launcher(&[]);
    assert_eq!(launcher.run(), ExitReason::EndOfInput);
    assert!(h.store.is_closed());
    assert!(out.text().contains("Shutdown complete"));
}

#[test]
fn test_analyze_session_writes_report() {
    let h = Harness::new();
    let (mut launcher, out) = h.launcher(&["1", "3", "1", "1", "2", "0", "0"]);
    launcher.run();

    let id = &h.store.get_sessions(1)[0].id;
    let dir = h.config.analysis.output_dir.join(id);
    assert!(dir.join("report.json").exists());
    assert!(dir.join("trend.csv").exists());
    let text = out.text();
    assert!(text.contains("Report written to"));
    assert!(text.contains("episodes: 5"));
}

#[test]
fn test_compare_sessions_unavailable() {
    let h = Harness::new();
    let (mut launcher, out) = h.launcher(&["3", "4", "0", "0"]);
    launcher.run();
    assert!(out.text().contains("Session comparison is not available"));
}

#[test]
fn test_database_statistics_and_export() {
    let h = Harness::new();
    let (mut launcher, out) = h.launcher(&["1", "5", "1", "3", "1", "0", "0"]);
    launcher.run();

    let id = &h.store.get_sessions(1)[0].id;
    let export = h.config.analysis.export_dir.join(format!("export_{id}.json"));
    assert!(export.exists());
    assert!(trafficrl::ExportEngine::verify(&export).is_ok());

    let text = out.text();
    assert!(text.contains("Total episodes: 5"));
    assert!(text.contains("Exported 5 episodes"));
}

#[test]
fn test_purge_with_confirmation() {
    let h = Harness::new();
    let old = Utc::now() - chrono::Duration::days(60);
    h.store
        .start_session_at("train_old", ConfigSnapshot::new(), old)
        .unwrap();
    h.store
        .end_session_at("train_old", SessionResult::completed(), old)
        .unwrap();

    let (mut launcher, out) = h.launcher(&["5", "2", "", "y", "0", "0"]);
    launcher.run();

    assert!(h.store.get_session("train_old").is_none());
    assert!(out.text().contains("Purge complete: 1 sessions"));
}

#[test]
fn test_purge_declined_keeps_data() {
    let h = Harness::new();
    let old = Utc::now() - chrono::Duration::days(60);
    h.store
        .start_session_at("train_old", ConfigSnapshot::new(), old)
        .unwrap();
    h.store
        .end_session_at("train_old", SessionResult::completed(), old)
        .unwrap();

    let (mut launcher, out) = h.launcher(&["5", "2", "30", "n", "0", "0"]);
    launcher.run();

    assert!(h.store.get_session("train_old").is_some());
    assert!(out.text().contains("Purge cancelled"));
}

#[test]
fn test_purge_rejects_mistyped_days() {
    let h = Harness::new();
    let old = Utc::now() - chrono::Duration::days(60);
    h.store
        .start_session_at("train_old", ConfigSnapshot::new(), old)
        .unwrap();
    h.store
        .end_session_at("train_old", SessionResult::completed(), old)
        .unwrap();

    // "3O" must not fall back to the default and go on to purge
    let (mut launcher, out) = h.launcher(&["5", "2", "3O", "y", "0", "0"]);
    launcher.run();

    assert!(h.store.get_session("train_old").is_some());
    let text = out.text();
    assert!(text.contains("Error: invalid number of days '3O'"));
    assert!(!text.contains("Purge complete"));
}

#[test]
fn test_view_recent_events() {
    let h = Harness::new();
    let (mut launcher, out) = h.launcher(&["1", "5", "4", "", "0", "0"]);
    launcher.run();
    assert!(out.text().contains("launcher: Started train session"));
}

#[test]
fn test_modify_and_save_config() {
    let h = Harness::new();
    let (mut launcher, out) = h.launcher(&["4", "2", "3", "12", "3", "0", "0"]);
    launcher.run();

    assert_eq!(launcher.config().training.max_episodes, 12);
    assert!(out.text().contains("Configuration updated"));

    let saved = Config::from_file(h.root().join("config.toml")).unwrap();
    assert_eq!(saved.training.max_episodes, 12);
}

#[test]
fn test_modify_config_rejects_bad_value() {
    let h = Harness::new();
    let (mut launcher, out) = h.launcher(&["4", "2", "4", "fast", "0", "0"]);
    launcher.run();

    assert!(out.text().contains("invalid learning rate 'fast'"));
    assert!((launcher.config().agent.learning_rate - 0.001).abs() < f64::EPSILON);
}

#[test]
fn test_modified_config_is_captured_by_next_run() {
    let h = Harness::new();
    let (mut launcher, _out) = h.launcher(&["4", "2", "3", "3", "0", "1", "0"]);
    launcher.run();

    let session = &h.store.get_sessions(1)[0];
    assert_eq!(session.episode_count, 3);
    assert_eq!(session.config.get_f64("max_episodes"), Some(3.0));
}

#[test]
fn test_web_monitor_and_system_info() {
    let h = Harness::new();
    let (mut launcher, out) = h.launcher(&["6", "", "7", "", "0"]);
    launcher.run();

    let text = out.text();
    assert!(text.contains("http://localhost:5000"));
    assert!(text.contains("[x] telemetry store"));
    assert!(text.contains("efficiency >= 75%"));
}

#[test]
fn test_project_setup_creates_dirs_and_cleans_tmp() {
    let h = Harness::new();
    fs::create_dir_all(&h.config.analysis.export_dir).unwrap();
    let stale = h.config.analysis.export_dir.join(".export_x.json.tmp");
    fs::write(&stale, "partial").unwrap();

    let (mut launcher, out) = h.launcher(&["8", "1", "2", "5", "0", "0"]);
    launcher.run();

    for dir in trafficrl::launcher::PROJECT_DIRS {
        assert!(h.root().join(dir).is_dir(), "missing {dir}");
    }
    assert!(h.root().join("config.toml").exists());
    assert!(!stale.exists());
    assert!(out.text().contains("removed 1 temporary files"));
}
