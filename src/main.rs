//! # TrafficRL Launcher
//!
//! Interactive launcher for training and deployment runs.
//!
//! ## Usage
//!
//! ```bash
//! # Start with config.toml / config.local.toml from the working directory
//! cargo run --bin trafficrl
//!
//! # Specific configuration file and data directory
//! cargo run --bin trafficrl -- --config ./experiments/config.toml --data-dir /tmp/telemetry
//!
//! # Non-interactive: answers read from a file, one per line
//! cargo run --bin trafficrl -- --script menu.txt
//! ```
//!
//! ## Signals
//!
//! The menu loop runs on a blocking thread while a tokio task waits for
//! SIGINT/SIGTERM. The first signal during a run stops that run; a second
//! one (or any signal outside a run) closes the store and exits with 130.

use anyhow::Context as _;
use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use trafficrl::config::LoggingConfig;
use trafficrl::engine::factory_from_config;
use trafficrl::{
    Config, InterruptAction, Launcher, LauncherContext, LineSource, ScriptedInput,
    ShutdownHandle, TelemetryStore, TerminalInput,
};

const INTERRUPTED_EXIT_CODE: i32 = 130;
const DEFAULT_CONFIG_PATH: &str = "config.toml";

static TRACE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "trafficrl", version, about = "Traffic signal control launcher")]
struct Args {
    /// Configuration file (defaults to config.toml + config.local.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `[storage] data_dir`
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Read menu answers from this file instead of the terminal
    #[arg(long)]
    script: Option<PathBuf>,

    /// Start without a training engine
    #[arg(long)]
    no_engine: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    };
    let mut config = loaded.unwrap_or_else(|e| {
        eprintln!("Using default configuration ({e})");
        Config::default()
    });
    if let Some(dir) = args.data_dir.clone() {
        config.storage.data_dir = dir;
    }

    init_tracing(&config.logging);

    let store = open_store(&config);
    let mut capabilities = config.capabilities(store.is_some());
    let engines = if args.no_engine {
        None
    } else {
        factory_from_config(&config)
    };
    capabilities.engine &= engines.is_some();

    let shutdown = Arc::new(ShutdownHandle::new(store.clone()));
    let signals = tokio::spawn(watch_signals(Arc::clone(&shutdown)));

    let ctx = LauncherContext {
        config_path: args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
        config,
        capabilities,
        store,
        engines,
        shutdown: Arc::clone(&shutdown),
        project_root: env::current_dir().context("failed to resolve working directory")?,
    };
    let script = args.script.clone();

    // The editor is built on the blocking thread that uses it
    let reason = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let input: Box<dyn LineSource> = match script {
            Some(path) => Box::new(ScriptedInput::from_file(&path)?),
            None => Box::new(TerminalInput::new()?),
        };
        let mut launcher = Launcher::new(ctx, input, Box::new(std::io::stdout()));
        Ok(launcher.run())
    })
    .await
    .context("launcher thread panicked")??;

    signals.abort();
    shutdown.close_store();
    tracing::info!(?reason, "launcher exited");
    Ok(())
}

/// Open the telemetry store and close sessions left running by a crash.
/// `None` means telemetry is unavailable for this process.
fn open_store(config: &Config) -> Option<Arc<TelemetryStore>> {
    if !config.telemetry.enabled {
        return None;
    }
    let store = match TelemetryStore::open(&config.storage) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, kind = ?e.kind(), "telemetry store unavailable");
            eprintln!("WARNING: telemetry store unavailable: {e}");
            return None;
        }
    };
    match store.recover_interrupted() {
        Ok(ids) if !ids.is_empty() => {
            println!("Recovered {} interrupted session(s): {}", ids.len(), ids.join(", "));
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "failed to recover interrupted sessions"),
    }
    Some(store)
}

async fn watch_signals(shutdown: Arc<ShutdownHandle>) {
    #[cfg(unix)]
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                None
            }
        };

    loop {
        #[cfg(unix)]
        {
            let terminate = async {
                match sigterm.as_mut() {
                    Some(signal) => {
                        signal.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "failed to listen for ctrl-c");
                        return;
                    }
                    eprintln!("\nReceived SIGINT");
                }
                () = terminate => { eprintln!("\nReceived SIGTERM"); }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            eprintln!("\nReceived SIGINT");
        }

        match shutdown.interrupt() {
            InterruptAction::StoppedRun { session_id } => {
                eprintln!("Run {session_id} stopped, press Ctrl-C again to exit");
            }
            InterruptAction::Exit => {
                eprintln!("Telemetry store closed, exiting");
                std::process::exit(INTERRUPTED_EXIT_CODE);
            }
        }
    }
}

fn init_tracing(logging_config: &LoggingConfig) {
    // TRAFFICRL_LOG takes precedence over the configured level
    let level = env::var("TRAFFICRL_LOG").unwrap_or_else(|_| logging_config.level.clone());
    let json = logging_config.format == "json";

    let (non_blocking, guard) = match &logging_config.file {
        Some(path) => {
            let file = match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("ERROR: Unable to open log file '{}': {e}", path.display());
                    return;
                }
            };
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    let _ = TRACE_GUARD.set(guard);

    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let base = || {
        tracing_subscriber::fmt()
            .with_env_filter(filter.clone())
            .with_ansi(false)
            .with_thread_names(true)
            .with_writer(non_blocking.clone())
    };

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if json {
        Box::new(base().json().finish())
    } else {
        Box::new(base().compact().finish())
    };

    let _ = tracing::subscriber::set_global_default(subscriber);
}
