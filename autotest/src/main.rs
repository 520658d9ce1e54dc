mod config;
mod event;
mod logging;
mod scheduler;
mod scope;
mod status;
mod supervisor;
mod tracker;
mod watcher;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::event::SchedulerEvent;
use crate::logging::Verbosity;
use crate::scheduler::{RunScheduler, WatchSession};
use crate::supervisor::{CommandLauncher, ProcessSupervisor};

#[derive(Parser, Debug)]
#[command(
    name = "autotest",
    version,
    about = "Re-runs the test runner whenever files under the watched directory change",
    long_about = "Watches a directory tree and re-runs the test runner scoped to what changed. \
                  Arguments after `--` are passed to every run; a changed path is added to their \
                  -t/--tests selection. When a failing suite starts passing, the original \
                  arguments are run once more."
)]
struct Cli {
    /// Directory to watch; the runner is started here too
    #[arg(long, value_name = "DIR", default_value = ".")]
    root: PathBuf,

    /// Config file (default: <root>/autotest.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Test runner executable
    #[arg(long, value_name = "PROGRAM")]
    runner: Option<String>,

    /// Quiet period after a change before the run starts
    #[arg(long, value_name = "MS")]
    debounce_ms: Option<u64>,

    /// Terminate a run that has not exited this long after its first output
    #[arg(long, value_name = "MS")]
    stall_timeout_ms: Option<u64>,

    /// Write a TOML status snapshot here after every state change
    #[arg(long, value_name = "PATH")]
    status_file: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Errors only
    #[arg(short, long)]
    quiet: bool,

    /// Arguments passed to every run (replace `runner.args` from the config)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "RUNNER_ARGS")]
    runner_args: Vec<String>,
}

/// Effective settings after layering CLI flags over the config file.
#[derive(Debug, PartialEq)]
struct Settings {
    program: String,
    base_args: Vec<String>,
    debounce: Duration,
    stall_timeout: Duration,
    exclude: Vec<String>,
    status_file: Option<PathBuf>,
}

impl Settings {
    fn resolve(cli: &Cli, config: Config, root: &Path) -> Self {
        let base_args = if cli.runner_args.is_empty() {
            config.runner.args
        } else {
            cli.runner_args.clone()
        };
        let status_file = cli
            .status_file
            .clone()
            .or(config.status_file)
            .map(|p| if p.is_absolute() { p } else { root.join(p) });

        Self {
            program: cli.runner.clone().unwrap_or(config.runner.program),
            base_args,
            debounce: cli
                .debounce_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.timing.debounce()),
            stall_timeout: cli
                .stall_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.timing.stall_timeout()),
            exclude: config.watch.exclude,
            status_file,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(Verbosity::from_flags(cli.verbose, cli.quiet));

    // ── Configuration ─────────────────────────────────────────────────────────
    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("Cannot watch {}", cli.root.display()))?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config::config_file_path(&root));
    let config = config::load_or_default(&config_path)?;
    let settings = Settings::resolve(&cli, config, &root);
    debug!(?settings, config = %config_path.display(), "settings resolved");

    let (event_tx, event_rx) = mpsc::channel::<SchedulerEvent>(256);

    // ── Watcher ───────────────────────────────────────────────────────────────
    // The status file may live under the root; its writes are ours, not changes.
    let filter = watcher::WatchFilter {
        exclude: settings.exclude.clone(),
        own_files: settings.status_file.iter().cloned().collect(),
    };
    // Kept alive for the whole loop; dropping it stops notifications.
    let _watcher = watcher::watch(&root, filter, event_tx.clone())?;

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(SchedulerEvent::Shutdown).await;
            }
        });
    }

    // ── Scheduler ─────────────────────────────────────────────────────────────
    let supervisor = ProcessSupervisor::new(
        CommandLauncher::new(&root),
        settings.program,
        settings.stall_timeout,
        event_tx,
    );
    let scheduler = RunScheduler::new(
        WatchSession::new(root, settings.base_args),
        supervisor,
        settings.debounce,
    )
    .with_status_file(settings.status_file);

    scheduler.run(event_rx).await;
    Ok(())
}
