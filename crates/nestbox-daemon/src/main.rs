//! `Nestbox` Daemon
//!
//! Runs agent turns for registered chat groups inside sandboxed subprocesses
//! and exchanges messages with them through the configured transports.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use nestbox_core::config::{BackendKind, load_config, validate};
use nestbox_daemon::channel::{Channel, ChannelRouter, SpoolChannel};
use nestbox_daemon::orchestrator::{Orchestrator, ShutdownOutcome};
use nestbox_daemon::runner::{ContainerRunner, RunnerSettings, backend_from_config};
use nestbox_daemon::storage::Database;

/// Exit status after a second termination signal.
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "nestbox-daemon")]
#[command(version, about = "Nestbox daemon - sandboxed agent turns for chat groups")]
struct Args {
    /// Data directory (store, IPC namespaces, group folders, spool)
    #[arg(long, env = "NESTBOX_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Display name of the assistant; also the default trigger word
    #[arg(long, env = "NESTBOX_ASSISTANT_NAME")]
    assistant_name: Option<String>,

    /// Folder of the administrative group
    #[arg(long, env = "NESTBOX_MAIN_GROUP")]
    main_group: Option<String>,

    /// Maximum concurrent executions across all groups
    #[arg(long, env = "NESTBOX_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Sandbox backend.
    #[arg(long, env = "NESTBOX_BACKEND", value_parser = ["docker", "direct"])]
    backend: Option<String>,

    /// Agent image for the docker backend
    #[arg(long, env = "NESTBOX_IMAGE")]
    image: Option<String>,

    /// Agent command line for the direct backend, split on whitespace
    #[arg(long, env = "NESTBOX_AGENT_COMMAND")]
    agent_command: Option<String>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "NESTBOX_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "NESTBOX_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("nestbox_daemon={}", args.log_level);
    nestbox_core::tracing_init::init_tracing(&log_filter, args.log_json)?;

    let mut config = load_config(args.data_dir.as_deref())?;
    if let Some(name) = args.assistant_name {
        config.assistant.name = name;
    }
    if let Some(folder) = args.main_group {
        config.assistant.main_group_folder = folder;
    }
    if let Some(n) = args.max_concurrent {
        config.execution.max_concurrent = n;
    }
    if let Some(backend) = args.backend.as_deref() {
        config.execution.backend = backend.parse::<BackendKind>()?;
    }
    if let Some(image) = args.image {
        config.execution.image = image;
    }
    if let Some(command) = args.agent_command {
        config.execution.agent_command = command.split_whitespace().map(str::to_string).collect();
    }
    validate(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.paths.data_dir.display(),
        assistant = %config.assistant.name,
        main_group = %config.assistant.main_group_folder,
        max_concurrent = config.execution.max_concurrent,
        "Starting nestbox-daemon"
    );

    let store_path = config.paths.store_path();
    info!(path = %store_path.display(), "Opening database");
    let db = Database::open(&store_path).await?;

    let backend = Arc::from(backend_from_config(&config.execution)?);
    let runner = ContainerRunner::new(backend, RunnerSettings::from_config(&config));

    let spool = SpoolChannel::new(&config.paths.spool_dir(), config.timing.poll_interval());
    let router = ChannelRouter::new(vec![Arc::new(spool) as Arc<dyn Channel>]);

    let mut orchestrator = Orchestrator::new(config, db, router, runner).await?;

    #[cfg(unix)]
    {
        let mut states = orchestrator.subscribe_state();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow();
                if state == nestbox_daemon::orchestrator::OrchestratorState::Polling {
                    // `true` unsets $NOTIFY_SOCKET so agents cannot notify systemd.
                    if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
                        warn!(error = %e, "Failed to notify systemd");
                    }
                    break;
                }
            }
        });
    }

    let (signal_tx, signal_rx) = mpsc::channel(4);
    tokio::spawn(async move {
        if let Err(e) = forward_signals(signal_tx).await {
            warn!(error = %e, "Signal handling stopped");
        }
    });

    match orchestrator.run(signal_rx).await? {
        ShutdownOutcome::Graceful => {
            info!("Daemon stopped");
            Ok(())
        }
        ShutdownOutcome::Forced => {
            warn!("Daemon stopped without grace period");
            std::process::exit(FORCED_EXIT_CODE);
        }
    }
}

/// Forward Ctrl+C and SIGTERM into `tx` until the receiver goes away.
async fn forward_signals(tx: mpsc::Sender<()>) -> anyhow::Result<()> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        #[cfg(unix)]
        let sigterm_future = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_future = std::future::pending::<Option<()>>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C");
            }
            _ = sigterm_future => {
                info!("Received SIGTERM");
            }
        }
        if tx.send(()).await.is_err() {
            return Ok(());
        }
    }
}
