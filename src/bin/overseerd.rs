use anyhow::{Context, Result};
use clap::Parser;
use overseer::config::ConfigFile;
use overseer::daemon::{Daemon, DaemonManager, PidFile, ShutdownSignals, DEFAULT_PID_FILE};
use overseer::ipc::{IpcServer, DEFAULT_SOCKET_PATH};
use overseer::process::{Supervisor, SupervisorSettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Overseer daemon: supervises the processes declared in a config file
#[derive(Parser, Debug)]
#[command(name = "overseerd")]
#[command(version)]
struct Args {
    /// Process declarations (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment profile applied to every launch
    #[arg(short, long)]
    env: Option<String>,

    /// IPC socket path
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[arg(long, default_value = DEFAULT_PID_FILE)]
    pid_file: PathBuf,

    /// Directory for default log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Seconds between memory samples
    #[arg(long, default_value_t = 10)]
    memory_interval_secs: u64,

    /// Only listen for commands, start nothing from the config
    #[arg(long)]
    no_autostart: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config_path = args
        .config
        .as_deref()
        .map(|path| {
            path.canonicalize()
                .with_context(|| format!("config file {} not found", path.display()))
        })
        .transpose()?;

    let config = config_path
        .as_deref()
        .map(ConfigFile::load)
        .transpose()
        .context("failed to load config")?;

    let settings = SupervisorSettings {
        log_dir: resolve_log_dir(&args, config_path.as_deref(), config.as_ref()),
        profile: args
            .env
            .clone()
            .or_else(|| config.as_ref().and_then(|c| c.profile.clone())),
        memory_interval: Duration::from_secs(args.memory_interval_secs.max(1)),
        ..SupervisorSettings::default()
    };

    let manager = DaemonManager::with_pid_file(PidFile::with_path(&args.pid_file));
    manager.register_daemon().context("cannot register daemon")?;

    let result = run(args, settings, config_path, config).await;

    if let Err(e) = manager.unregister_daemon() {
        warn!("Failed to remove PID file: {}", e);
    }
    if let Err(e) = &result {
        error!("Daemon exited with error: {:#}", e);
    }
    result
}

async fn run(
    args: Args,
    settings: SupervisorSettings,
    config_path: Option<PathBuf>,
    config: Option<ConfigFile>,
) -> Result<()> {
    let signals = ShutdownSignals::install().context("failed to install signal handlers")?;

    info!(
        "Starting overseer daemon (pid {}), logs in {}",
        std::process::id(),
        settings.log_dir.display()
    );

    let mut server = IpcServer::with_socket_path(&args.socket);
    server.start().context("failed to start IPC server")?;
    info!("Listening on {}", server.socket_path().display());

    let daemon = Arc::new(Daemon::new(Supervisor::new(settings), config_path));

    match config {
        Some(config) if !args.no_autostart => {
            for outcome in daemon.start_declared(config).await {
                match outcome.result {
                    Ok(handles) => info!("Started {} ({} instance(s))", outcome.name, handles.len()),
                    Err(e) => error!("Failed to start {}: {}", outcome.name, e),
                }
            }
        }
        _ => info!("No processes started at boot"),
    }

    let served = Arc::clone(&daemon).serve(&server, signals.recv()).await;
    server.stop().context("failed to remove IPC socket")?;
    info!("Daemon stopped");
    served.map_err(Into::into)
}

/// `--log-dir`, then the config's `log_dir` relative to the config file, then `./logs`
fn resolve_log_dir(args: &Args, config_path: Option<&Path>, config: Option<&ConfigFile>) -> PathBuf {
    if let Some(dir) = &args.log_dir {
        return dir.clone();
    }

    let base = config_path
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_default();

    match config.and_then(|c| c.log_dir.as_ref()) {
        Some(dir) => base.join(dir),
        None => base.join("logs"),
    }
}
