use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use booking_server::background_workers::{BookingExpiryChecker, WorkerManager};
use booking_server::booking_store::{BookingStore, SqliteBookingStore};
use booking_server::{config, metrics};

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = parse_path(s)?;
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory containing the bookings database (bookings.db).
    /// Can also be specified in config file.
    #[clap(long, value_parser = parse_dir)]
    pub db_dir: Option<PathBuf>,

    /// Interval in seconds between stale booking checks.
    #[clap(long, default_value_t = config::DEFAULT_BOOKING_CHECK_INTERVAL_SECS)]
    pub booking_check_interval_secs: u64,

    /// How long to wait for background workers to stop on shutdown.
    #[clap(long, default_value_t = config::DEFAULT_WORKER_SHUTDOWN_TIMEOUT_SECS)]
    pub worker_shutdown_timeout_secs: u64,

    /// Do not run the booking expiry checker.
    #[clap(long)]
    pub disable_booking_expiry: bool,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_dir: args.db_dir.clone(),
            booking_check_interval_secs: args.booking_check_interval_secs,
            worker_shutdown_timeout_secs: args.worker_shutdown_timeout_secs,
            booking_expiry_enabled: !args.disable_booking_expiry,
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    let cli_config = config::CliConfig::from(&cli_args);
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    metrics::init_metrics();

    let booking_db_path = app_config.booking_db_path();
    info!("Opening booking store at {:?}", booking_db_path);
    let booking_store: Arc<dyn BookingStore> = Arc::new(SqliteBookingStore::new(&booking_db_path)?);

    let mut worker_manager = WorkerManager::new();

    if app_config.workers.booking_expiry_enabled {
        let checker = BookingExpiryChecker::new(
            booking_store.clone(),
            app_config.workers.booking_expiry_interval,
        )?
        .with_cycle_timeout(app_config.workers.cycle_timeout)?;
        info!(
            "Booking expiry checker enabled: checking every {:?}",
            app_config.workers.booking_expiry_interval
        );
        worker_manager.register(Arc::new(checker))?;
    } else {
        info!("Booking expiry checker disabled");
    }

    worker_manager.start()?;

    if let Err(e) = wait_for_shutdown_signal().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received, stopping background workers...");

    match worker_manager
        .shutdown(app_config.workers.shutdown_timeout)
        .await
    {
        Ok(()) => info!("All background workers stopped"),
        Err(e) => warn!("Background workers did not stop cleanly ({}): {}", e.as_label(), e),
    }

    debug!("Final metrics:\n{}", metrics::gather_text());

    Ok(())
}
