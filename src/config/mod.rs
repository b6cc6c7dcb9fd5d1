mod file_config;

pub use file_config::{FileConfig, WorkersConfig};

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BOOKING_CHECK_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_WORKER_SHUTDOWN_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_CYCLE_TIMEOUT_SECS: u64 = 30;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub booking_check_interval_secs: u64,
    pub worker_shutdown_timeout_secs: u64,
    pub booking_expiry_enabled: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_dir: None,
            booking_check_interval_secs: DEFAULT_BOOKING_CHECK_INTERVAL_SECS,
            worker_shutdown_timeout_secs: DEFAULT_WORKER_SHUTDOWN_TIMEOUT_SECS,
            booking_expiry_enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub workers: WorkersSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkersSettings {
    pub booking_expiry_enabled: bool,
    pub booking_expiry_interval: Duration,
    pub shutdown_timeout: Duration,
    pub cycle_timeout: Duration,
}

impl Default for WorkersSettings {
    fn default() -> Self {
        Self {
            booking_expiry_enabled: true,
            booking_expiry_interval: Duration::from_secs(DEFAULT_BOOKING_CHECK_INTERVAL_SECS),
            shutdown_timeout: Duration::from_secs(DEFAULT_WORKER_SHUTDOWN_TIMEOUT_SECS),
            cycle_timeout: Duration::from_secs(DEFAULT_CYCLE_TIMEOUT_SECS),
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let workers_file = file.workers.unwrap_or_default();

        let interval_secs = workers_file
            .booking_expiry_interval_secs
            .unwrap_or(cli.booking_check_interval_secs);
        if interval_secs == 0 {
            bail!("Booking expiry interval must be greater than zero");
        }

        let shutdown_timeout_secs = workers_file
            .shutdown_timeout_secs
            .unwrap_or(cli.worker_shutdown_timeout_secs);
        if shutdown_timeout_secs == 0 {
            bail!("Worker shutdown timeout must be greater than zero");
        }

        let cycle_timeout_secs = workers_file
            .cycle_timeout_secs
            .unwrap_or(DEFAULT_CYCLE_TIMEOUT_SECS);
        if cycle_timeout_secs == 0 {
            bail!("Worker cycle timeout must be greater than zero");
        }

        let workers = WorkersSettings {
            booking_expiry_enabled: workers_file
                .booking_expiry_enabled
                .unwrap_or(cli.booking_expiry_enabled),
            booking_expiry_interval: Duration::from_secs(interval_secs),
            shutdown_timeout: Duration::from_secs(shutdown_timeout_secs),
            cycle_timeout: Duration::from_secs(cycle_timeout_secs),
        };

        Ok(Self { db_dir, workers })
    }

    pub fn booking_db_path(&self) -> PathBuf {
        self.db_dir.join("bookings.db")
    }
}
