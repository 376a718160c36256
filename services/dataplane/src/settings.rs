//! Process configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use flowgate_dataplane::ServiceFile;

/// Data plane process configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Service file with tunables and services (TOML). Optional.
    pub service_file: Option<PathBuf>,

    /// Interval between connection sweeps.
    pub sweep_interval: Duration,

    /// Interval between statistics log lines. Zero disables them.
    pub stats_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let service_file = std::env::var("FLOWGATE_CONFIG").ok().map(PathBuf::from);

        let sweep_interval_ms: u64 = std::env::var("FLOWGATE_SWEEP_INTERVAL_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("FLOWGATE_SWEEP_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(1000);
        let sweep_interval = Duration::from_millis(sweep_interval_ms.max(10));

        let stats_interval_secs: u64 = std::env::var("FLOWGATE_STATS_INTERVAL_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("FLOWGATE_STATS_INTERVAL_SECS must be an integer (seconds).")?
            .unwrap_or(60);

        let log_level = std::env::var("FLOWGATE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            service_file,
            sweep_interval,
            stats_interval: Duration::from_secs(stats_interval_secs),
            log_level,
        })
    }

    /// Read the service file, or defaults when none is configured.
    pub fn load_services(&self) -> Result<ServiceFile> {
        match &self.service_file {
            Some(path) => read_service_file(path),
            None => Ok(ServiceFile::default()),
        }
    }
}

fn read_service_file(path: &Path) -> Result<ServiceFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read service file {}", path.display()))?;
    ServiceFile::from_toml(&raw)
        .with_context(|| format!("Failed to parse service file {}", path.display()))
}
