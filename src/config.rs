//! TOML configuration for the scanwarden daemon.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working configuration. The config file path may be
//! overridden with the `SCANWARDEN_CONFIG` environment variable.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "SCANWARDEN_CONFIG";

/// Standard system location for the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/scanwarden/scanwarden.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the scanwarden process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub scanning: ScanningConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `SCANWARDEN_CONFIG` environment variable.
    /// 2. `/etc/scanwarden/scanwarden.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SCANWARDEN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// SQLite database location and pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file (created if missing).
    pub path: String,
    /// Maximum number of pooled connections.
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/scanwarden.db".to_string(),
            pool_size: 8,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Cron driver, worker pool and job-body tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the cron driver checks for due triggers, in milliseconds.
    pub tick_interval_ms: u64,
    /// Number of workers executing due triggers.
    pub workers: usize,
    /// Capacity of the execution queue. Firings beyond it are dropped.
    pub queue_capacity: usize,
    /// Hosts per batch in a scan job.
    pub scan_batch_size: usize,
    /// Hosts scanned concurrently within one batch.
    pub host_concurrency: usize,
    /// Concurrency handed to discovery when a job does not set one.
    pub default_discovery_concurrency: usize,
    /// Run-history rows kept per job; older rows are pruned. 0 keeps all.
    pub history_retention: usize,
    /// Most firings listed per job by a dry-run preview.
    pub preview_limit_per_job: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            workers: 4,
            queue_capacity: 64,
            scan_batch_size: 10,
            host_concurrency: 10,
            default_discovery_concurrency: 32,
            history_retention: 500,
            preview_limit_per_job: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

/// Settings for the built-in TCP connect scanner and sweep discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanningConfig {
    /// Per-connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Ports probed concurrently on a single host.
    pub port_concurrency: usize,
    /// Ports used to decide whether a host is alive during discovery.
    pub discovery_ports: Vec<u16>,
}

impl Default for ScanningConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1000,
            port_concurrency: 64,
            discovery_ports: vec![22, 80, 443, 445, 3389],
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
