//! Client configuration structs.
//!
//! Every operational tunable is a TOML field here. Each struct implements
//! `Default` from the constants in [`super::defaults`], so a missing or
//! partial config file still yields a fully working configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;
use crate::ledger::CongestionLevel;
use crate::reconcile::ReconcilerSettings;
use crate::submit::WriterSettings;

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one ledger client deployment.
///
/// Load with `ClientConfig::load()` which searches:
/// 1. `$OPSLEDGER_CONFIG` env var
/// 2. `./opsledger.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Ledger gateway endpoint and credentials
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Writer worker tuning
    #[serde(default)]
    pub writer: WriterConfig,

    /// Reconciliation loop tuning
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Local persistence
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            ledger: LedgerConfig::default(),
            writer: WriterConfig::default(),
            reconciler: ReconcilerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration using the standard search order:
    /// 1. `$OPSLEDGER_CONFIG` environment variable
    /// 2. `./opsledger.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var("OPSLEDGER_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded config from OPSLEDGER_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from OPSLEDGER_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "OPSLEDGER_CONFIG points to non-existent file, falling back");
            }
        }

        // 2. Check ./opsledger.toml
        let local = PathBuf::from("opsledger.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded config from ./opsledger.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./opsledger.toml, using defaults");
                }
            }
        }

        // 3. Defaults
        info!("No opsledger.toml found — using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity checks applied after parsing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.ledger.gateway_url.is_empty() {
            errors.push("ledger.gateway_url must not be empty".to_string());
        }
        if self.writer.workers == 0 {
            errors.push("writer.workers must be at least 1".to_string());
        }
        if self.writer.max_attempts == 0 {
            errors.push("writer.max_attempts must be at least 1".to_string());
        }
        if self.writer.max_in_flight == 0 {
            errors.push("writer.max_in_flight must be at least 1".to_string());
        }
        if self.reconciler.poll_interval_secs == 0 {
            errors.push("reconciler.poll_interval_secs must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server bind address.
    ///
    /// Can be overridden by the `--addr` CLI flag.
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

fn default_server_addr() -> String {
    defaults::SERVER_ADDR.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

// ============================================================================
// Ledger gateway
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Base URL of the ledger node gateway.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    /// Bearer token presented on submissions.
    #[serde(default)]
    pub auth_token: String,

    /// Submitting identity recorded with each transaction.
    #[serde(default = "default_authority")]
    pub authority: String,

    /// HTTP timeout for gateway requests (seconds).
    #[serde(default = "default_ledger_timeout")]
    pub http_timeout_secs: u64,
}

fn default_gateway_url() -> String {
    "http://localhost:9650".to_string()
}

fn default_authority() -> String {
    "ci-pipeline".to_string()
}

fn default_ledger_timeout() -> u64 {
    defaults::LEDGER_HTTP_TIMEOUT_SECS
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            auth_token: String::new(),
            authority: default_authority(),
            http_timeout_secs: default_ledger_timeout(),
        }
    }
}

// ============================================================================
// Writer
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Number of concurrent writer workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Submission attempts per record before it is abandoned.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Records dispatched to workers at once (backpressure cap).
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Bound on a single submit call (seconds).
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout_secs: u64,

    /// How long to poll for inclusion after submit (seconds).
    #[serde(default = "default_confirm_deadline")]
    pub confirm_deadline_secs: u64,

    /// Transaction status poll cadence (milliseconds).
    #[serde(default = "default_status_poll_interval")]
    pub status_poll_interval_ms: u64,

    /// First retry backoff delay (milliseconds).
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Retry backoff ceiling (milliseconds).
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,

    /// Refuse to submit while ledger congestion is at or above this level.
    #[serde(default = "default_congestion_ceiling")]
    pub congestion_ceiling: CongestionLevel,
}

fn default_workers() -> usize {
    defaults::WRITER_WORKERS
}

fn default_max_attempts() -> u32 {
    defaults::WRITER_MAX_ATTEMPTS
}

fn default_max_in_flight() -> usize {
    defaults::MAX_IN_FLIGHT
}

fn default_submit_timeout() -> u64 {
    defaults::SUBMIT_TIMEOUT_SECS
}

fn default_confirm_deadline() -> u64 {
    defaults::CONFIRM_DEADLINE_SECS
}

fn default_status_poll_interval() -> u64 {
    defaults::STATUS_POLL_INTERVAL_MS
}

fn default_backoff_base() -> u64 {
    defaults::BACKOFF_BASE_MS
}

fn default_backoff_cap() -> u64 {
    defaults::BACKOFF_CAP_MS
}

fn default_congestion_ceiling() -> CongestionLevel {
    CongestionLevel::High
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            max_in_flight: default_max_in_flight(),
            submit_timeout_secs: default_submit_timeout(),
            confirm_deadline_secs: default_confirm_deadline(),
            status_poll_interval_ms: default_status_poll_interval(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
            congestion_ceiling: default_congestion_ceiling(),
        }
    }
}

impl WriterConfig {
    pub fn settings(&self) -> WriterSettings {
        WriterSettings {
            max_attempts: self.max_attempts,
            submit_timeout: Duration::from_secs(self.submit_timeout_secs),
            confirm_deadline: Duration::from_secs(self.confirm_deadline_secs),
            status_poll_interval: Duration::from_millis(self.status_poll_interval_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            congestion_ceiling: self.congestion_ceiling,
            idle_sleep: Duration::from_millis(200),
        }
    }
}

// ============================================================================
// Reconciler
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Interval between reconciliation cycles (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Re-queries of a missing ledger position before a cycle gives up.
    #[serde(default = "default_gap_retry_limit")]
    pub gap_retry_limit: u32,

    /// Delay between gap re-queries (milliseconds).
    #[serde(default = "default_gap_retry_delay")]
    pub gap_retry_delay_ms: u64,
}

fn default_poll_interval() -> u64 {
    defaults::RECONCILE_INTERVAL_SECS
}

fn default_gap_retry_limit() -> u32 {
    defaults::GAP_RETRY_LIMIT
}

fn default_gap_retry_delay() -> u64 {
    defaults::GAP_RETRY_DELAY_MS
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            gap_retry_limit: default_gap_retry_limit(),
            gap_retry_delay_ms: default_gap_retry_delay(),
        }
    }
}

impl ReconcilerConfig {
    pub fn settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            gap_retry_limit: self.gap_retry_limit,
            gap_retry_delay: Duration::from_millis(self.gap_retry_delay_ms),
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// On-disk database directory.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(defaults::DB_PATH)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Tests
// ============================================================================
