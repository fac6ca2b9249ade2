//! Service configuration
//!
//! Loaded from a TOML file, then overridden by environment variables.

use std::{collections::HashSet, path::Path, path::PathBuf, time::Duration};

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TickHubError};

/// Deployment mode. Only some modes may mutate databases outside the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    Development,
    Testing,
    Staging,
    Production,
}

impl DeploymentMode {
    /// Backups and other maintenance may only run in these modes.
    pub fn allows_mutation(&self) -> bool {
        matches!(self, Self::Development | Self::Production)
    }
}

impl std::str::FromStr for DeploymentMode {
    type Err = TickHubError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "testing" | "test" => Ok(Self::Testing),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(TickHubError::Configuration(format!(
                "unknown deployment mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickHubConfig {
    /// Quotation provider; part of every shard database name
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Fixed symbol set, one producer process each
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Directory holding the quarter databases
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_mode")]
    pub mode: DeploymentMode,

    /// First year covered by backups
    #[serde(default = "default_start_year")]
    pub start_year: i32,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub backup: BackupConfig,
}

fn default_provider() -> String {
    "oanda".to_string()
}
fn default_symbols() -> Vec<String> {
    [
        "AUDCAD", "AUDCHF", "AUDJPY", "AUDNZD", "AUDUSD", "CADCHF", "EURAUD", "EURCAD", "EURCHF",
        "EURGBP", "EURJPY", "EURNZD", "EURUSD", "GBPAUD", "GBPCAD", "GBPCHF", "GBPJPY", "GBPNZD",
        "GBPUSD", "NZDCAD", "NZDCHF", "NZDJPY", "NZDUSD", "USDCAD", "USDCHF", "USDJPY",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_bind_addr() -> String {
    "127.0.0.1:50051".to_string()
}
fn default_mode() -> DeploymentMode {
    DeploymentMode::Development
}
fn default_start_year() -> i32 {
    2023
}

impl Default for TickHubConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            symbols: default_symbols(),
            data_dir: default_data_dir(),
            bind_addr: default_bind_addr(),
            mode: default_mode(),
            start_year: default_start_year(),
            cache: CacheConfig::default(),
            ingest: IngestConfig::default(),
            server: ServerConfig::default(),
            backup: BackupConfig::default(),
        }
    }
}

impl TickHubConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from `TICKHUB_CONFIG_PATH` (or `tickhub.toml`), then apply env overrides.
    pub fn from_env() -> Self {
        let path =
            std::env::var("TICKHUB_CONFIG_PATH").unwrap_or_else(|_| "tickhub.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default tickhub config ({}): {}", path, e);
            Self::default()
        });
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("TICKHUB_BIND_ADDR") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr;
            }
        }
        if let Ok(dir) = std::env::var("TICKHUB_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(mode) = std::env::var("TICKHUB_MODE") {
            match mode.parse() {
                Ok(mode) => self.mode = mode,
                Err(e) => tracing::warn!("Ignoring TICKHUB_MODE: {}", e),
            }
        }
    }

    /// Reject settings the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.provider.trim().is_empty() {
            return Err(TickHubError::Configuration("provider is empty".into()));
        }
        if self.symbols.is_empty() {
            return Err(TickHubError::Configuration("symbol list is empty".into()));
        }
        let mut seen = HashSet::new();
        for symbol in &self.symbols {
            if symbol.trim().is_empty() {
                return Err(TickHubError::Configuration("blank symbol".into()));
            }
            if !seen.insert(symbol.to_uppercase()) {
                return Err(TickHubError::Configuration(format!(
                    "duplicate symbol {symbol}"
                )));
            }
        }
        if self.cache.max_hours_in_cache == 0 {
            return Err(TickHubError::Configuration(
                "cache.max_hours_in_cache must be positive".into(),
            ));
        }
        if self.ingest.batch_size == 0 {
            return Err(TickHubError::Configuration(
                "ingest.batch_size must be positive".into(),
            ));
        }
        if self.ingest.flush_interval_secs == 0 {
            return Err(TickHubError::Configuration(
                "ingest.flush_interval_secs must be positive".into(),
            ));
        }
        if self.start_year > Utc::now().year() {
            return Err(TickHubError::Configuration(format!(
                "start_year {} is in the future",
                self.start_year
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Ceiling on cached hour buckets; also bounds the widest historical query
    #[serde(default = "default_max_hours_in_cache")]
    pub max_hours_in_cache: usize,
}

fn default_max_hours_in_cache() -> usize {
    72
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_hours_in_cache: default_max_hours_in_cache(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Pending quotations that trigger an immediate flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Periodic flush interval (seconds)
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Delay between polls while another `Init` holds the slot (ms)
    #[serde(default = "default_init_retry_delay_ms")]
    pub init_retry_delay_ms: u64,

    /// Polls before `Init` gives up with a timeout
    #[serde(default = "default_init_max_retries")]
    pub init_max_retries: u32,
}

fn default_batch_size() -> usize {
    1000
}
fn default_flush_interval_secs() -> u64 {
    60
}
fn default_init_retry_delay_ms() -> u64 {
    500
}
fn default_init_max_retries() -> u32 {
    10
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval_secs(),
            init_retry_delay_ms: default_init_retry_delay_ms(),
            init_max_retries: default_init_max_retries(),
        }
    }
}

impl IngestConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn init_retry_delay(&self) -> Duration {
        Duration::from_millis(self.init_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Restart attempts before the service is marked faulted
    #[serde(default = "default_server_max_retries")]
    pub max_retries: u32,

    /// Linear backoff unit (ms); attempt `n` waits `n * unit`
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,
}

fn default_server_max_retries() -> u32 {
    5
}
fn default_backoff_unit_ms() -> u64 {
    2_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_server_max_retries(),
            backoff_unit_ms: default_backoff_unit_ms(),
        }
    }
}

impl ServerConfig {
    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_drive")]
    pub drive: PathBuf,

    #[serde(default = "default_backup_folder")]
    pub folder: String,
}

fn default_backup_drive() -> PathBuf {
    PathBuf::from("backups")
}
fn default_backup_folder() -> String {
    "tickhub".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            drive: default_backup_drive(),
            folder: default_backup_folder(),
        }
    }
}
