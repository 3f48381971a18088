//! Daemon configuration.
//!
//! Looked up in order: explicit path, `VITALS_CONFIG`, `/etc/vitals/vitals.toml`.
//! A missing file means defaults; a file that exists but does not parse is
//! an error. Every section and field may be omitted.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vitals/vitals.toml";
pub const DEFAULT_PORT: u16 = 8765;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sampler: SamplerConfig,
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub alerts: AlertsConfig,
    pub processes: ProcessesConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Tick period; the `update_interval_ms` setting overrides it at start.
    pub interval_ms: u64,
    /// Persist one history row every N ticks.
    pub history_every_ticks: u64,
    /// Run retention cleanup every N ticks.
    pub cleanup_every_ticks: u64,
    pub gpu_timeout_ms: u64,
    /// Back-off after no GPU tool answered.
    pub gpu_retry_secs: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            history_every_ticks: 10,
            cleanup_every_ticks: 3_600,
            gpu_timeout_ms: 2_000,
            gpu_retry_secs: 60,
        }
    }
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn gpu_timeout(&self) -> Duration {
        Duration::from_millis(self.gpu_timeout_ms)
    }

    pub fn gpu_retry(&self) -> Duration {
        Duration::from_secs(self.gpu_retry_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/vitals/vitals.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub cooldown_secs: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self { cooldown_secs: 30 }
    }
}

impl AlertsConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessesConfig {
    /// Row cap for `/api/processes` when the request gives none.
    pub list_limit: usize,
    /// Gap between the prime and read passes of a listing.
    pub prime_interval_ms: u64,
}

impl Default for ProcessesConfig {
    fn default() -> Self {
        Self {
            list_limit: 50,
            prime_interval_ms: 250,
        }
    }
}

impl ProcessesConfig {
    pub fn prime_interval(&self) -> Duration {
        Duration::from_millis(self.prime_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// env_logger filter used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Resolve the path and load it, falling back to defaults when no file
    /// exists at the resolved location.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("VITALS_CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        if !path.exists() {
            log::debug!("[config] {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}
