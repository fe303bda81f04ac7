//! GatherScatter configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agents::ServiceConfig;
use crate::barrier::BarrierConfig;
use crate::messages::DEFAULT_EXCHANGE;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where agents find the broker
    pub broker: BrokerConfig,

    /// Poll interval and timeouts
    pub timing: TimingConfig,

    /// Barrier settings used by the gatherer
    pub gatherer: BarrierConfig,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Explicit path, then `.gatherscatter.yml`, then
    /// `~/.config/gatherscatter/gatherscatter.yml`, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".gatherscatter.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("gatherscatter").join("gatherscatter.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read just the log level, before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|config| config.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Settings for an agent service
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            exchange: self.broker.exchange.clone(),
            poll_interval: self.timing.poll_interval(),
            submit_timeout: self.timing.submit_timeout(),
        }
    }
}

/// Default broker socket location
pub fn get_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("gatherscatter")
        .join("broker.sock")
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Unix socket of the broker (default: runtime dir)
    #[serde(rename = "socket-path")]
    pub socket_path: Option<PathBuf>,

    /// Topic exchange every agent binds to
    pub exchange: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            exchange: DEFAULT_EXCHANGE.to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(get_socket_path)
    }
}

/// Poll interval and timeouts, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Upper bound on each inbound poll of the owning thread
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// How long a publish waits for the owning thread
    #[serde(rename = "submit-timeout-ms")]
    pub submit_timeout_ms: u64,

    /// How long agents wait for `go`
    #[serde(rename = "go-timeout-ms")]
    pub go_timeout_ms: u64,

    /// How long monitors wait for `stop`
    #[serde(rename = "completion-timeout-ms")]
    pub completion_timeout_ms: u64,

    /// How long stopping an agent may take
    #[serde(rename = "stop-timeout-ms")]
    pub stop_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        debug!("TimingConfig::default: called");
        Self {
            poll_interval_ms: 10,
            submit_timeout_ms: 3_000,
            go_timeout_ms: 30_000,
            completion_timeout_ms: 60_000,
            stop_timeout_ms: 30_000,
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn go_timeout(&self) -> Duration {
        Duration::from_millis(self.go_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}
