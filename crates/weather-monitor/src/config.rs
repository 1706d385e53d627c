//! YAML configuration for the monitor host.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alert::AlertThresholds;
use crate::observation::{Location, MonitoredSet};
use crate::provider::DEFAULT_BASE_URL;
use crate::scheduler::SchedulerConfig;

/// Root configuration document.
///
/// ```yaml
/// interval_secs: 300
/// worker_count: 5
/// locations:
///   - id: tokyo
///     name: Tokyo
///     latitude: 35.68
///     longitude: 139.69
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Tick period in seconds
    pub interval_secs: u64,
    /// Maximum concurrently running tasks
    pub worker_count: usize,
    /// Admitted tasks allowed to wait for a worker within one tick
    pub queue_capacity: usize,
    /// Upper bound on one fetch→persist task, in seconds
    pub per_task_timeout_secs: u64,
    /// How long `stop()` waits for in-flight tasks, in seconds
    pub shutdown_grace_secs: u64,
    pub alerts: AlertThresholds,
    pub provider: ProviderConfig,
    pub store: StoreConfig,
    pub locations: Vec<Location>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            worker_count: 5,
            queue_capacity: 0,
            per_task_timeout_secs: 30,
            shutdown_grace_secs: 10,
            alerts: AlertThresholds::default(),
            provider: ProviderConfig::default(),
            store: StoreConfig::default(),
            locations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// `~/.weather-monitor/observations.db`, or the working directory when
/// no home directory is known.
pub fn default_store_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".weather-monitor")
        .join("observations.db")
}

impl MonitorConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validated scheduler settings.
    pub fn scheduler_config(&self) -> Result<SchedulerConfig, ConfigError> {
        let locations = MonitoredSet::new(self.locations.clone())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let config = SchedulerConfig {
            interval: Duration::from_secs(self.interval_secs),
            worker_count: self.worker_count,
            queue_capacity: self.queue_capacity,
            per_task_timeout: Duration::from_secs(self.per_task_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            locations,
        };
        config
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
