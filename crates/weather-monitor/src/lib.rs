//! Periodic weather ingestion for a fixed set of locations.
//!
//! A [`MonitorScheduler`] ticks on a fixed cadence and, for every monitored
//! location, runs one fetch → evaluate → alert → persist task on a bounded
//! worker pool:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use weather_monitor::prelude::*;
//!
//! let config = MonitorConfig::from_file("config.yaml")?;
//! let store = SqliteStore::open(&config.store.path)?;
//! let scheduler = MonitorScheduler::new(
//!     config.scheduler_config()?,
//!     Arc::new(OpenMeteoProvider::new(&config.provider.base_url)),
//!     Arc::new(store),
//!     Arc::new(LogAlertSink),
//! )?;
//! scheduler.start()?;
//! // ...
//! scheduler.stop().await?;
//! ```

pub mod alert;
pub mod config;
pub mod error;
pub mod observation;
pub mod provider;
pub mod scheduler;
pub mod store;

pub use alert::{
    AlertEvaluator, AlertEvent, AlertKind, AlertSink, AlertThresholds, ChannelAlertSink,
    LogAlertSink,
};
pub use config::{ConfigError, MonitorConfig};
pub use error::{MonitorError, Result};
pub use observation::{Location, MonitoredSet, Observation};
pub use provider::{OpenMeteoProvider, ProviderError, WeatherProvider};
pub use scheduler::{
    MonitorScheduler, SchedulerConfig, SchedulerFailed, SchedulerState, StatsSnapshot,
};
pub use store::{ObservationStore, SqliteStore, StoreError};

/// Commonly used types for hosts embedding the monitor.
pub mod prelude {
    pub use crate::alert::{AlertEvaluator, AlertSink, LogAlertSink};
    pub use crate::config::MonitorConfig;
    pub use crate::observation::{Location, MonitoredSet, Observation};
    pub use crate::provider::{OpenMeteoProvider, WeatherProvider};
    pub use crate::scheduler::{MonitorScheduler, SchedulerConfig};
    pub use crate::store::{ObservationStore, SqliteStore};
}

/// Initialize logging with env_logger.
///
/// Respects RUST_LOG environment variable. Defaults to "info" level.
pub fn setup_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
