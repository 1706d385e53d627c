//! Weather provider interface.
//!
//! A provider turns a location into a current observation. Adapters make
//! exactly one attempt per call; retry cadence is the scheduler's tick.

mod openmeteo;

pub use openmeteo::{condition_for_weather_code, OpenMeteoProvider, DEFAULT_BASE_URL};

use tokio::time::Instant;

use crate::observation::{Location, Observation};

/// Errors returned by weather providers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("location not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Source of current weather observations.
///
/// Shared by up to `worker_count` concurrent tasks. Implementations must
/// give up by `deadline`; the scheduler also drops the future once the
/// deadline passes or shutdown begins.
pub trait WeatherProvider: Send + Sync + 'static {
    fn fetch(
        &self,
        location: &Location,
        deadline: Instant,
    ) -> impl std::future::Future<Output = Result<Observation>> + Send;
}
