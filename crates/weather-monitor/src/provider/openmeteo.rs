//! Open-Meteo current-conditions adapter.

use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;

use super::{ProviderError, Result, WeatherProvider};
use crate::observation::{monotonic_now, Location, Observation};

/// Open-Meteo forecast endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.open-meteo.com/v1/forecast";

/// Fields requested from the `current` block.
const CURRENT_FIELDS: &str = "temperature_2m,relative_humidity_2m,weather_code";

// ── Wire format ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current: CurrentBlock,
}

#[derive(Debug, Deserialize)]
struct CurrentBlock {
    temperature_2m: f64,
    relative_humidity_2m: f64,
    weather_code: u8,
}

// ── Client ──────────────────────────────────────────────────────────

/// Fetches current conditions from Open-Meteo by coordinates.
#[derive(Debug, Clone)]
pub struct OpenMeteoProvider {
    client: reqwest::Client,
    base_url: String,
}

impl Default for OpenMeteoProvider {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl OpenMeteoProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl WeatherProvider for OpenMeteoProvider {
    async fn fetch(&self, location: &Location, deadline: Instant) -> Result<Observation> {
        let (latitude, longitude) = location.coordinates().ok_or_else(|| {
            ProviderError::NotFound(format!("{} has no coordinates configured", location.id))
        })?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining == Duration::ZERO {
            return Err(ProviderError::Transient("deadline already passed".to_string()));
        }

        log::debug!(
            "[Provider] fetching {} ({:.4}, {:.4})",
            location.id,
            latitude,
            longitude
        );

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("latitude", latitude.to_string()),
                ("longitude", longitude.to_string()),
                ("current", CURRENT_FIELDS.to_string()),
            ])
            .timeout(remaining)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(status_error(status, body));
        }

        let body = response.text().await.map_err(map_reqwest_error)?;
        parse_current(&location.id, &body)
    }
}

/// Decode an Open-Meteo response body into a validated observation.
fn parse_current(location_id: &str, body: &str) -> Result<Observation> {
    let parsed: ForecastResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    let observation = Observation {
        location_id: location_id.to_string(),
        timestamp: monotonic_now(),
        temperature: parsed.current.temperature_2m,
        humidity: parsed.current.relative_humidity_2m,
        condition: condition_for_weather_code(parsed.current.weather_code).to_string(),
    };
    observation.validate().map_err(ProviderError::Malformed)?;
    Ok(observation)
}

fn status_error(status: StatusCode, body: String) -> ProviderError {
    let message = format!("status {}: {}", status.as_u16(), body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized(message),
        StatusCode::NOT_FOUND => ProviderError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited(message),
        s if s.is_server_error() => ProviderError::Transient(message),
        _ => ProviderError::Malformed(message),
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ProviderError {
    if err.is_decode() || err.is_body() {
        ProviderError::Malformed(err.to_string())
    } else if let Some(status) = err.status() {
        status_error(status, err.to_string())
    } else {
        ProviderError::Transient(err.to_string())
    }
}

/// Human-readable condition for a WMO weather interpretation code.
pub fn condition_for_weather_code(code: u8) -> &'static str {
    match code {
        0 => "Clear Sky",
        1 => "Mainly Clear",
        2 => "Partly Cloudy",
        3 => "Overcast",
        45 => "Fog",
        48 => "Depositing Rime Fog",
        51 => "Light Drizzle",
        53 => "Moderate Drizzle",
        55 => "Dense Drizzle",
        56 | 57 => "Freezing Drizzle",
        61 => "Slight Rain",
        63 => "Moderate Rain",
        65 => "Heavy Rain",
        66 | 67 => "Freezing Rain",
        71 => "Slight Snow",
        73 => "Moderate Snow",
        75 => "Heavy Snow",
        77 => "Snow Grains",
        80 => "Slight Rain Showers",
        81 => "Moderate Rain Showers",
        82 => "Violent Rain Showers",
        85 | 86 => "Snow Showers",
        95 => "Thunderstorm",
        96 => "Thunderstorm with slight hail",
        99 => "Thunderstorm with heavy hail",
        _ => "Unknown",
    }
}
