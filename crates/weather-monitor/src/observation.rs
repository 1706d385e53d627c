//! Locations, observations and the monitored set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Instant;

use crate::error::{MonitorError, Result};

/// Valid temperature range in °C.
pub const TEMPERATURE_RANGE: (f64, f64) = (-90.0, 60.0);

/// Valid relative humidity range in %.
pub const HUMIDITY_RANGE: (f64, f64) = (0.0, 100.0);

/// A monitored place. Immutable for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Stable unique identifier, also the store key.
    pub id: String,
    /// Display name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

impl Location {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            latitude: None,
            longitude: None,
        }
    }

    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    /// Both coordinates, if configured.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }
}

/// Current UTC time on a clock that never goes backwards.
///
/// The wall clock is read once, on first use; later readings add the
/// monotonic time elapsed since then, so wall-clock steps during the
/// process lifetime do not reorder observations.
pub fn monotonic_now() -> DateTime<Utc> {
    static ANCHOR: OnceLock<(Instant, DateTime<Utc>)> = OnceLock::new();
    let (started, wall) = *ANCHOR.get_or_init(|| (Instant::now(), Utc::now()));
    chrono::Duration::from_std(started.elapsed())
        .ok()
        .and_then(|elapsed| wall.checked_add_signed(elapsed))
        .unwrap_or(wall)
}

/// One snapshot of weather for one location at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub location_id: String,
    pub timestamp: DateTime<Utc>,
    /// °C
    pub temperature: f64,
    /// %
    pub humidity: f64,
    /// Short free-form condition text from the provider.
    pub condition: String,
}

impl Observation {
    /// Build an observation stamped with [`monotonic_now`].
    pub fn now(
        location_id: impl Into<String>,
        temperature: f64,
        humidity: f64,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            location_id: location_id.into(),
            timestamp: monotonic_now(),
            temperature,
            humidity,
            condition: condition.into(),
        }
    }

    /// Check temperature and humidity against their physical ranges.
    ///
    /// Returns a description of the first violation.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let (t_min, t_max) = TEMPERATURE_RANGE;
        if !(t_min..=t_max).contains(&self.temperature) {
            return Err(format!(
                "temperature {} outside [{}, {}]",
                self.temperature, t_min, t_max
            ));
        }
        let (h_min, h_max) = HUMIDITY_RANGE;
        if !(h_min..=h_max).contains(&self.humidity) {
            return Err(format!(
                "humidity {} outside [{}, {}]",
                self.humidity, h_min, h_max
            ));
        }
        Ok(())
    }
}

/// The fixed set of locations polled on every tick.
///
/// Non-empty, ids unique, iterated in insertion order.
#[derive(Debug, Clone)]
pub struct MonitoredSet {
    locations: Vec<Location>,
}

impl MonitoredSet {
    pub fn new(locations: Vec<Location>) -> Result<Self> {
        if locations.is_empty() {
            return Err(MonitorError::Config(
                "monitored set must contain at least one location".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for location in &locations {
            if location.id.trim().is_empty() {
                return Err(MonitorError::Config(
                    "location id must not be empty".to_string(),
                ));
            }
            if !seen.insert(location.id.as_str()) {
                return Err(MonitorError::Config(format!(
                    "duplicate location id '{}'",
                    location.id
                )));
            }
        }
        Ok(Self { locations })
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Location> {
        self.locations.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Location> {
        self.locations.iter()
    }
}
