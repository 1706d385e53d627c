//! Alert rules and alert sinks.
//!
//! The evaluator is a pure total function over observations. Sinks are
//! called from worker tasks and must return quickly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::observation::Observation;

/// Default temperature above which `ExtremeHeat` fires (strictly greater).
pub const DEFAULT_EXTREME_HEAT_CELSIUS: f64 = 35.0;

/// Default case-sensitive token that marks a storm condition.
pub const DEFAULT_STORM_TOKEN: &str = "Thunderstorm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    ExtremeHeat,
    Storm,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::ExtremeHeat => write!(f, "ExtremeHeat"),
            AlertKind::Storm => write!(f, "Storm"),
        }
    }
}

/// A derived threshold crossing. Not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvent {
    pub location_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    pub observation: Observation,
}

/// Alert thresholds, fixed once the evaluator is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub extreme_heat_celsius: f64,
    pub storm_token: String,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            extreme_heat_celsius: DEFAULT_EXTREME_HEAT_CELSIUS,
            storm_token: DEFAULT_STORM_TOKEN.to_string(),
        }
    }
}

/// Maps an observation to zero or one alert.
///
/// Rules are checked in order and the first match wins:
/// 1. temperature above the heat threshold → `ExtremeHeat`
/// 2. condition contains the storm token → `Storm`
#[derive(Debug, Clone, Default)]
pub struct AlertEvaluator {
    thresholds: AlertThresholds,
}

impl AlertEvaluator {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    pub fn evaluate(&self, observation: &Observation) -> Option<AlertEvent> {
        let kind = if observation.temperature > self.thresholds.extreme_heat_celsius {
            AlertKind::ExtremeHeat
        } else if !self.thresholds.storm_token.is_empty()
            && observation.condition.contains(&self.thresholds.storm_token)
        {
            AlertKind::Storm
        } else {
            return None;
        };

        Some(AlertEvent {
            location_id: observation.location_id.clone(),
            timestamp: observation.timestamp,
            kind,
            observation: observation.clone(),
        })
    }
}

/// Destination for alert events.
///
/// Called from worker tasks; implementations must not block. Slow
/// consumers should buffer internally (see [`ChannelAlertSink`]).
pub trait AlertSink: Send + Sync + 'static {
    fn emit(&self, alert: &AlertEvent);
}

/// Default sink: writes each alert to the log at warn level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn emit(&self, alert: &AlertEvent) {
        log::warn!(
            "[Alert] {} at {}: {:.1}°C, {:.0}% humidity, {}",
            alert.kind,
            alert.location_id,
            alert.observation.temperature,
            alert.observation.humidity,
            alert.observation.condition
        );
    }
}

/// Buffers alerts into a bounded channel for an async consumer.
///
/// When the buffer is full the alert is dropped and a warning logged.
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    tx: mpsc::Sender<AlertEvent>,
}

impl ChannelAlertSink {
    /// Create a sink and the receiver that drains it.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<AlertEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn emit(&self, alert: &AlertEvent) {
        if let Err(e) = self.tx.try_send(alert.clone()) {
            log::warn!(
                "[Alert] dropping {} alert for {}: {}",
                alert.kind,
                alert.location_id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(temperature: f64, condition: &str) -> Observation {
        Observation::now("loc", temperature, 50.0, condition)
    }

    #[test]
    fn heat_threshold_is_strict() {
        let eval = AlertEvaluator::default();
        assert!(eval.evaluate(&obs(35.0, "Sunny")).is_none());
        let alert = eval.evaluate(&obs(35.0001, "Sunny")).unwrap();
        assert_eq!(alert.kind, AlertKind::ExtremeHeat);
        assert_eq!(alert.location_id, "loc");
    }

    #[test]
    fn storm_token_is_case_sensitive_substring() {
        let eval = AlertEvaluator::default();
        let alert = eval.evaluate(&obs(20.0, "Light Thunderstorm")).unwrap();
        assert_eq!(alert.kind, AlertKind::Storm);
        assert!(eval.evaluate(&obs(20.0, "thunderstorm")).is_none());
    }

    #[test]
    fn heat_wins_over_storm() {
        let eval = AlertEvaluator::default();
        let alert = eval.evaluate(&obs(40.0, "Thunderstorm")).unwrap();
        assert_eq!(alert.kind, AlertKind::ExtremeHeat);
    }

    #[test]
    fn alert_carries_triggering_observation() {
        let eval = AlertEvaluator::default();
        let o = obs(20.0, "Thunderstorm with rain");
        let alert = eval.evaluate(&o).unwrap();
        assert_eq!(alert.observation, o);
        assert_eq!(alert.timestamp, o.timestamp);
    }

    #[test]
    fn custom_thresholds() {
        let eval = AlertEvaluator::new(AlertThresholds {
            extreme_heat_celsius: 30.0,
            storm_token: "Storm".to_string(),
        });
        assert_eq!(
            eval.evaluate(&obs(31.0, "Clear")).map(|a| a.kind),
            Some(AlertKind::ExtremeHeat)
        );
        assert_eq!(
            eval.evaluate(&obs(20.0, "Storm")).map(|a| a.kind),
            Some(AlertKind::Storm)
        );
        assert!(eval.evaluate(&obs(20.0, "Thunder")).is_none());
    }

    #[test]
    fn empty_storm_token_never_matches() {
        let eval = AlertEvaluator::new(AlertThresholds {
            storm_token: String::new(),
            ..AlertThresholds::default()
        });
        assert!(eval.evaluate(&obs(20.0, "Thunderstorm")).is_none());
    }

    #[tokio::test]
    async fn channel_sink_buffers_and_drops_when_full() {
        let (sink, mut rx) = ChannelAlertSink::new(1);
        let eval = AlertEvaluator::default();
        let alert = eval.evaluate(&obs(40.0, "Sunny")).unwrap();
        sink.emit(&alert);
        sink.emit(&alert); // dropped
        assert_eq!(rx.recv().await.unwrap().kind, AlertKind::ExtremeHeat);
        assert!(rx.try_recv().is_err());
    }
}
