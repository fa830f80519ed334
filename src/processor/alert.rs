use serde::{Deserialize, Serialize};

use super::SensorType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlertKind {
    High,
    Low,
}

/// A threshold breach, returned to the caller for dispatch after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub sensor_type: SensorType,
    pub kind: AlertKind,
    pub value: f64,
    pub threshold: f64,
}

/// Alert limits per sensor type. A value at or beyond a limit raises an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub temperature_high: f64,
    pub humidity_high: f64,
    pub pressure_low: f64,
    pub air_quality_high: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            temperature_high: 30.0,
            humidity_high: 90.0,
            pressure_low: 980.0,
            air_quality_high: 150.0,
        }
    }
}

impl AlertThresholds {
    pub fn evaluate(&self, sensor_type: SensorType, value: f64) -> Option<Alert> {
        let (kind, threshold) = match sensor_type {
            SensorType::Temperature => (AlertKind::High, self.temperature_high),
            SensorType::Humidity => (AlertKind::High, self.humidity_high),
            SensorType::Pressure => (AlertKind::Low, self.pressure_low),
            SensorType::AirQuality => (AlertKind::High, self.air_quality_high),
        };

        let breached = match kind {
            AlertKind::High => value >= threshold,
            AlertKind::Low => value <= threshold,
        };

        breached.then_some(Alert {
            sensor_type,
            kind,
            value,
            threshold,
        })
    }
}
