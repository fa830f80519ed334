//! Business logic for a single sensor reading.
//!
//! [`ReadingProcessor::process`] validates the payload, enriches it with location
//! metadata, and evaluates alert thresholds. It never touches the queue and keeps
//! no state between calls; every collaborator is injected.

use std::{ops::RangeInclusive, sync::Arc, time::Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::message::{LogicalId, SensorMessage};

pub mod alert;
pub mod location;

pub use alert::{Alert, AlertKind, AlertThresholds};
pub use location::{Coordinates, LocationDirectory, LocationService};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SensorType {
    Temperature,
    Humidity,
    Pressure,
    AirQuality,
}

impl SensorType {
    pub fn unit(&self) -> &'static str {
        match self {
            Self::Temperature => "°C",
            Self::Humidity => "%",
            Self::Pressure => "hPa",
            Self::AirQuality => "AQI",
        }
    }

    /// Physically plausible values; anything outside is rejected as malformed.
    pub fn valid_range(&self) -> RangeInclusive<f64> {
        match self {
            Self::Temperature => -50.0..=100.0,
            Self::Humidity => 0.0..=100.0,
            Self::Pressure => 300.0..=1100.0,
            Self::AirQuality => 0.0..=500.0,
        }
    }
}

/// Payload problems. Never retried.
#[derive(Debug, Snafu)]
pub enum ValidationError {
    #[snafu(display("payload is not valid JSON: {source}"))]
    Malformed { source: serde_json::Error },

    #[snafu(display("payload is not a JSON object"))]
    NotAnObject,

    #[snafu(display("missing required field `{field}`"))]
    MissingField { field: &'static str },

    #[snafu(display("`{field}` must be a string"))]
    NotAString { field: &'static str },

    #[snafu(display("`value` is not numeric: {found}"))]
    NonNumericValue { found: String },

    #[snafu(display("unknown sensor_type `{found}`"))]
    UnknownSensorType { found: String },

    #[snafu(display("invalid timestamp `{found}`"))]
    InvalidTimestamp { found: String },

    #[snafu(display("{sensor_type} value {value} outside {min}..={max}"))]
    OutOfRange {
        sensor_type: SensorType,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// A downstream collaborator could not answer. Retried with backoff.
#[derive(Debug, Clone, Snafu)]
pub enum DependencyError {
    #[snafu(display("location lookup for `{location}` failed: {message}"))]
    LocationLookup { location: String, message: String },

    #[snafu(display("result sink unavailable: {message}"))]
    Sink { message: String },
}

impl DependencyError {
    pub fn sink(message: impl ToString) -> Self {
        Self::Sink {
            message: message.to_string(),
        }
    }
}

/// A structurally valid reading.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub reading_id: LogicalId,
    pub sensor_type: SensorType,
    pub value: f64,
    pub location_name: String,
    pub recorded_at: DateTime<Utc>,
}

impl SensorReading {
    /// Validates the message body.
    ///
    /// `reading_id` and `timestamp` are optional: the id falls back to the broker
    /// message id and the timestamp to the enqueue time.
    pub fn parse(message: &SensorMessage) -> Result<Self, ValidationError> {
        let payload: serde_json::Value = serde_json::from_str(&message.body)
            .map_err(|source| ValidationError::Malformed { source })?;
        let fields = payload.as_object().ok_or(ValidationError::NotAnObject)?;

        let sensor_type = string(fields, "sensor_type")?;
        let sensor_type = sensor_type
            .parse::<SensorType>()
            .map_err(|_| ValidationError::UnknownSensorType {
                found: sensor_type.to_owned(),
            })?;

        let value = required(fields, "value")?;
        let value = value
            .as_f64()
            .ok_or_else(|| ValidationError::NonNumericValue {
                found: value.to_string(),
            })?;

        let range = sensor_type.valid_range();
        if !range.contains(&value) {
            return Err(ValidationError::OutOfRange {
                sensor_type,
                value,
                min: *range.start(),
                max: *range.end(),
            });
        }

        let location_name = string(fields, "location_name")?.trim();
        if location_name.is_empty() {
            return Err(ValidationError::MissingField {
                field: "location_name",
            });
        }

        let recorded_at = match fields.get("timestamp").filter(|v| !v.is_null()) {
            Some(serde_json::Value::String(ts)) => parse_timestamp(ts)?,
            Some(other) => {
                return Err(ValidationError::InvalidTimestamp {
                    found: other.to_string(),
                })
            }
            None => message.enqueued_at,
        };

        Ok(Self {
            reading_id: message.logical_id(),
            sensor_type,
            value,
            location_name: location_name.to_owned(),
            recorded_at,
        })
    }
}

fn required<'a>(
    fields: &'a serde_json::Map<String, serde_json::Value>,
    field: &'static str,
) -> Result<&'a serde_json::Value, ValidationError> {
    fields
        .get(field)
        .filter(|v| !v.is_null())
        .ok_or(ValidationError::MissingField { field })
}

fn string<'a>(
    fields: &'a serde_json::Map<String, serde_json::Value>,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    required(fields, field)?
        .as_str()
        .ok_or(ValidationError::NotAString { field })
}

/// RFC 3339, or naive ISO 8601 taken as UTC.
fn parse_timestamp(ts: &str) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(ts) {
        return Ok(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| ValidationError::InvalidTimestamp {
            found: ts.to_owned(),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReadingStatus {
    Normal,
    Alert,
}

/// Enriched result handed to the [`ResultSink`](crate::sink::ResultSink).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedReading {
    pub reading_id: LogicalId,
    pub sensor_type: SensorType,
    pub value: f64,
    pub unit: String,
    pub fahrenheit: Option<f64>,
    pub location_name: String,
    pub coordinates: Option<Coordinates>,
    pub status: ReadingStatus,
    pub alerts: Vec<Alert>,
    pub recorded_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub processing_time_ms: f64,
}

#[derive(Debug)]
pub enum ProcessingOutcome {
    Success(ProcessedReading),
    TransientFailure(DependencyError),
    PermanentFailure(ValidationError),
}

impl ProcessingOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::TransientFailure(_) => "transient_failure",
            Self::PermanentFailure(_) => "permanent_failure",
        }
    }
}

#[derive(Clone)]
pub struct ReadingProcessor {
    locations: Arc<dyn LocationService>,
    thresholds: AlertThresholds,
}

impl ReadingProcessor {
    pub fn new(locations: Arc<dyn LocationService>) -> Self {
        Self {
            locations,
            thresholds: AlertThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: AlertThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub async fn process(&self, message: &SensorMessage) -> ProcessingOutcome {
        let started = Instant::now();

        let reading = match SensorReading::parse(message) {
            Ok(reading) => reading,
            Err(e) => return ProcessingOutcome::PermanentFailure(e),
        };

        let coordinates = match self.locations.locate(&reading.location_name).await {
            Ok(coordinates) => coordinates,
            Err(e) => return ProcessingOutcome::TransientFailure(e),
        };

        if coordinates.is_none() {
            tracing::debug!(location = %reading.location_name, "Unknown location, skipping geo enrichment");
        }

        let alerts: Vec<Alert> = self
            .thresholds
            .evaluate(reading.sensor_type, reading.value)
            .into_iter()
            .collect();

        let status = if alerts.is_empty() {
            ReadingStatus::Normal
        } else {
            ReadingStatus::Alert
        };

        let fahrenheit = (reading.sensor_type == SensorType::Temperature)
            .then(|| reading.value * 9.0 / 5.0 + 32.0);

        ProcessingOutcome::Success(ProcessedReading {
            reading_id: reading.reading_id,
            sensor_type: reading.sensor_type,
            value: reading.value,
            unit: reading.sensor_type.unit().to_owned(),
            fahrenheit,
            location_name: reading.location_name,
            coordinates,
            status,
            alerts,
            recorded_at: reading.recorded_at,
            processed_at: Utc::now(),
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }
}
