//! Destination for processed readings.

use std::sync::Mutex;

use futures_util::future::BoxFuture;

use crate::{
    message::LogicalId,
    processor::{Alert, DependencyError, ProcessedReading},
};

/// Records a processed reading and dispatches its alerts.
///
/// Called at most once per successful processing of a delivery, before the message
/// is deleted. Implementations should be idempotent on `id`: a crash between
/// `submit` and delete leads to the same reading being submitted again.
pub trait ResultSink: Send + Sync + 'static {
    fn submit<'a>(
        &'a self,
        id: &'a LogicalId,
        result: &'a ProcessedReading,
        alerts: &'a [Alert],
    ) -> BoxFuture<'a, Result<(), DependencyError>>;
}

/// Writes results and alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ResultSink for LogSink {
    fn submit<'a>(
        &'a self,
        id: &'a LogicalId,
        result: &'a ProcessedReading,
        alerts: &'a [Alert],
    ) -> BoxFuture<'a, Result<(), DependencyError>> {
        Box::pin(async move {
            tracing::info!(
                reading_id = %id,
                sensor_type = %result.sensor_type,
                value = result.value,
                unit = %result.unit,
                location = %result.location_name,
                status = %result.status,
                processing_time_ms = result.processing_time_ms,
                "Reading processed"
            );

            for alert in alerts {
                tracing::warn!(
                    reading_id = %id,
                    sensor_type = %alert.sensor_type,
                    kind = %alert.kind,
                    value = alert.value,
                    threshold = alert.threshold,
                    location = %result.location_name,
                    "Sensor alert"
                );
            }

            Ok(())
        })
    }
}

/// Keeps every submission in memory. Useful in tests and demos.
#[derive(Debug, Default)]
pub struct MemorySink {
    submissions: Mutex<Vec<(LogicalId, ProcessedReading)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submissions(&self) -> Vec<(LogicalId, ProcessedReading)> {
        self.submissions
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// How many times `id` was submitted.
    pub fn count(&self, id: &str) -> usize {
        self.submissions
            .lock()
            .map(|s| s.iter().filter(|(sid, _)| sid.as_str() == id).count())
            .unwrap_or_default()
    }
}

impl ResultSink for MemorySink {
    fn submit<'a>(
        &'a self,
        id: &'a LogicalId,
        result: &'a ProcessedReading,
        _alerts: &'a [Alert],
    ) -> BoxFuture<'a, Result<(), DependencyError>> {
        Box::pin(async move {
            self.submissions
                .lock()
                .map_err(|_| DependencyError::sink("submission log poisoned"))?
                .push((id.clone(), result.clone()));
            Ok(())
        })
    }
}
