//! Sensor reading messages as handed out by a [`MessageSource`](crate::source::MessageSource).
//!
//! A [`SensorMessage`] is one *delivery* of a reading. The broker assigns a fresh
//! [`ReceiptHandle`] on every delivery, so the handle is only good for resolving
//! that delivery (delete, extend, release, dead-letter). The [`LogicalId`] is the
//! reading's own identifier and stays stable across redeliveries; it is the key
//! the [`IdempotencyGuard`](crate::guard::IdempotencyGuard) deduplicates on.
//!
//! # Wire format
//!
//! Producers enqueue a JSON object:
//!
//! ```json
//! {"reading_id": "r-1", "sensor_type": "temperature", "value": 25.5,
//!  "location_name": "Cape Town", "timestamp": "2024-05-01T10:00:00Z"}
//! ```
//!
//! Structural validation of the body belongs to the
//! [`ReadingProcessor`](crate::processor::ReadingProcessor); this module only
//! peeks at `reading_id` so the guard can be consulted before processing.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message attribute carrying an attempt count forward across re-sends.
pub const ATTEMPT_ATTRIBUTE: &str = "attempt";

/// Message attribute set on dead-lettered messages.
pub const DEAD_LETTER_REASON_ATTRIBUTE: &str = "dead_letter_reason";

/// Opaque, per-delivery handle used to resolve a received message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identifier of a sensor reading, shared by every delivery of it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalId(String);

impl LogicalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One delivery of a sensor reading.
#[derive(Clone, Debug)]
pub struct SensorMessage {
    /// Broker-assigned id of the enqueued message (stable across redeliveries).
    pub message_id: String,
    pub receipt: ReceiptHandle,
    /// Raw JSON payload.
    pub body: String,
    pub attributes: HashMap<String, String>,
    /// How many times the broker has handed this message out, this delivery included.
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct Envelope {
    reading_id: Option<serde_json::Value>,
}

impl SensorMessage {
    /// Identifier used for deduplication.
    ///
    /// Uses the payload's `reading_id` when present (string or integer), falling
    /// back to the broker message id, which is also stable across redeliveries.
    pub fn logical_id(&self) -> LogicalId {
        let reading_id = serde_json::from_str::<Envelope>(&self.body)
            .ok()
            .and_then(|envelope| envelope.reading_id)
            .and_then(|id| match id {
                serde_json::Value::String(s) if !s.is_empty() => Some(s),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            });

        match reading_id {
            Some(id) => LogicalId(id),
            None => LogicalId(self.message_id.clone()),
        }
    }

    /// Attempt count carried in the message attributes, if any.
    pub fn attempt_attribute(&self) -> Option<u32> {
        self.attributes
            .get(ATTEMPT_ATTRIBUTE)
            .and_then(|v| v.trim().parse().ok())
    }
}
