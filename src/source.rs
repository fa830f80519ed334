//! Queue abstraction consumed by the worker pool.
//!
//! A [`MessageSource`] hands out [`SensorMessage`]s and resolves them. It holds no
//! business logic. Three implementations are provided:
//!
//! - [`memory::MemorySource`]: in-process fake with fault injection, for tests
//! - [`sqlite::SqliteSource`]: durable local queue, for development
//! - [`sqs::SqsSource`]: AWS SQS (or any SQS-compatible endpoint)
//!
//! The implementation is picked once by [`connect`] from the [`Config`]; the worker
//! loop only ever sees `dyn MessageSource`.

use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use snafu::Snafu;

use crate::{
    config::{Config, QueueBackend},
    error::Error,
    message::SensorMessage,
};

pub mod memory;
pub mod sqlite;
pub mod sqs;

#[derive(Debug, Clone, Snafu)]
pub enum BrokerError {
    /// The broker could not be reached or failed the call; worth retrying.
    #[snafu(display("{operation}: broker unavailable: {message}"))]
    Unavailable {
        operation: &'static str,
        message: String,
    },

    /// The broker refused the call; retrying the same call will not help.
    #[snafu(display("{operation}: rejected by broker: {message}"))]
    Rejected {
        operation: &'static str,
        message: String,
    },
}

impl BrokerError {
    pub fn unavailable(operation: &'static str, message: impl ToString) -> Self {
        Self::Unavailable {
            operation,
            message: message.to_string(),
        }
    }

    pub fn rejected(operation: &'static str, message: impl ToString) -> Self {
        Self::Rejected {
            operation,
            message: message.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Core trait for queue operations.
///
/// All methods must be safe to call concurrently from every worker.
pub trait MessageSource: Send + Sync + 'static {
    /// Long-polls for up to `max_messages` messages.
    ///
    /// Returns as soon as at least one message is available, or with an empty batch
    /// once `wait_time` has elapsed. Every returned message is hidden from other
    /// consumers until its visibility timeout expires.
    fn receive(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> BoxFuture<'_, Result<Vec<SensorMessage>, BrokerError>>;

    /// Keeps `message` hidden for another `duration`, counted from now.
    ///
    /// If this is not called in time the broker redelivers the message, which the
    /// worker pool tolerates.
    fn extend_visibility<'a>(
        &'a self,
        message: &'a SensorMessage,
        duration: Duration,
    ) -> BoxFuture<'a, Result<(), BrokerError>>;

    /// Permanently removes `message`.
    ///
    /// Deleting a handle that is already deleted or expired logs a warning and
    /// returns `Ok`.
    fn delete<'a>(&'a self, message: &'a SensorMessage) -> BoxFuture<'a, Result<(), BrokerError>>;

    /// Moves `message` to the dead-letter destination with `reason` attached, and
    /// removes it from the live queue.
    fn dead_letter<'a>(
        &'a self,
        message: &'a SensorMessage,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<(), BrokerError>>;

    /// Hands `message` back to the queue, visible again after `delay`.
    fn release<'a>(
        &'a self,
        message: &'a SensorMessage,
        delay: Duration,
    ) -> BoxFuture<'a, Result<(), BrokerError>>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Builds the message source selected by `config.queue_backend`.
pub async fn connect(config: &Config) -> Result<Arc<dyn MessageSource>, Error> {
    tracing::info!(backend = %config.queue_backend, "Connecting message source");

    let source: Arc<dyn MessageSource> = match config.queue_backend {
        QueueBackend::Memory => Arc::new(memory::MemorySource::new(config.visibility_timeout())),
        QueueBackend::Sqlite => Arc::new(sqlite::SqliteSource::connect_with(config).await?),
        QueueBackend::Sqs => Arc::new(sqs::SqsSource::connect_with(config).await?),
    };

    Ok(source)
}
