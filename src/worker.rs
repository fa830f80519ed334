//! The per-worker receive, process and resolve loop.
//!
//! Every failure is handled here and never escapes the loop. A message always ends
//! in one of three places: deleted after its result reached the sink, moved to the
//! dead-letter destination, or back on the queue for a later delivery.

use std::{sync::Arc, time::Duration};

use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::PoolSettings,
    guard::{IdempotencyGuard, Release},
    health::{PoolHealth, WorkerSlot, WorkerState},
    message::{LogicalId, SensorMessage},
    processor::{DependencyError, ProcessingOutcome, ReadingProcessor},
    retry::{BrokerRetry, RetryScheduler, RetryState},
    sink::ResultSink,
    source::{BrokerError, MessageSource},
};

/// Upper bound on the pause between receive attempts while the broker is down.
const MAX_BROKER_PAUSE: Duration = Duration::from_secs(5);

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct Worker {
    id: usize,
    source: Arc<dyn MessageSource>,
    processor: ReadingProcessor,
    sink: Arc<dyn ResultSink>,
    guard: IdempotencyGuard,
    settings: PoolSettings,
    health: Arc<PoolHealth>,
    shutdown: CancellationToken,

    retry: RetryScheduler,
    broker: BrokerRetry,
    broker_pause: RetryScheduler,
}

#[bon::bon]
impl Worker {
    #[builder]
    pub fn new(
        id: usize,
        source: Arc<dyn MessageSource>,
        processor: ReadingProcessor,
        sink: Arc<dyn ResultSink>,
        guard: IdempotencyGuard,
        settings: PoolSettings,
        health: Arc<PoolHealth>,
        shutdown: CancellationToken,
    ) -> Self {
        let retry = RetryScheduler::new(settings.backoff_base, settings.backoff_cap);
        let broker = BrokerRetry::new(settings.broker_retry_attempts, settings.broker_backoff);
        let broker_pause = RetryScheduler::new(settings.broker_backoff, MAX_BROKER_PAUSE);

        Self {
            id,
            source,
            processor,
            sink,
            guard,
            settings,
            health,
            shutdown,
            retry,
            broker,
            broker_pause,
        }
    }
}

impl Worker {
    fn slot(&self) -> &WorkerSlot {
        self.health.worker(self.id)
    }

    /// Runs until the shutdown token is cancelled.
    ///
    /// Once cancelled no further `receive` is issued. A message already being
    /// processed runs to completion, and the rest of its batch is released.
    pub async fn run(self) {
        info!(worker = self.id, source = self.source.name(), "Worker started");

        while !self.shutdown.is_cancelled() {
            self.slot().set(WorkerState::Receiving);

            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                received = self.broker.call("receive", || {
                    self.source.receive(self.settings.batch_size, self.settings.wait_time)
                }) => received,
            };

            match received {
                Ok(batch) => {
                    self.health.stats().record_broker_success();
                    if !batch.is_empty() {
                        debug!(worker = self.id, count = batch.len(), "Received batch");
                        self.health.stats().record_received(batch.len());
                        self.handle_batch(batch).await;
                    }
                }
                Err(e) => {
                    let consecutive = self.broker_failure("receive", &e);
                    self.slot().set(WorkerState::Idle);

                    let pause = self.broker_pause.next_delay(consecutive);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }

            self.slot().set(WorkerState::Idle);
        }

        self.slot().set(WorkerState::Idle);
        info!(worker = self.id, "Worker stopped");
    }

    async fn handle_batch(&self, batch: Vec<SensorMessage>) {
        let mut pending = batch.into_iter();

        while let Some(message) = pending.next() {
            if self.shutdown.is_cancelled() {
                self.release_unstarted(std::iter::once(message).chain(pending))
                    .await;
                return;
            }

            self.handle(message).await;
            self.slot().set(WorkerState::Receiving);
        }
    }

    /// Hands back messages this worker received but will not process.
    async fn release_unstarted(&self, messages: impl Iterator<Item = SensorMessage>) {
        for message in messages {
            match self
                .broker
                .call("release", || self.source.release(&message, Duration::ZERO))
                .await
            {
                Ok(()) => {
                    debug!(worker = self.id, message_id = %message.message_id, "Released unstarted message");
                    self.health.stats().record_broker_success();
                    self.health.stats().record_released_on_drain();
                }
                Err(e) => {
                    // Still fine: the visibility timeout hands it back eventually.
                    warn!(worker = self.id, message_id = %message.message_id, error = %e, "Failed to release unstarted message");
                }
            }
        }
    }

    /// Processes and resolves one delivery.
    pub async fn handle(&self, message: SensorMessage) {
        let id = message.logical_id();

        if !self.guard.try_acquire(&id) {
            self.skip_duplicate(&message, &id).await;
            return;
        }

        self.slot().set(WorkerState::Processing);
        let outcome = self.process(&message, &id).await;

        self.slot().set(WorkerState::Resolving);
        debug!(
            worker = self.id,
            reading_id = %id,
            outcome = outcome.kind(),
            "Resolving message"
        );
        self.resolve(&message, &id, outcome).await;
    }

    async fn skip_duplicate(&self, message: &SensorMessage, id: &LogicalId) {
        if !self.guard.is_completed(id) {
            debug!(
                worker = self.id,
                reading_id = %id,
                message_id = %message.message_id,
                "Reading in progress elsewhere, skipping"
            );
            self.health.stats().record_duplicate_skipped();
            return;
        }

        debug!(
            worker = self.id,
            reading_id = %id,
            message_id = %message.message_id,
            "Reading already completed, deleting duplicate delivery"
        );
        self.health.stats().record_duplicate_deleted();

        match self
            .broker
            .call("delete", || self.source.delete(message))
            .await
        {
            Ok(()) => self.health.stats().record_broker_success(),
            Err(e) => {
                self.broker_failure("delete", &e);
            }
        }
    }

    /// Runs the processor while keeping its claim on the reading alive.
    ///
    /// The in-progress marker is refreshed every half guard grace period, so it
    /// never expires under this worker. Visibility is extended every
    /// `visibility_extension` unless that is zero.
    async fn process(&self, message: &SensorMessage, id: &LogicalId) -> ProcessingOutcome {
        let processing = self.processor.process(message);
        tokio::pin!(processing);

        let mut refresh = heartbeat(self.settings.guard_grace / 2);
        let extending = !self.settings.visibility_extension.is_zero();
        let mut extend = heartbeat(self.settings.visibility_extension);

        loop {
            tokio::select! {
                outcome = &mut processing => return outcome,
                _ = refresh.tick() => self.guard.refresh(id),
                _ = extend.tick(), if extending => {
                    self.guard.refresh(id);
                    self.extend_visibility(message, id).await;
                }
            }
        }
    }

    async fn extend_visibility(&self, message: &SensorMessage, id: &LogicalId) {
        let extended = self
            .broker
            .call("extend_visibility", || {
                self.source
                    .extend_visibility(message, self.settings.visibility_timeout)
            })
            .await;

        match extended {
            Ok(()) => self.health.stats().record_broker_success(),
            Err(e) if e.is_transient() => {
                self.broker_failure("extend_visibility", &e);
            }
            Err(e) => {
                // The handle is gone. Redelivery is handled by the guard.
                warn!(
                    worker = self.id,
                    reading_id = %id,
                    error = %e,
                    "Failed to extend visibility"
                );
            }
        }
    }

    async fn resolve(&self, message: &SensorMessage, id: &LogicalId, outcome: ProcessingOutcome) {
        match outcome {
            ProcessingOutcome::Success(result) => {
                if let Err(e) = self.sink.submit(id, &result, &result.alerts).await {
                    self.retry_or_dead_letter(message, id, e).await;
                    return;
                }

                match self
                    .broker
                    .call("delete", || self.source.delete(message))
                    .await
                {
                    Ok(()) => self.health.stats().record_broker_success(),
                    Err(e) => {
                        // The result is already in the sink. The redelivery will be
                        // deleted as a duplicate once the guard says completed.
                        self.broker_failure("delete", &e);
                    }
                }

                self.guard.release(id, Release::Completed);
                self.health.stats().record_processed();
                self.slot().record_processed();
            }
            ProcessingOutcome::TransientFailure(e) => {
                self.retry_or_dead_letter(message, id, e).await;
            }
            ProcessingOutcome::PermanentFailure(e) => {
                warn!(
                    worker = self.id,
                    reading_id = %id,
                    message_id = %message.message_id,
                    error = %e,
                    "Invalid reading, dead-lettering"
                );
                self.dead_letter(message, id, &format!("validation failed: {e}"))
                    .await;
            }
        }
    }

    async fn retry_or_dead_letter(
        &self,
        message: &SensorMessage,
        id: &LogicalId,
        error: DependencyError,
    ) {
        let state = RetryState::from_message(message);

        if state.exhausted(self.settings.max_retries) {
            warn!(
                worker = self.id,
                reading_id = %id,
                attempt = state.attempt,
                error = %error,
                "Retries exhausted, dead-lettering"
            );
            let reason = format!(
                "retries exhausted after {} attempts: {error}",
                state.attempt + 1
            );
            self.dead_letter(message, id, &reason).await;
            return;
        }

        let delay = self.retry.next_delay(state.attempt);
        info!(
            worker = self.id,
            reading_id = %id,
            attempt = state.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient failure, scheduling retry"
        );

        match self
            .broker
            .call("release", || self.source.release(message, delay))
            .await
        {
            Ok(()) => self.health.stats().record_broker_success(),
            Err(e) => {
                // The visibility timeout still redelivers it, just not on our schedule.
                self.broker_failure("release", &e);
            }
        }

        self.guard.release(id, Release::Retryable);
        self.health.stats().record_retried();
    }

    async fn dead_letter(&self, message: &SensorMessage, id: &LogicalId, reason: &str) {
        match self
            .broker
            .call("dead_letter", || self.source.dead_letter(message, reason))
            .await
        {
            Ok(()) => {
                self.health.stats().record_broker_success();
                self.guard.release(id, Release::Completed);
                self.health.stats().record_dead_lettered();
            }
            Err(e) => {
                self.broker_failure("dead_letter", &e);
                self.guard.release(id, Release::Retryable);
            }
        }
    }

    fn broker_failure(&self, operation: &'static str, e: &BrokerError) -> u32 {
        let consecutive = self.health.stats().record_broker_failure();
        error!(
            worker = self.id,
            operation,
            consecutive,
            error = %e,
            "Broker call failed"
        );
        consecutive
    }
}

/// Interval whose first tick is one `period` from now. Never zero.
fn heartbeat(period: Duration) -> Interval {
    let period = period.max(MIN_HEARTBEAT);
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
