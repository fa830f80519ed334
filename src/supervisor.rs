//! Owns the worker pool: starts it, reports on it, and drains it.

use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::PoolSettings,
    guard::IdempotencyGuard,
    health::{HealthReport, PoolHealth, PoolState},
    processor::ReadingProcessor,
    sink::ResultSink,
    source::MessageSource,
    worker::Worker,
};

pub struct Supervisor {
    health: Arc<PoolHealth>,
    shutdown: CancellationToken,
    drain_grace: Duration,

    workers: Vec<JoinHandle<()>>,
    /// Sweeper and health logger. Stopped with the workers, never waited on.
    background: Vec<JoinHandle<()>>,
}

#[bon::bon]
impl Supervisor {
    /// Spawns `settings.pool_size` workers and moves the pool to `Running`.
    ///
    /// Must be called from within a tokio runtime.
    #[builder(finish_fn = start)]
    pub fn new(
        source: Arc<dyn MessageSource>,
        processor: ReadingProcessor,
        sink: Arc<dyn ResultSink>,
        #[builder(default)] settings: PoolSettings,
        /// Shared with other pools to deduplicate across them.
        guard: Option<IdempotencyGuard>,
        /// Period of the health log line; none when unset.
        health_interval: Option<Duration>,
    ) -> Self {
        let pool_size = settings.pool_size.max(1);
        let health = Arc::new(PoolHealth::new(pool_size, settings.unhealthy_after));
        let guard = guard.unwrap_or_else(|| IdempotencyGuard::new(settings.guard_grace));
        let shutdown = CancellationToken::new();

        tracing::info!(
            source = source.name(),
            pool_size,
            batch_size = settings.batch_size,
            max_retries = settings.max_retries,
            "Starting worker pool"
        );

        let workers = (0..pool_size)
            .map(|id| {
                let worker = Worker::builder()
                    .id(id)
                    .source(source.clone())
                    .processor(processor.clone())
                    .sink(sink.clone())
                    .guard(guard.clone())
                    .settings(settings.clone())
                    .health(health.clone())
                    .shutdown(shutdown.clone())
                    .build();

                tokio::spawn(worker.run())
            })
            .collect();

        let mut background = vec![tokio::spawn(sweep(
            guard,
            settings.guard_grace,
            shutdown.clone(),
        ))];
        if let Some(every) = health_interval.filter(|d| !d.is_zero()) {
            background.push(tokio::spawn(log_health(
                health.clone(),
                every,
                shutdown.clone(),
            )));
        }

        health.set_state(PoolState::Running);

        Self {
            health,
            shutdown,
            drain_grace: settings.drain_grace,
            workers,
            background,
        }
    }
}

impl Supervisor {
    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    pub fn state(&self) -> PoolState {
        self.health.state()
    }

    /// Drains the pool and waits for it to stop.
    ///
    /// No `receive` is issued once this is called. Work in progress gets up to the
    /// drain grace period to finish; whatever is still running after that is
    /// aborted and its messages are left for the broker to redeliver.
    pub async fn shutdown(self) -> HealthReport {
        self.health.set_state(PoolState::Draining);
        self.shutdown.cancel();

        let aborts: Vec<_> = self.workers.iter().map(|w| w.abort_handle()).collect();
        let workers = self.workers.len();

        match tokio::time::timeout(self.drain_grace, join_all(self.workers)).await {
            Ok(results) => {
                for (worker, result) in results.into_iter().enumerate() {
                    if let Err(e) = result {
                        tracing::error!(worker, error = %e, "Worker task failed");
                    }
                }
            }
            Err(_) => {
                let abandoned = aborts.iter().filter(|a| !a.is_finished()).count();
                tracing::warn!(
                    abandoned,
                    workers,
                    grace_secs = self.drain_grace.as_secs_f64(),
                    "Drain grace period exceeded, abandoning in-flight messages"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        for task in self.background {
            task.abort();
        }

        self.health.set_state(PoolState::Stopped);
        let report = self.health.report();
        tracing::info!(
            processed = report.counters.processed,
            dead_lettered = report.counters.dead_lettered,
            retried = report.counters.retried,
            "Worker pool stopped"
        );

        report
    }
}

async fn sweep(guard: IdempotencyGuard, grace: Duration, shutdown: CancellationToken) {
    let every = (grace / 2).max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {
                let removed = guard.sweep();
                if removed > 0 {
                    tracing::debug!(removed, remaining = guard.len(), "Swept expired guard markers");
                }
            }
        }
    }
}

async fn log_health(health: Arc<PoolHealth>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {
                let report = health.report();
                let c = report.counters;

                if report.healthy {
                    tracing::info!(
                        state = %report.state,
                        uptime_secs = report.uptime_secs as u64,
                        received = c.received,
                        processed = c.processed,
                        retried = c.retried,
                        dead_lettered = c.dead_lettered,
                        error_rate = report.error_rate,
                        "Pool health"
                    );
                } else {
                    tracing::warn!(
                        state = %report.state,
                        consecutive_broker_failures = c.consecutive_broker_failures,
                        broker_errors = c.broker_errors,
                        error_rate = report.error_rate,
                        "Pool unhealthy"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::future::BoxFuture;

    use super::*;
    use crate::{
        health::WorkerState,
        processor::{Coordinates, DependencyError, LocationDirectory, LocationService},
        sink::MemorySink,
        source::memory::MemorySource,
    };

    /// Never answers within a test's lifetime.
    struct Stuck;

    impl LocationService for Stuck {
        fn locate<'a>(
            &'a self,
            _location_name: &'a str,
        ) -> BoxFuture<'a, Result<Option<Coordinates>, DependencyError>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(None)
            })
        }
    }

    fn settings() -> PoolSettings {
        PoolSettings {
            pool_size: 3,
            wait_time: Duration::from_millis(50),
            drain_grace: Duration::from_secs(2),
            broker_backoff: Duration::from_millis(1),
            ..PoolSettings::default()
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let source = Arc::new(MemorySource::new(Duration::from_secs(30)));

        let supervisor = Supervisor::builder()
            .source(source.clone())
            .processor(ReadingProcessor::new(Arc::new(LocationDirectory::default())))
            .sink(Arc::new(MemorySink::new()))
            .settings(settings())
            .start();

        assert_eq!(supervisor.state(), PoolState::Running);
        assert_eq!(supervisor.health().workers.len(), 3);
        assert!(supervisor.health().healthy);

        let report = supervisor.shutdown().await;
        assert_eq!(report.state, PoolState::Stopped);
        assert!(!report.healthy);
    }

    #[tokio::test]
    async fn test_no_receive_after_shutdown() {
        let source = Arc::new(MemorySource::new(Duration::from_secs(30)));

        let supervisor = Supervisor::builder()
            .source(source.clone())
            .processor(ReadingProcessor::new(Arc::new(LocationDirectory::default())))
            .sink(Arc::new(MemorySink::new()))
            .settings(settings())
            .start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.shutdown().await;

        let calls = source.receive_calls();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(source.receive_calls(), calls);
    }

    #[tokio::test]
    async fn test_unhealthy_while_broker_down() {
        let source = Arc::new(MemorySource::new(Duration::from_secs(30)));
        source.fail_next(1_000);

        let supervisor = Supervisor::builder()
            .source(source.clone())
            .processor(ReadingProcessor::new(Arc::new(LocationDirectory::default())))
            .sink(Arc::new(MemorySink::new()))
            .settings(PoolSettings {
                pool_size: 1,
                unhealthy_after: 2,
                ..settings()
            })
            .start();

        tokio::time::sleep(Duration::from_millis(300)).await;

        let report = supervisor.health();
        assert!(!report.healthy);
        assert!(report.counters.broker_errors >= 2);
        assert_eq!(report.state, PoolState::Running);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_abandons_work_after_drain_grace() {
        let source = Arc::new(MemorySource::new(Duration::from_secs(30)));
        source.enqueue(
            r#"{"reading_id": "stuck", "sensor_type": "temperature", "value": 20, "location_name": "Cape Town"}"#,
        );

        let sink = Arc::new(MemorySink::new());
        let supervisor = Supervisor::builder()
            .source(source.clone())
            .processor(ReadingProcessor::new(Arc::new(Stuck)))
            .sink(sink.clone())
            .settings(PoolSettings {
                pool_size: 1,
                drain_grace: Duration::from_millis(200),
                ..settings()
            })
            .start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while supervisor.health().workers[0].state != WorkerState::Processing {
            assert!(tokio::time::Instant::now() < deadline, "worker never started processing");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let started = tokio::time::Instant::now();
        let report = supervisor.shutdown().await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(report.state, PoolState::Stopped);
        assert_eq!(report.counters.processed, 0);
        // Left in flight for the broker to redeliver.
        assert_eq!(source.len(), 1);
        assert_eq!(sink.count("stuck"), 0);
    }
}
