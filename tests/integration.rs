use std::{collections::HashMap, ops::Deref, sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use sensorq::{
    config::PoolSettings,
    guard::IdempotencyGuard,
    health::PoolState,
    message::LogicalId,
    processor::{
        Coordinates, DependencyError, LocationDirectory, LocationService, ReadingProcessor,
    },
    sink::MemorySink,
    source::{memory::MemorySource, sqlite::SqliteSource, MessageSource},
    supervisor::Supervisor,
};
use tempfile::TempDir;

struct TmpSource {
    source: Arc<SqliteSource>,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpSource {
    type Target = Arc<SqliteSource>;

    fn deref(&self) -> &Self::Target {
        &self.source
    }
}

async fn setup(visibility_timeout: Duration) -> TmpSource {
    let path = tempfile::tempdir().unwrap();

    TmpSource {
        source: Arc::new(
            SqliteSource::open(path.path().join("sensorq.db"), visibility_timeout)
                .await
                .unwrap(),
        ),
        tmpdir: path,
    }
}

fn settings() -> PoolSettings {
    PoolSettings {
        pool_size: 4,
        wait_time: Duration::from_millis(50),
        backoff_base: Duration::from_millis(20),
        backoff_cap: Duration::from_millis(100),
        drain_grace: Duration::from_secs(5),
        broker_backoff: Duration::from_millis(1),
        ..PoolSettings::default()
    }
}

fn start(source: Arc<dyn MessageSource>, sink: Arc<MemorySink>, settings: PoolSettings) -> Supervisor {
    Supervisor::builder()
        .source(source)
        .processor(ReadingProcessor::new(Arc::new(LocationDirectory::default())))
        .sink(sink)
        .settings(settings)
        .start()
}

/// Location service that is down for good.
struct Down;

impl LocationService for Down {
    fn locate<'a>(
        &'a self,
        location_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<Coordinates>, DependencyError>> {
        Box::pin(async move {
            Err(DependencyError::LocationLookup {
                location: location_name.to_owned(),
                message: "service unavailable".to_owned(),
            })
        })
    }
}

/// Polls `done` until it holds or five seconds pass.
async fn eventually(mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_valid_reading_is_submitted_once_and_deleted() {
    let source = Arc::new(MemorySource::new(Duration::from_secs(30)));
    let sink = Arc::new(MemorySink::new());
    source.enqueue(
        r#"{"reading_id": "r-1", "sensor_type": "temperature", "value": 25.5, "location_name": "Cape Town"}"#,
    );

    let supervisor = start(source.clone(), sink.clone(), settings());
    eventually(|| source.deleted() == 1).await;
    let report = supervisor.shutdown().await;

    assert_eq!(sink.count("r-1"), 1);
    assert!(source.is_empty());
    assert!(source.dead_letters().is_empty());
    assert_eq!(report.counters.processed, 1);

    let (_, result) = &sink.submissions()[0];
    assert_eq!(result.location_name, "Cape Town");
    assert_eq!(result.coordinates.unwrap().lat, -33.9249);
    assert!(result.alerts.is_empty());
}

#[tokio::test]
async fn test_non_numeric_reading_is_dead_lettered_without_retry() {
    let source = Arc::new(MemorySource::new(Duration::from_secs(30)));
    let sink = Arc::new(MemorySink::new());
    source.enqueue(
        r#"{"reading_id": "r-2", "sensor_type": "temperature", "value": "not-a-number", "location_name": "Cape Town"}"#,
    );
    source.enqueue(
        r#"{"reading_id": "r-3", "sensor_type": "radiation", "value": 1.0, "location_name": "Cape Town"}"#,
    );

    let supervisor = start(source.clone(), sink.clone(), settings());
    eventually(|| source.dead_letters().len() == 2).await;
    let report = supervisor.shutdown().await;

    for letter in source.dead_letters() {
        assert_eq!(letter.delivery_count, 1);
        assert!(letter.reason.starts_with("validation failed"));
    }
    assert!(sink.submissions().is_empty());
    assert_eq!(report.counters.retried, 0);
    assert_eq!(report.counters.dead_lettered, 2);
}

#[tokio::test]
async fn test_duplicate_deliveries_submit_once() {
    // Short visibility so skipped copies come back quickly.
    let source = Arc::new(MemorySource::new(Duration::from_millis(200)));
    let sink = Arc::new(MemorySink::new());

    let body = r#"{"reading_id": "dup", "sensor_type": "humidity", "value": 95, "location_name": "Durban"}"#;
    for _ in 0..8 {
        source.enqueue(body);
    }

    let supervisor = start(
        source.clone(),
        sink.clone(),
        PoolSettings {
            batch_size: 1,
            ..settings()
        },
    );

    // Every copy is resolved: one processed, the rest deleted as duplicates or
    // skipped and redelivered later.
    eventually(|| source.is_empty()).await;
    supervisor.shutdown().await;

    assert_eq!(sink.count("dup"), 1);
    assert_eq!(sink.submissions()[0].1.alerts.len(), 1);
}

#[tokio::test]
async fn test_concurrent_acquire_has_one_winner() {
    let guard = IdempotencyGuard::new(Duration::from_secs(60));

    let attempts = (0..8).map(|_| {
        let guard = guard.clone();
        tokio::spawn(async move { guard.try_acquire(&LogicalId::new("same")) })
    });

    let winners = futures_util::future::join_all(attempts)
        .await
        .into_iter()
        .filter(|won| *won.as_ref().unwrap())
        .count();

    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_retry_budget_then_dead_letter() {
    let source = Arc::new(MemorySource::new(Duration::from_secs(30)));
    let sink = Arc::new(MemorySink::new());
    source.enqueue(
        r#"{"reading_id": "r-4", "sensor_type": "pressure", "value": 1013, "location_name": "Paarl"}"#,
    );

    let supervisor = Supervisor::builder()
        .source(source.clone())
        .processor(ReadingProcessor::new(Arc::new(Down)))
        .sink(sink.clone())
        .settings(PoolSettings {
            max_retries: 3,
            ..settings()
        })
        .start();

    eventually(|| !source.dead_letters().is_empty()).await;
    let report = supervisor.shutdown().await;

    let letters = source.dead_letters();
    assert_eq!(letters[0].delivery_count, 4);
    assert!(letters[0].reason.contains("retries exhausted"));
    assert_eq!(report.counters.retried, 3);
    assert!(sink.submissions().is_empty());
}

#[tokio::test]
async fn test_attempt_attribute_counts_toward_budget() {
    let source = Arc::new(MemorySource::new(Duration::from_secs(30)));
    let sink = Arc::new(MemorySink::new());

    // Carried over from an earlier life of the reading: no retries left.
    let attributes = HashMap::from([("attempt".to_owned(), "3".to_owned())]);
    source.enqueue_with_attributes(
        r#"{"reading_id": "r-5", "sensor_type": "temperature", "value": 21, "location_name": "Cape Town"}"#,
        attributes,
    );

    let supervisor = Supervisor::builder()
        .source(source.clone())
        .processor(ReadingProcessor::new(Arc::new(Down)))
        .sink(sink.clone())
        .settings(PoolSettings {
            max_retries: 3,
            ..settings()
        })
        .start();

    eventually(|| !source.dead_letters().is_empty()).await;
    let report = supervisor.shutdown().await;

    assert_eq!(source.dead_letters()[0].delivery_count, 1);
    assert_eq!(report.counters.retried, 0);
}

#[tokio::test]
async fn test_drain_stops_receiving_and_reaches_stopped() {
    let source = Arc::new(MemorySource::new(Duration::from_secs(30)));
    let sink = Arc::new(MemorySink::new());
    for i in 0..20 {
        source.enqueue(format!(
            r#"{{"reading_id": "d-{i}", "sensor_type": "air_quality", "value": 42, "location_name": "Pretoria"}}"#
        ));
    }

    let supervisor = start(source.clone(), sink.clone(), settings());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = tokio::time::Instant::now();
    let report = supervisor.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.state, PoolState::Stopped);

    let calls = source.receive_calls();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(source.receive_calls(), calls);

    // Nothing is lost: every reading was either submitted or is back on the queue.
    assert_eq!(sink.submissions().len() + source.len(), 20);
}

#[tokio::test]
async fn test_pool_survives_broker_outage() {
    let source = Arc::new(MemorySource::new(Duration::from_secs(30)));
    let sink = Arc::new(MemorySink::new());
    source.fail_next(10);
    source.enqueue(
        r#"{"reading_id": "r-6", "sensor_type": "temperature", "value": 31, "location_name": "Stellenbosch"}"#,
    );

    let supervisor = start(source.clone(), sink.clone(), settings());
    eventually(|| source.deleted() == 1).await;
    let report = supervisor.shutdown().await;

    assert_eq!(sink.count("r-6"), 1);
    assert!(report.counters.broker_errors > 0);
    assert_eq!(report.state, PoolState::Stopped);
}

#[tokio::test]
async fn test_sqlite_source_end_to_end() {
    let source = setup(Duration::from_secs(30)).await;
    let sink = Arc::new(MemorySink::new());

    source
        .enqueue(
            r#"{"reading_id": "s-1", "sensor_type": "temperature", "value": 33.1, "location_name": "Johannesburg", "timestamp": "2024-05-01T10:00:00"}"#,
            HashMap::new(),
        )
        .await
        .unwrap();
    source
        .enqueue(r#"{"sensor_type": "temperature""#, HashMap::new())
        .await
        .unwrap();

    let supervisor = start(source.source.clone(), sink.clone(), settings());

    let mut done = false;
    for _ in 0..500 {
        if source.depth().await.unwrap() == 0 {
            done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    supervisor.shutdown().await;
    assert!(done, "queue not drained");

    assert_eq!(sink.count("s-1"), 1);
    let (_, result) = &sink.submissions()[0];
    assert_eq!(result.alerts.len(), 1);
    assert_eq!(result.recorded_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");

    let letters = source.dead_letters().await.unwrap();
    assert_eq!(letters.len(), 1);
    assert!(letters[0].reason.contains("validation failed"));
}

#[tokio::test]
async fn test_delete_twice_is_harmless() {
    let source = setup(Duration::from_secs(30)).await;
    source.enqueue("{}", HashMap::new()).await.unwrap();

    let msg = source
        .receive(1, Duration::from_millis(100))
        .await
        .unwrap()
        .remove(0);

    source.delete(&msg).await.unwrap();
    source.delete(&msg).await.unwrap();
    assert_eq!(source.depth().await.unwrap(), 0);
}
