use std::sync::Arc;

use config::{Config, PoolSettings};
use processor::{AlertThresholds, LocationDirectory, LocationService, ReadingProcessor};
use sink::ResultSink;
use supervisor::Supervisor;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod config;
pub mod error;
pub mod guard;
pub mod health;
pub mod message;
pub mod processor;
pub mod retry;
pub mod sink;
pub mod source;
pub mod supervisor;
pub mod worker;

/// Returns a builder for the consumer process.
///
/// Reads [`Config`] from `SENSORQ_*` environment variables, connects the
/// configured queue backend, and runs the worker pool until SIGINT or SIGTERM.
#[bon::builder(finish_fn = start)]
pub async fn run<S: ResultSink>(
    sink: S,
    locations: Option<Arc<dyn LocationService>>,
    thresholds: Option<AlertThresholds>,
) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("SENSORQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("SENSORQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;
    let source = source::connect(&config).await?;

    let locations = locations.unwrap_or_else(|| Arc::new(LocationDirectory::default()));
    let processor =
        ReadingProcessor::new(locations).with_thresholds(thresholds.unwrap_or_default());

    let supervisor = Supervisor::builder()
        .source(source)
        .processor(processor)
        .sink(Arc::new(sink))
        .settings(PoolSettings::from(&config))
        .health_interval(config.health_interval())
        .start();

    shutdown_signal().await?;
    tracing::info!("Shutdown signal received, draining");

    let report = supervisor.shutdown().await;
    tracing::info!(report = %serde_json::to_string(&report)?, "Final health report");

    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?
            .recv()
            .await;
        Ok::<_, std::io::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        res = terminate => res,
    }
}
