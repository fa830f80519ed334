use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::Error;

/// Which [`MessageSource`](crate::source::MessageSource) implementation to run against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum QueueBackend {
    Memory,
    #[default]
    Sqlite,
    Sqs,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue_backend: QueueBackend,
    pub db_path: Option<String>,
    pub queue_url: Option<Url>,
    pub dead_letter_url: Option<Url>,
    pub endpoint_url: Option<Url>,
    pub region: Option<String>,

    #[serde(default = "defaults::pool_size")]
    pub pool_size: usize,
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
    #[serde(default = "defaults::wait_time_secs")]
    pub wait_time_secs: u64,
    #[serde(default = "defaults::visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "defaults::visibility_extension_secs")]
    pub visibility_extension_secs: u64,

    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    #[serde(default = "defaults::backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "defaults::backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    #[serde(default = "defaults::drain_grace_secs")]
    pub drain_grace_secs: u64,
    #[serde(default = "defaults::guard_grace_secs")]
    pub guard_grace_secs: u64,

    #[serde(default = "defaults::broker_retry_attempts")]
    pub broker_retry_attempts: u32,
    #[serde(default = "defaults::broker_backoff_ms")]
    pub broker_backoff_ms: u64,
    #[serde(default = "defaults::unhealthy_after")]
    pub unhealthy_after: u32,
    #[serde(default = "defaults::health_interval_secs")]
    pub health_interval_secs: u64,
}

mod defaults {
    pub fn pool_size() -> usize {
        4
    }

    pub fn batch_size() -> usize {
        5
    }

    pub fn wait_time_secs() -> u64 {
        20
    }

    pub fn visibility_timeout_secs() -> u64 {
        30
    }

    pub fn visibility_extension_secs() -> u64 {
        20
    }

    pub fn max_retries() -> u32 {
        3
    }

    pub fn backoff_base_ms() -> u64 {
        1_000
    }

    pub fn backoff_cap_ms() -> u64 {
        60_000
    }

    pub fn drain_grace_secs() -> u64 {
        30
    }

    pub fn guard_grace_secs() -> u64 {
        300
    }

    pub fn broker_retry_attempts() -> u32 {
        3
    }

    pub fn broker_backoff_ms() -> u64 {
        200
    }

    pub fn unhealthy_after() -> u32 {
        5
    }

    pub fn health_interval_secs() -> u64 {
        60
    }
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        let config = envy::prefixed("SENSORQ_").from_env::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.pool_size == 0 {
            return Err(Error::invalid_config("pool_size must be at least 1"));
        }

        if self.visibility_extension_secs >= self.visibility_timeout_secs {
            return Err(Error::invalid_config(format!(
                "visibility_extension_secs ({}) must be below visibility_timeout_secs ({})",
                self.visibility_extension_secs, self.visibility_timeout_secs
            )));
        }

        if self.guard_grace_secs <= self.visibility_timeout_secs {
            return Err(Error::invalid_config(format!(
                "guard_grace_secs ({}) must exceed visibility_timeout_secs ({})",
                self.guard_grace_secs, self.visibility_timeout_secs
            )));
        }

        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(Error::invalid_config(
                "backoff_base_ms must not exceed backoff_cap_ms",
            ));
        }

        if self.queue_backend == QueueBackend::Sqs {
            if self.queue_url.is_none() {
                return Err(Error::invalid_config("sqs backend requires queue_url"));
            }
            if self.dead_letter_url.is_none() {
                return Err(Error::invalid_config(
                    "sqs backend requires dead_letter_url",
                ));
            }
        }

        Ok(())
    }

    pub fn db_path(&self) -> &str {
        self.db_path
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("sensorq.db")
    }

    pub fn region(&self) -> &str {
        self.region
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("us-east-1")
    }

    /// Receive batch size, clamped to what SQS accepts.
    pub fn batch_size(&self) -> usize {
        self.batch_size.clamp(1, 10)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs.min(20))
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_backend: QueueBackend::default(),
            db_path: None,
            queue_url: None,
            dead_letter_url: None,
            endpoint_url: None,
            region: None,
            pool_size: defaults::pool_size(),
            batch_size: defaults::batch_size(),
            wait_time_secs: defaults::wait_time_secs(),
            visibility_timeout_secs: defaults::visibility_timeout_secs(),
            visibility_extension_secs: defaults::visibility_extension_secs(),
            max_retries: defaults::max_retries(),
            backoff_base_ms: defaults::backoff_base_ms(),
            backoff_cap_ms: defaults::backoff_cap_ms(),
            drain_grace_secs: defaults::drain_grace_secs(),
            guard_grace_secs: defaults::guard_grace_secs(),
            broker_retry_attempts: defaults::broker_retry_attempts(),
            broker_backoff_ms: defaults::broker_backoff_ms(),
            unhealthy_after: defaults::unhealthy_after(),
            health_interval_secs: defaults::health_interval_secs(),
        }
    }
}

/// Typed projection of [`Config`] consumed by the worker pool.
#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub pool_size: usize,
    pub batch_size: usize,
    pub wait_time: Duration,
    pub visibility_timeout: Duration,
    pub visibility_extension: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub drain_grace: Duration,
    pub guard_grace: Duration,
    pub broker_retry_attempts: u32,
    pub broker_backoff: Duration,
    pub unhealthy_after: u32,
}

impl From<&Config> for PoolSettings {
    fn from(config: &Config) -> Self {
        Self {
            pool_size: config.pool_size,
            batch_size: config.batch_size(),
            wait_time: config.wait_time(),
            visibility_timeout: config.visibility_timeout(),
            visibility_extension: Duration::from_secs(config.visibility_extension_secs),
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
            drain_grace: Duration::from_secs(config.drain_grace_secs),
            guard_grace: Duration::from_secs(config.guard_grace_secs),
            broker_retry_attempts: config.broker_retry_attempts,
            broker_backoff: Duration::from_millis(config.broker_backoff_ms),
            unhealthy_after: config.unhealthy_after,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}
