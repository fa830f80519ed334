//! Pool and worker state, counters, and the health report built from them.
//!
//! Everything here is written by workers on the hot path, so it is all atomics:
//! no worker ever waits on another to record progress.

use std::{
    sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
    time::Instant,
};

use serde::Serialize;
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Receiving = 1,
    Processing = 2,
    Resolving = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Receiving,
            2 => Self::Processing,
            3 => Self::Resolving,
            _ => Self::Idle,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PoolState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Per-worker state, owned by the pool and updated by that worker only.
#[derive(Debug, Default)]
pub struct WorkerSlot {
    state: AtomicU8,
    processed: AtomicU64,
}

impl WorkerSlot {
    pub fn set(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct PoolStats {
    received: AtomicU64,
    processed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    duplicates_skipped: AtomicU64,
    duplicates_deleted: AtomicU64,
    released_on_drain: AtomicU64,
    broker_errors: AtomicU64,
    consecutive_broker_failures: AtomicU32,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl PoolStats {
    counter!(record_processed, processed);
    counter!(record_retried, retried);
    counter!(record_dead_lettered, dead_lettered);
    counter!(record_duplicate_skipped, duplicates_skipped);
    counter!(record_duplicate_deleted, duplicates_deleted);
    counter!(record_released_on_drain, released_on_drain);

    pub fn record_received(&self, n: usize) {
        self.received.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// A broker call failed after its call-site retries.
    pub fn record_broker_failure(&self) -> u32 {
        self.broker_errors.fetch_add(1, Ordering::Relaxed);
        self.consecutive_broker_failures
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1)
    }

    pub fn record_broker_success(&self) {
        self.consecutive_broker_failures.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Counters {
        Counters {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            duplicates_deleted: self.duplicates_deleted.load(Ordering::Relaxed),
            released_on_drain: self.released_on_drain.load(Ordering::Relaxed),
            broker_errors: self.broker_errors.load(Ordering::Relaxed),
            consecutive_broker_failures: self.consecutive_broker_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub received: u64,
    pub processed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub duplicates_skipped: u64,
    pub duplicates_deleted: u64,
    pub released_on_drain: u64,
    pub broker_errors: u64,
    pub consecutive_broker_failures: u32,
}

impl Counters {
    /// Share of resolved attempts that failed (retried or dead-lettered).
    pub fn error_rate(&self) -> f64 {
        let failed = self.retried + self.dead_lettered;
        let total = self.processed + failed;
        if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkerHealth {
    pub worker_id: usize,
    pub state: WorkerState,
    pub messages_processed: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub state: PoolState,
    pub healthy: bool,
    pub uptime_secs: f64,
    pub workers: Vec<WorkerHealth>,
    pub counters: Counters,
    pub error_rate: f64,
}

/// Shared health state of one pool.
#[derive(Debug)]
pub struct PoolHealth {
    state: watch::Sender<PoolState>,
    workers: Vec<WorkerSlot>,
    stats: PoolStats,
    started: Instant,
    unhealthy_after: u32,
}

impl PoolHealth {
    pub fn new(pool_size: usize, unhealthy_after: u32) -> Self {
        let (state, _) = watch::channel(PoolState::Starting);

        Self {
            state,
            workers: (0..pool_size).map(|_| WorkerSlot::default()).collect(),
            stats: PoolStats::default(),
            started: Instant::now(),
            unhealthy_after: unhealthy_after.max(1),
        }
    }

    pub fn set_state(&self, state: PoolState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(from = %previous, to = %state, "Pool state changed");
        }
    }

    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    /// Slot for worker `id`. Ids are assigned by the pool, `0..pool_size`.
    pub fn worker(&self, id: usize) -> &WorkerSlot {
        &self.workers[id]
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Healthy while accepting work and the broker has not failed
    /// `unhealthy_after` times in a row.
    pub fn is_healthy(&self) -> bool {
        let consecutive = self
            .stats
            .consecutive_broker_failures
            .load(Ordering::Relaxed);

        matches!(self.state(), PoolState::Starting | PoolState::Running)
            && consecutive < self.unhealthy_after
    }

    pub fn report(&self) -> HealthReport {
        let counters = self.stats.snapshot();

        HealthReport {
            state: self.state(),
            healthy: self.is_healthy(),
            uptime_secs: self.started.elapsed().as_secs_f64(),
            workers: self
                .workers
                .iter()
                .enumerate()
                .map(|(worker_id, slot)| WorkerHealth {
                    worker_id,
                    state: slot.state(),
                    messages_processed: slot.processed(),
                })
                .collect(),
            error_rate: counters.error_rate(),
            counters,
        }
    }
}
