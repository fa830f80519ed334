//! Per-reading deduplication across redeliveries and concurrent workers.
//!
//! The guard maps a [`LogicalId`] to a short-lived marker. Acquisition is an atomic
//! check-and-set on that single key, so workers handling unrelated readings never
//! contend with each other.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use papaya::{Compute, Operation};

use crate::message::LogicalId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerState {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy)]
struct Marker {
    state: MarkerState,
    expires_at: Instant,
}

impl Marker {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// How a worker finished with a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Resolved for good (committed or dead-lettered); later deliveries are duplicates.
    Completed,
    /// Left for another attempt; the next delivery may acquire again.
    Retryable,
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    markers: Arc<papaya::HashMap<LogicalId, Marker>>,
    grace: Duration,
}

impl IdempotencyGuard {
    /// Markers (in progress or completed) are forgotten after `grace`.
    pub fn new(grace: Duration) -> Self {
        Self {
            markers: Arc::new(papaya::HashMap::new()),
            grace,
        }
    }

    /// Marks `id` in progress, unless a live marker for it already exists.
    pub fn try_acquire(&self, id: &LogicalId) -> bool {
        let now = Instant::now();
        let marker = Marker {
            state: MarkerState::InProgress,
            expires_at: now + self.grace,
        };

        let markers = self.markers.pin();
        let result = markers.compute(id.clone(), |entry| match entry {
            Some((_, existing)) if existing.is_live(now) => Operation::Abort(()),
            _ => Operation::Insert(marker),
        });

        !matches!(result, Compute::Aborted(()))
    }

    pub fn release(&self, id: &LogicalId, outcome: Release) {
        let markers = self.markers.pin();

        match outcome {
            Release::Completed => {
                markers.insert(
                    id.clone(),
                    Marker {
                        state: MarkerState::Completed,
                        expires_at: Instant::now() + self.grace,
                    },
                );
            }
            Release::Retryable => {
                markers.compute(id.clone(), |entry| match entry {
                    Some((_, existing)) if existing.state == MarkerState::InProgress => {
                        Operation::Remove
                    }
                    _ => Operation::Abort(()),
                });
            }
        }
    }

    /// Pushes the expiry of an in-progress marker out by another grace period.
    pub fn refresh(&self, id: &LogicalId) {
        let expires_at = Instant::now() + self.grace;

        let markers = self.markers.pin();
        markers.compute(id.clone(), |entry| match entry {
            Some((_, existing)) if existing.state == MarkerState::InProgress => {
                Operation::Insert(Marker {
                    state: MarkerState::InProgress,
                    expires_at,
                })
            }
            _ => Operation::Abort(()),
        });
    }

    pub fn is_completed(&self, id: &LogicalId) -> bool {
        let now = Instant::now();
        self.markers
            .pin()
            .get(id)
            .is_some_and(|marker| marker.state == MarkerState::Completed && marker.is_live(now))
    }

    /// Drops expired markers. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let markers = self.markers.pin();

        let expired: Vec<LogicalId> = markers
            .iter()
            .filter(|(_, marker)| !marker.is_live(now))
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter(|id| {
                let result = markers.compute(id.clone(), |entry| match entry {
                    Some((_, marker)) if !marker.is_live(now) => Operation::Remove,
                    _ => Operation::Abort(()),
                });
                matches!(result, Compute::Removed(..))
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.markers.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
