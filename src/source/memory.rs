//! In-memory implementation of [`MessageSource`].
//!
//! Mirrors SQS semantics closely enough to exercise the worker pool: visibility
//! timeouts, per-delivery receipt handles, receive counts, and a dead-letter list.
//! Primarily used for testing and development environments.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use papaya::{Compute, Operation};
use rand::Rng;
use tokio::sync::Notify;

use super::{BrokerError, MessageSource};
use crate::message::{ReceiptHandle, SensorMessage, DEAD_LETTER_REASON_ATTRIBUTE};

/// How often a waiting `receive` rechecks for messages whose visibility expired.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct Entry {
    message_id: String,
    body: String,
    attributes: HashMap<String, String>,
    enqueued_at: DateTime<Utc>,
    delivery_count: u32,
    visible_at: Instant,
    receipt: Option<String>,
}

impl Entry {
    fn to_message(&self) -> Option<SensorMessage> {
        Some(SensorMessage {
            message_id: self.message_id.clone(),
            receipt: ReceiptHandle::new(self.receipt.clone()?),
            body: self.body.clone(),
            attributes: self.attributes.clone(),
            delivery_count: self.delivery_count,
            enqueued_at: self.enqueued_at,
        })
    }

    fn holds(&self, receipt: &ReceiptHandle) -> bool {
        self.receipt.as_deref() == Some(receipt.as_str())
    }
}

/// A message moved to the dead-letter list.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_id: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
    pub delivery_count: u32,
    pub reason: String,
}

/// Thread-safe in-memory queue.
pub struct MemorySource {
    messages: papaya::HashMap<u64, Entry>,
    dead_letters: papaya::HashMap<u64, DeadLetter>,
    next_id: AtomicU64,
    visibility_timeout: Duration,
    arrivals: Notify,

    fail_next: AtomicU32,
    receive_calls: AtomicUsize,
    deleted: AtomicUsize,
}

impl MemorySource {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            messages: papaya::HashMap::new(),
            dead_letters: papaya::HashMap::new(),
            next_id: AtomicU64::new(1),
            visibility_timeout,
            arrivals: Notify::new(),
            fail_next: AtomicU32::new(0),
            receive_calls: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
        }
    }

    /// Enqueues a raw body. Returns the new message id.
    pub fn enqueue(&self, body: impl Into<String>) -> String {
        self.enqueue_with_attributes(body, HashMap::new())
    }

    pub fn enqueue_with_attributes(
        &self,
        body: impl Into<String>,
        attributes: HashMap<String, String>,
    ) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message_id = format!("mem-{id}");

        self.messages.pin().insert(
            id,
            Entry {
                message_id: message_id.clone(),
                body: body.into(),
                attributes,
                enqueued_at: Utc::now(),
                delivery_count: 0,
                visible_at: Instant::now(),
                receipt: None,
            },
        );
        self.arrivals.notify_waiters();

        message_id
    }

    /// Makes the next `n` operations fail as if the broker were unreachable.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of `receive` calls made so far, failed ones included.
    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    /// Number of messages removed by `delete`.
    pub fn deleted(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        let mut letters: Vec<_> = self
            .dead_letters
            .pin()
            .iter()
            .map(|(id, letter)| (*id, letter.clone()))
            .collect();
        letters.sort_by_key(|(id, _)| *id);
        letters.into_iter().map(|(_, letter)| letter).collect()
    }

    /// Messages still on the live queue, visible or in flight.
    pub fn len(&self) -> usize {
        self.messages.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivery count of a live message, by message id.
    pub fn delivery_count(&self, message_id: &str) -> Option<u32> {
        self.messages
            .pin()
            .iter()
            .find(|(_, entry)| entry.message_id == message_id)
            .map(|(_, entry)| entry.delivery_count)
    }

    fn injected_failure(&self, operation: &'static str) -> Result<(), BrokerError> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if injected {
            Err(BrokerError::unavailable(operation, "injected failure"))
        } else {
            Ok(())
        }
    }

    fn claim(&self, max_messages: usize) -> Vec<SensorMessage> {
        let now = Instant::now();
        let messages = self.messages.pin();

        let mut candidates: Vec<u64> = messages
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .map(|(id, _)| *id)
            .collect();
        candidates.sort_unstable();

        let mut claimed = Vec::new();
        for id in candidates {
            if claimed.len() >= max_messages {
                break;
            }

            let nonce: u32 = rand::thread_rng().gen();
            let result = messages.compute(id, |entry| match entry {
                Some((_, entry)) if entry.visible_at <= now => {
                    let mut entry = entry.clone();
                    entry.delivery_count += 1;
                    entry.visible_at = now + self.visibility_timeout;
                    entry.receipt = Some(format!("{id}:{}:{nonce:08x}", entry.delivery_count));
                    Operation::Insert(entry)
                }
                _ => Operation::Abort(()),
            });

            if let Compute::Updated { new: (_, entry), .. } = result {
                claimed.extend(entry.to_message());
            }
        }

        claimed
    }

    /// Applies `update` to the entry currently held by `receipt`. Returns whether
    /// the receipt was still current.
    fn with_receipt(&self, receipt: &ReceiptHandle, mut update: impl FnMut(&mut Entry)) -> bool {
        let Some(id) = parse_receipt(receipt) else {
            return false;
        };

        let messages = self.messages.pin();
        let result = messages.compute(id, |entry| match entry {
            Some((_, entry)) if entry.holds(receipt) => {
                let mut entry = entry.clone();
                update(&mut entry);
                Operation::Insert(entry)
            }
            _ => Operation::Abort(()),
        });

        matches!(result, Compute::Updated { .. })
    }

    /// Removes the entry held by `receipt`, returning it.
    fn take(&self, receipt: &ReceiptHandle) -> Option<Entry> {
        let id = parse_receipt(receipt)?;

        let messages = self.messages.pin();
        let result = messages.compute(id, |entry| match entry {
            Some((_, entry)) if entry.holds(receipt) => Operation::Remove,
            _ => Operation::Abort(()),
        });

        match result {
            Compute::Removed(_, entry) => Some(entry.clone()),
            _ => None,
        }
    }
}

fn parse_receipt(receipt: &ReceiptHandle) -> Option<u64> {
    receipt.as_str().split(':').next()?.parse().ok()
}

impl MessageSource for MemorySource {
    fn receive(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> BoxFuture<'_, Result<Vec<SensorMessage>, BrokerError>> {
        Box::pin(async move {
            self.receive_calls.fetch_add(1, Ordering::SeqCst);
            self.injected_failure("receive")?;

            let deadline = Instant::now() + wait_time;
            loop {
                let arrived = self.arrivals.notified();

                let batch = self.claim(max_messages);
                if !batch.is_empty() {
                    return Ok(batch);
                }

                let now = Instant::now();
                if now >= deadline {
                    return Ok(Vec::new());
                }

                let _ = tokio::time::timeout((deadline - now).min(POLL_INTERVAL), arrived).await;
            }
        })
    }

    fn extend_visibility<'a>(
        &'a self,
        message: &'a SensorMessage,
        duration: Duration,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            self.injected_failure("extend_visibility")?;

            let visible_at = Instant::now() + duration;
            if self.with_receipt(&message.receipt, |entry| entry.visible_at = visible_at) {
                Ok(())
            } else {
                Err(BrokerError::rejected(
                    "extend_visibility",
                    format!("receipt handle {} is no longer in flight", message.receipt),
                ))
            }
        })
    }

    fn delete<'a>(&'a self, message: &'a SensorMessage) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            self.injected_failure("delete")?;

            if self.take(&message.receipt).is_some() {
                self.deleted.fetch_add(1, Ordering::SeqCst);
            } else {
                tracing::warn!(
                    message_id = %message.message_id,
                    receipt = %message.receipt,
                    "Delete of stale or unknown receipt handle ignored"
                );
            }

            Ok(())
        })
    }

    fn dead_letter<'a>(
        &'a self,
        message: &'a SensorMessage,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            self.injected_failure("dead_letter")?;

            let Some(entry) = self.take(&message.receipt) else {
                tracing::warn!(
                    message_id = %message.message_id,
                    receipt = %message.receipt,
                    "Dead-letter of stale or unknown receipt handle ignored"
                );
                return Ok(());
            };

            let mut attributes = entry.attributes;
            attributes.insert(DEAD_LETTER_REASON_ATTRIBUTE.to_owned(), reason.to_owned());

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.dead_letters.pin().insert(
                id,
                DeadLetter {
                    message_id: entry.message_id,
                    body: entry.body,
                    attributes,
                    delivery_count: entry.delivery_count,
                    reason: reason.to_owned(),
                },
            );

            Ok(())
        })
    }

    fn release<'a>(
        &'a self,
        message: &'a SensorMessage,
        delay: Duration,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            self.injected_failure("release")?;

            let visible_at = Instant::now() + delay;
            let released = self.with_receipt(&message.receipt, |entry| {
                entry.visible_at = visible_at;
                entry.receipt = None;
            });

            if released && delay.is_zero() {
                self.arrivals.notify_waiters();
            }

            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_receive_hides_messages() {
        let source = MemorySource::new(Duration::from_secs(30));
        source.enqueue("a");
        source.enqueue("b");

        let first = source.receive(10, WAIT).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|m| m.delivery_count == 1));
        assert_ne!(first[0].receipt, first[1].receipt);

        let second = source.receive(10, WAIT).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(source.receive_calls(), 2);
    }

    #[tokio::test]
    async fn test_receive_respects_batch_size() {
        let source = MemorySource::new(Duration::from_secs(30));
        for i in 0..5 {
            source.enqueue(format!("{i}"));
        }

        assert_eq!(source.receive(2, WAIT).await.unwrap().len(), 2);
        assert_eq!(source.receive(10, WAIT).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_enqueue() {
        let source = std::sync::Arc::new(MemorySource::new(Duration::from_secs(30)));

        let producer = {
            let source = source.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                source.enqueue("late");
            })
        };

        let batch = source.receive(1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "late");
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_redelivery_after_visibility_timeout() {
        let source = MemorySource::new(Duration::from_millis(20));
        let id = source.enqueue("x");

        let first = source.receive(1, WAIT).await.unwrap().remove(0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = source.receive(1, WAIT).await.unwrap().remove(0);

        assert_eq!(first.message_id, id);
        assert_eq!(second.message_id, id);
        assert_eq!(second.delivery_count, 2);
        assert_ne!(first.receipt, second.receipt);

        // The first delivery's handle is stale now.
        source.delete(&first).await.unwrap();
        assert_eq!(source.deleted(), 0);
        assert!(source.extend_visibility(&first, WAIT).await.is_err());

        source.delete(&second).await.unwrap();
        assert_eq!(source.deleted(), 1);
        assert!(source.is_empty());
    }

    #[tokio::test]
    async fn test_delete_twice_is_benign() {
        let source = MemorySource::new(Duration::from_secs(30));
        source.enqueue("x");

        let msg = source.receive(1, WAIT).await.unwrap().remove(0);
        source.delete(&msg).await.unwrap();
        source.delete(&msg).await.unwrap();

        assert_eq!(source.deleted(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_attaches_reason() {
        let source = MemorySource::new(Duration::from_secs(30));
        source.enqueue("poison");

        let msg = source.receive(1, WAIT).await.unwrap().remove(0);
        source.dead_letter(&msg, "bad payload").await.unwrap();

        let letters = source.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, "bad payload");
        assert_eq!(
            letters[0].attributes.get(DEAD_LETTER_REASON_ATTRIBUTE).map(String::as_str),
            Some("bad payload")
        );
        assert!(source.is_empty());
    }

    #[tokio::test]
    async fn test_release_with_delay() {
        let source = MemorySource::new(Duration::from_secs(30));
        source.enqueue("x");

        let msg = source.receive(1, WAIT).await.unwrap().remove(0);
        source.release(&msg, Duration::from_millis(40)).await.unwrap();

        assert!(source.receive(1, Duration::ZERO).await.unwrap().is_empty());

        let again = source.receive(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let source = MemorySource::new(Duration::from_secs(30));
        source.fail_next(2);

        assert!(source.receive(1, WAIT).await.unwrap_err().is_transient());
        assert!(source.receive(1, WAIT).await.is_err());
        assert!(source.receive(1, WAIT).await.is_ok());
    }
}
