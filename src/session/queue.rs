//! Bounded hand-off between a relay loop and its publisher session

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use super::OutboundMessage;

/// Result of offering a message to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue stayed full for the whole wait; the oldest entry was evicted
    DroppedOldest,
    /// Publisher is gone, message discarded
    Closed,
}

/// Fixed-capacity FIFO with async waiting on both ends.
///
/// One producer (the relay loop) and one consumer (the publisher). A
/// producer that finds the queue full waits up to its timeout for space and
/// then evicts the oldest message instead of blocking the subscriber.
pub struct OutboundQueue {
    queue: ArrayQueue<OutboundMessage>,
    not_empty: Notify,
    not_full: Notify,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn push(&self, mut msg: OutboundMessage, wait: Duration) -> PushOutcome {
        let deadline = Instant::now() + wait;

        loop {
            if self.is_closed() {
                return PushOutcome::Closed;
            }

            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.queue.push(msg) {
                Ok(()) => {
                    self.not_empty.notify_one();
                    return PushOutcome::Queued;
                }
                Err(rejected) => msg = rejected,
            }

            if timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let evicted = self.queue.force_push(msg);
        self.not_empty.notify_one();
        match evicted {
            Some(_) => PushOutcome::DroppedOldest,
            None => PushOutcome::Queued,
        }
    }

    /// Wait for the next message. `None` once closed and drained.
    ///
    /// Cancel-safe: a message is only removed on the poll that returns it.
    pub async fn pop(&self) -> Option<OutboundMessage> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(msg) = self.try_pop() {
                return Some(msg);
            }
            if self.is_closed() {
                return None;
            }

            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<OutboundMessage> {
        let msg = self.queue.pop()?;
        self.not_full.notify_one();
        Some(msg)
    }

    /// Refuse new messages and wake both ends. Queued messages can still be
    /// popped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Properties, QoS};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn msg(topic: &str) -> OutboundMessage {
        OutboundMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"x"),
            qos: QoS::AtLeastOnce,
            retain: false,
            properties: Properties::default(),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OutboundQueue::new(4);
        for t in ["a", "b", "c"] {
            assert_eq!(
                queue.push(msg(t), Duration::from_millis(10)).await,
                PushOutcome::Queued
            );
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().await.unwrap().topic, "a");
        assert_eq!(queue.pop().await.unwrap().topic, "b");
        assert_eq!(queue.pop().await.unwrap().topic, "c");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest_after_timeout() {
        let queue = OutboundQueue::new(2);
        queue.push(msg("a"), Duration::ZERO).await;
        queue.push(msg("b"), Duration::ZERO).await;

        let outcome = queue.push(msg("c"), Duration::from_millis(20)).await;
        assert_eq!(outcome, PushOutcome::DroppedOldest);

        assert_eq!(queue.try_pop().unwrap().topic, "b");
        assert_eq!(queue.try_pop().unwrap().topic, "c");
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn test_blocked_push_completes_when_space_frees() {
        let queue = Arc::new(OutboundQueue::new(1));
        queue.push(msg("a"), Duration::ZERO).await;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(msg("b"), Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pop().await.unwrap().topic, "a");
        assert_eq!(producer.await.unwrap(), PushOutcome::Queued);
        assert_eq!(queue.pop().await.unwrap().topic, "b");
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(OutboundQueue::new(4));

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(msg("late"), Duration::ZERO).await;
        assert_eq!(consumer.await.unwrap().unwrap().topic, "late");
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = Arc::new(OutboundQueue::new(4));
        queue.push(msg("a"), Duration::ZERO).await;
        queue.close();

        assert_eq!(
            queue.push(msg("b"), Duration::ZERO).await,
            PushOutcome::Closed
        );
        assert_eq!(queue.pop().await.unwrap().topic, "a");
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        let queue = Arc::new(OutboundQueue::new(4));

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert!(consumer.await.unwrap().is_none());
    }
}
