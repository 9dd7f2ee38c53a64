//! Message queue with priority and flow control.
//!
//! Handles queuing of injection messages with:
//! - Importance ordering (lower number = more urgent, ties keep arrival order)
//! - A hard capacity and high/low backpressure watermarks
//! - Deduplication by message ID

use crate::config::InjectionConfig;
use crate::dedup::DedupCache;
use crate::inject::PipelineEvent;
use crate::protocol::QueuedMessage;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

/// Result of offering a message to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued { queue_length: usize },
    Duplicate,
    Rejected { queue_length: usize },
}

struct QueueInner {
    /// Kept sorted by importance; the head is the next message to inject
    items: Vec<QueuedMessage>,
    seen: DedupCache,
    backpressure: bool,
}

/// Message queue with importance ordering and backpressure
pub struct MessageQueue {
    inner: Mutex<QueueInner>,
    max_size: usize,
    high_watermark: usize,
    low_watermark: usize,
    notify: Notify,
    events: broadcast::Sender<PipelineEvent>,
}

impl MessageQueue {
    pub fn new(config: &InjectionConfig, events: broadcast::Sender<PipelineEvent>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: Vec::new(),
                seen: DedupCache::new(config.dedup_capacity),
                backpressure: false,
            }),
            max_size: config.queue_max,
            high_watermark: config.high_watermark(),
            low_watermark: config.low_watermark(),
            notify: Notify::new(),
            events,
        }
    }

    /// Add a message to the queue.
    pub fn enqueue(&self, msg: QueuedMessage) -> EnqueueOutcome {
        let mut inner = self.inner.lock();

        if inner.seen.contains(&msg.message_id) {
            debug!("Duplicate message ID: {}", msg.message_id);
            return EnqueueOutcome::Duplicate;
        }

        if inner.items.len() >= self.max_size {
            let queue_length = inner.items.len();
            warn!(
                "Queue at capacity ({}), rejecting message {} from {}",
                self.max_size, msg.message_id, msg.from
            );
            drop(inner);
            let _ = self.events.send(PipelineEvent::Rejected {
                id: msg.message_id,
                from: msg.from,
                queue_length,
            });
            return EnqueueOutcome::Rejected { queue_length };
        }

        // Rejected ids stay unseen so a resend can still be queued
        inner.seen.check(&msg.message_id);
        let id = msg.message_id.clone();
        let from = msg.from.clone();
        inner.items.push(msg);
        // Stable: equal importance keeps arrival order
        inner.items.sort_by_key(|m| m.importance);
        let queue_length = inner.items.len();
        debug!("Enqueued message {}, queue size: {}", id, queue_length);

        let crossed_high = !inner.backpressure && queue_length >= self.high_watermark;
        if crossed_high {
            inner.backpressure = true;
        }
        drop(inner);

        let _ = self.events.send(PipelineEvent::Queued {
            id,
            from,
            queue_length,
        });
        if crossed_high {
            warn!("Queue reached high watermark ({} messages)", queue_length);
            let _ = self.events.send(PipelineEvent::Backpressure {
                queue_length,
                accept: false,
            });
        }

        self.notify.notify_one();
        EnqueueOutcome::Queued { queue_length }
    }

    /// Wait until the queue is non-empty and return a copy of its head.
    ///
    /// The head stays queued until `remove` is called with its id.
    pub async fn next(&self) -> QueuedMessage {
        loop {
            if let Some(head) = self.peek() {
                return head;
            }
            self.notify.notified().await;
        }
    }

    pub fn peek(&self) -> Option<QueuedMessage> {
        self.inner.lock().items.first().cloned()
    }

    /// Remove a message once it was delivered or given up on.
    pub fn remove(&self, id: &str) -> Option<QueuedMessage> {
        let mut inner = self.inner.lock();
        let pos = inner.items.iter().position(|m| m.message_id == id)?;
        let msg = inner.items.remove(pos);
        let queue_length = inner.items.len();

        let released = inner.backpressure && queue_length <= self.low_watermark;
        if released {
            inner.backpressure = false;
        }
        drop(inner);

        if released {
            info!("Queue drained to low watermark ({} messages)", queue_length);
            let _ = self.events.send(PipelineEvent::Backpressure {
                queue_length,
                accept: true,
            });
        }
        Some(msg)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn is_backpressured(&self) -> bool {
        self.inner.lock().backpressure
    }

    /// Queued message ids in injection order
    pub fn ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .items
            .iter()
            .map(|m| m.message_id.clone())
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            queue_length: inner.items.len(),
            max_size: self.max_size,
            seen_count: inner.seen.len(),
            backpressure: inner.backpressure,
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queue_length: usize,
    pub max_size: usize,
    pub seen_count: usize,
    pub backpressure: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(max: usize) -> (MessageQueue, broadcast::Receiver<PipelineEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let config = InjectionConfig {
            queue_max: max,
            ..Default::default()
        };
        (MessageQueue::new(&config, tx), rx)
    }

    fn msg(id: &str, importance: u8) -> QueuedMessage {
        QueuedMessage::new(id.to_string(), "A".to_string(), format!("body {}", id), importance)
    }

    #[test]
    fn test_priority_ordering() {
        let (queue, _rx) = queue(10);
        queue.enqueue(msg("low", 10));
        queue.enqueue(msg("high", 1));
        queue.enqueue(msg("medium", 5));
        assert_eq!(queue.ids(), vec!["high", "medium", "low"]);
    }

    #[test]
    fn test_equal_importance_keeps_arrival_order() {
        let (queue, _rx) = queue(10);
        for id in ["a", "b", "c"] {
            queue.enqueue(msg(id, 5));
        }
        queue.enqueue(msg("urgent", 0));
        queue.enqueue(msg("d", 5));
        assert_eq!(queue.ids(), vec!["urgent", "a", "b", "c", "d"]);
    }

    #[test]
    fn test_deduplication() {
        let (queue, _rx) = queue(10);
        assert_eq!(
            queue.enqueue(msg("dup", 0)),
            EnqueueOutcome::Queued { queue_length: 1 }
        );
        assert_eq!(queue.enqueue(msg("dup", 0)), EnqueueOutcome::Duplicate);
        assert_eq!(queue.len(), 1);

        // Still a duplicate after it left the queue
        queue.remove("dup");
        assert_eq!(queue.enqueue(msg("dup", 0)), EnqueueOutcome::Duplicate);
    }

    #[test]
    fn test_capacity_rejects() {
        let (queue, mut rx) = queue(2);
        queue.enqueue(msg("1", 0));
        queue.enqueue(msg("2", 0));
        assert_eq!(
            queue.enqueue(msg("3", 0)),
            EnqueueOutcome::Rejected { queue_length: 2 }
        );

        let mut rejected = false;
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::Rejected { id, .. } = event {
                assert_eq!(id, "3");
                rejected = true;
            }
        }
        assert!(rejected);
    }

    #[test]
    fn test_rejected_message_can_be_queued_later() {
        let (queue, _rx) = queue(1);
        queue.enqueue(msg("a", 0));
        assert!(matches!(
            queue.enqueue(msg("b", 0)),
            EnqueueOutcome::Rejected { .. }
        ));

        queue.remove("a");
        assert_eq!(
            queue.enqueue(msg("b", 0)),
            EnqueueOutcome::Queued { queue_length: 1 }
        );
        assert_eq!(queue.enqueue(msg("b", 0)), EnqueueOutcome::Duplicate);
    }

    #[test]
    fn test_watermarks_fire_once_each() {
        let (queue, mut rx) = queue(10);
        for i in 0..10 {
            queue.enqueue(msg(&i.to_string(), 0));
        }
        assert!(queue.is_backpressured());
        for i in 0..10 {
            queue.remove(&i.to_string());
        }
        assert!(!queue.is_backpressured());

        let mut signals = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::Backpressure {
                queue_length,
                accept,
            } = event
            {
                signals.push((queue_length, accept));
            }
        }
        assert_eq!(signals, vec![(8, false), (5, true)]);
    }

    #[tokio::test]
    async fn test_next_waits_for_enqueue() {
        let (tx, _rx) = broadcast::channel(16);
        let queue = std::sync::Arc::new(MessageQueue::new(&InjectionConfig::default(), tx));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(msg("late", 3));
        let head = waiter.await.unwrap();
        assert_eq!(head.message_id, "late");
        // next() does not dequeue
        assert_eq!(queue.len(), 1);
    }
}
