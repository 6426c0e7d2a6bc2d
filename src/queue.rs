//! C3 — PriorityQueue (spec.md §4.3): four FIFO buckets with a critical
//! escalation timer.
//!
//! State lives behind an `Arc<Mutex<...>>`, with per-message escalation
//! timers driven by spawned tokio tasks rather than OS threads.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::warn;

use crate::model::{Importance, Message};

const PRIORITIES: [Importance; 4] = [
    Importance::Critical,
    Importance::High,
    Importance::Normal,
    Importance::Low,
];

#[derive(Debug, Clone, Serialize, Default)]
pub struct QueueStats {
    pub lengths: [usize; 4],
    pub processed_count: [u64; 4],
}

struct Inner {
    buckets: [VecDeque<Message>; 4],
    processed_count: [u64; 4],
    escalation_timers: std::collections::HashMap<String, JoinHandle<()>>,
    closed: bool,
}

/// Fires when a critical message's escalation timer expires unconsumed.
/// Subscribers receive the message id; the broadcast fan-out to "all
/// registered workers" happens at the coordinator layer.
pub type EscalationSender = broadcast::Sender<String>;

pub struct PriorityQueue {
    inner: Arc<Mutex<Inner>>,
    escalation_timeout: Duration,
    escalation_tx: EscalationSender,
}

impl PriorityQueue {
    pub fn new(escalation_timeout: Duration) -> Self {
        let (escalation_tx, _rx) = broadcast::channel(256);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buckets: Default::default(),
                processed_count: [0; 4],
                escalation_timers: std::collections::HashMap::new(),
                closed: false,
            })),
            escalation_timeout,
            escalation_tx,
        }
    }

    pub fn subscribe_escalations(&self) -> broadcast::Receiver<String> {
        self.escalation_tx.subscribe()
    }

    fn bucket_index(importance: Importance) -> usize {
        importance.rank() as usize
    }

    /// Push to the appropriate bucket; for `CRITICAL`, arm the escalation
    /// timer (default 30s). On expiry, broadcasts the message id once and
    /// discards the timer; this never reorders the queue (spec.md §4.3).
    pub async fn enqueue(&self, msg: Message) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        let idx = Self::bucket_index(msg.importance);
        let is_critical = msg.importance == Importance::Critical;
        let id = msg.id.clone();
        inner.buckets[idx].push_back(msg);

        if is_critical && self.escalation_timeout > Duration::ZERO {
            let inner_arc = self.inner.clone();
            let escalation_tx = self.escalation_tx.clone();
            let timeout = self.escalation_timeout;
            let id_for_timer = id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let mut inner = inner_arc.lock().await;
                if inner.escalation_timers.remove(&id_for_timer).is_some() {
                    if escalation_tx.send(id_for_timer).is_err() {
                        warn!("no subscribers for escalation broadcast");
                    }
                }
            });
            inner.escalation_timers.insert(id, handle);
        }
    }

    /// Scans buckets highest to lowest priority; `None` when all empty.
    pub async fn dequeue(&self) -> Option<Message> {
        let mut inner = self.inner.lock().await;
        for idx in 0..PRIORITIES.len() {
            if let Some(msg) = inner.buckets[idx].pop_front() {
                inner.processed_count[idx] += 1;
                if let Some(handle) = inner.escalation_timers.remove(&msg.id) {
                    handle.abort();
                }
                return Some(msg);
            }
        }
        None
    }

    pub async fn peek(&self) -> Option<Message> {
        let inner = self.inner.lock().await;
        for idx in 0..PRIORITIES.len() {
            if let Some(msg) = inner.buckets[idx].front() {
                return Some(msg.clone());
            }
        }
        None
    }

    pub async fn get_lengths(&self) -> [usize; 4] {
        let inner = self.inner.lock().await;
        [
            inner.buckets[0].len(),
            inner.buckets[1].len(),
            inner.buckets[2].len(),
            inner.buckets[3].len(),
        ]
    }

    pub async fn get_by_priority(&self, importance: Importance) -> Vec<Message> {
        let inner = self.inner.lock().await;
        inner.buckets[Self::bucket_index(importance)]
            .iter()
            .cloned()
            .collect()
    }

    /// Removes a message by id from whichever bucket holds it, cancelling
    /// any escalation timer.
    pub async fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.escalation_timers.remove(id) {
            handle.abort();
        }
        for bucket in inner.buckets.iter_mut() {
            if let Some(pos) = bucket.iter().position(|m| m.id == id) {
                bucket.remove(pos);
                return true;
            }
        }
        false
    }

    pub async fn clear(&self, priority: Option<Importance>) {
        let mut inner = self.inner.lock().await;
        match priority {
            Some(p) => {
                let idx = Self::bucket_index(p);
                let drained: Vec<_> = inner.buckets[idx].drain(..).collect();
                for msg in drained {
                    if let Some(handle) = inner.escalation_timers.remove(&msg.id) {
                        handle.abort();
                    }
                }
            }
            None => {
                let drained: Vec<_> = inner
                    .buckets
                    .iter_mut()
                    .flat_map(|bucket| bucket.drain(..).collect::<Vec<_>>())
                    .collect();
                for msg in drained {
                    if let Some(handle) = inner.escalation_timers.remove(&msg.id) {
                        handle.abort();
                    }
                }
            }
        }
    }

    pub async fn get_stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        QueueStats {
            lengths: [
                inner.buckets[0].len(),
                inner.buckets[1].len(),
                inner.buckets[2].len(),
                inner.buckets[3].len(),
            ],
            processed_count: inner.processed_count,
        }
    }

    pub async fn is_empty(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.buckets.iter().all(|b| b.is_empty())
    }

    /// Cancels all timers and drops buckets; the queue is unusable after this.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        for (_, handle) in inner.escalation_timers.drain() {
            handle.abort();
        }
        for bucket in inner.buckets.iter_mut() {
            bucket.clear();
        }
        inner.closed = true;
    }
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            buckets: Default::default(),
            processed_count: [0; 4],
            escalation_timers: std::collections::HashMap::new(),
            closed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageStatus;

    fn msg(id: &str, importance: Importance) -> Message {
        Message {
            id: id.to_string(),
            message_type: "work".to_string(),
            version: "1.0".to_string(),
            timestamp: crate::model::now_ms(),
            sender: "coordinator".to_string(),
            recipient: "W1".to_string(),
            importance,
            payload: serde_json::Value::Null,
            correlation_id: None,
            retry_count: 0,
            status: MessageStatus::Pending,
        }
    }

    #[tokio::test]
    async fn higher_priority_preempts_lower() {
        let queue = PriorityQueue::new(Duration::from_secs(30));
        queue.enqueue(msg("low", Importance::Low)).await;
        queue.enqueue(msg("crit", Importance::Critical)).await;
        queue.enqueue(msg("normal", Importance::Normal)).await;

        let first = queue.dequeue().await.unwrap();
        assert_eq!(first.id, "crit");
    }

    #[tokio::test]
    async fn fifo_within_bucket() {
        let queue = PriorityQueue::new(Duration::from_secs(30));
        queue.enqueue(msg("a", Importance::Normal)).await;
        queue.enqueue(msg("b", Importance::Normal)).await;

        assert_eq!(queue.dequeue().await.unwrap().id, "a");
        assert_eq!(queue.dequeue().await.unwrap().id, "b");
    }

    #[tokio::test]
    async fn dequeue_on_empty_returns_none() {
        let queue = PriorityQueue::new(Duration::from_secs(30));
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn escalation_fires_once_if_not_dequeued() {
        let queue = PriorityQueue::new(Duration::from_millis(20));
        let mut rx = queue.subscribe_escalations();
        queue.enqueue(msg("crit", Importance::Critical)).await;

        let escalated_id = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("escalation should fire")
            .unwrap();
        assert_eq!(escalated_id, "crit");

        // message remains at head, was not removed by escalation
        let head = queue.peek().await.unwrap();
        assert_eq!(head.id, "crit");
    }

    #[tokio::test]
    async fn dequeue_before_escalation_cancels_timer() {
        let queue = PriorityQueue::new(Duration::from_millis(50));
        let mut rx = queue.subscribe_escalations();
        queue.enqueue(msg("crit", Importance::Critical)).await;
        queue.dequeue().await;

        let result = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(result.is_err(), "escalation should not fire after dequeue");
    }
}
