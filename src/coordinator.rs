//! C12 — Coordinator facade (spec.md §4.12): lifecycle, dispatch, status
//! aggregation.
//!
//! Components reference each other only through narrow interfaces
//! (spec.md §9 "Cyclic component references"); the facade is the only
//! place that holds every component as a constructor dependency.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{info, instrument, warn};

use crate::ack::{AckOutcome, AckTracker};
use crate::claim::TaskClaimManager;
use crate::config::Config;
use crate::dead_letter::DeadLetterStore;
use crate::error::{PtcError, PtcResult};
use crate::heartbeat::HeartbeatManager;
use crate::id::{new_message_id, NewIdOptions};
use crate::model::{Importance, Message, MessageStatus, Worker};
use crate::queue::PriorityQueue;
use crate::reassignment::Reassignment;
use crate::registry::WorkerRegistry;
use crate::retry::{RetryConfig, RetryHandler};
use crate::stale::StaleDetector;
use crate::store::Store;

pub type MessageHandler =
    Arc<dyn Fn(Message) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send + Sync>;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SendResult {
    pub success: bool,
    pub message_id: String,
}

/// Library-side counterpart of an operator health endpoint: the data a
/// surrounding process would serve over HTTP, not a server itself
/// (spec.md §1 keeps "health HTTP endpoints" an external collaborator).
#[derive(Debug, Clone, serde::Serialize)]
pub struct Health {
    pub running: bool,
    pub queue: crate::queue::QueueStats,
    pub workers_by_status: WorkerCounts,
    pub pending_acks: usize,
    pub overdue_acks: usize,
    pub dead_letters_unresolved: i64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerCounts {
    pub active: i64,
    pub stale: i64,
    pub offline: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CoordinatorStatus {
    pub running: bool,
    pub coordinator_name: String,
    pub workers_active: i64,
    pub workers_stale: i64,
    pub workers_offline: i64,
    pub messages_pending: i64,
    pub messages_delivered: i64,
    pub messages_acknowledged: i64,
    pub messages_failed: i64,
    pub messages_dead_letter: i64,
    pub dead_letters_unresolved: i64,
}

/// Wires every component together. Constructed once per process via
/// `Coordinator::new`, started with `start()`, torn down with `stop()`.
/// No component method here is valid before start or after stop
/// (spec.md §9 "Global state").
pub struct Coordinator {
    config: Config,
    messages_store: Store,
    workers_store: Store,
    claims_store: Store,
    dead_letters_store: Store,

    registry: Arc<WorkerRegistry>,
    heartbeats: Arc<HeartbeatManager>,
    stale_detector: RwLock<Option<Arc<StaleDetector>>>,
    queue: Arc<PriorityQueue>,
    ack_tracker: Arc<AckTracker>,
    claims: Arc<TaskClaimManager>,
    reassignment: Arc<Reassignment>,
    retry_handler: Arc<RetryHandler>,
    dead_letters: Arc<DeadLetterStore>,

    dispatcher: RwLock<HashMap<String, MessageHandler>>,
    running: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new(
        config: Config,
        messages_store: Store,
        workers_store: Store,
        claims_store: Store,
        dead_letters_store: Store,
        ready_task_command: String,
    ) -> Self {
        let registry = Arc::new(WorkerRegistry::new(workers_store.clone()));
        let heartbeats = Arc::new(HeartbeatManager::new(Duration::from_millis(config.heartbeat_interval_ms)));
        let queue = Arc::new(PriorityQueue::new(Duration::from_millis(config.escalation_timeout_ms)));
        let ack_tracker = Arc::new(AckTracker::new(messages_store.clone()));
        let claims = Arc::new(TaskClaimManager::new(
            claims_store.clone(),
            ready_task_command,
            config.namespace.clone(),
        ));
        let reassignment = Arc::new(Reassignment::new(claims.clone()));
        let retry_handler = Arc::new(RetryHandler::new(RetryConfig {
            backoff_schedule_ms: config.retry_backoff_ms.clone(),
            max_backoff_ms: config.max_backoff_ms,
            jitter_factor: config.jitter_factor,
            max_attempts: config.retry_max_attempts,
        }));
        let dead_letters = Arc::new(DeadLetterStore::new(dead_letters_store.clone()));

        Self {
            config,
            messages_store,
            workers_store,
            claims_store,
            dead_letters_store,
            registry,
            heartbeats,
            stale_detector: RwLock::new(None),
            queue,
            ack_tracker,
            claims,
            reassignment,
            retry_handler,
            dead_letters,
            dispatcher: RwLock::new(HashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers a handler for a message `type` tag (spec.md §9 "Dynamic
    /// dispatch on message types").
    pub async fn register_handler(&self, message_type: impl Into<String>, handler: MessageHandler) {
        self.dispatcher.write().await.insert(message_type.into(), handler);
    }

    /// Initializes each store's caches, sets `heartbeats running=true`,
    /// starts `StaleDetector` with a callback that invokes
    /// `Reassignment.reassign_from_worker(id)` (spec.md §4.12).
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> PtcResult<()> {
        self.claims.initialize().await?;
        self.heartbeats.start_all();

        let reassignment = self.reassignment.clone();
        let on_stale: crate::stale::OnStale = Arc::new(move |worker: Worker| {
            let reassignment = reassignment.clone();
            tokio::spawn(async move {
                if let Err(e) = reassignment.reassign_from_worker(&worker.id).await {
                    warn!(error = %e, worker_id = worker.id, "reassignment on stale failed");
                }
            });
        });

        let detector = Arc::new(StaleDetector::new(
            self.registry.clone(),
            Duration::from_millis(self.config.poll_interval_ms),
            self.config.stale_threshold_ms as i64,
            Some(on_stale),
        ));
        detector.start().await;
        *self.stale_detector.write().await = Some(detector);

        self.running.store(true, Ordering::SeqCst);
        info!("coordinator started");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop(&self) -> PtcResult<()> {
        self.running.store(false, Ordering::SeqCst);
        self.heartbeats.stop().await;
        if let Some(detector) = self.stale_detector.write().await.take() {
            detector.stop().await;
        }
        self.queue.close().await;
        self.ack_tracker.close().await;
        info!("coordinator stopped");
        Ok(())
    }

    fn require_started(&self) -> PtcResult<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PtcError::NotStarted)
        }
    }

    /// Constructs a canonical message; does not persist (spec.md §4.12).
    pub fn create_message(
        &self,
        message_type: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload: serde_json::Value,
        importance: Option<Importance>,
        correlation_id: Option<String>,
    ) -> Message {
        Message {
            id: new_message_id(&NewIdOptions {
                prefix: None,
                with_timestamp: true,
            }),
            message_type: message_type.into(),
            version: "1.0".to_string(),
            timestamp: crate::model::now_ms(),
            sender: sender.into(),
            recipient: recipient.into(),
            importance: importance.unwrap_or(Importance::Normal),
            payload,
            correlation_id,
            retry_count: 0,
            status: MessageStatus::Pending,
        }
    }

    /// `persistence.store_outgoing` -> `queue.enqueue` -> optionally
    /// `ack_tracker.register` (spec.md §4.12).
    pub async fn send(&self, msg: Message, register_ack: bool) -> PtcResult<SendResult> {
        self.require_started()?;
        let result = self.messages_store.store_outgoing(msg.clone()).await?;
        if !result.success {
            return Ok(SendResult {
                success: false,
                message_id: msg.id,
            });
        }

        self.queue.enqueue(msg.clone()).await;

        if register_ack {
            self.ack_tracker
                .register(
                    msg.id.clone(),
                    crate::ack::RegisterOptions {
                        sender: msg.sender.clone(),
                        recipient: if msg.is_broadcast() { None } else { Some(msg.recipient.clone()) },
                        timeout_ms: self.config.ack_timeout_ms as i64,
                    },
                    None,
                )
                .await;
        }

        Ok(SendResult {
            success: true,
            message_id: msg.id,
        })
    }

    /// `queue.dequeue` -> `persistence.mark_delivered` -> returns the message.
    pub async fn deliver_next(&self, _worker_id: &str) -> PtcResult<Option<Message>> {
        self.require_started()?;
        let Some(msg) = self.queue.dequeue().await else {
            return Ok(None);
        };
        self.messages_store.mark_delivered(msg.id.clone()).await?;
        Ok(Some(msg))
    }

    pub async fn acknowledge(&self, message_id: &str, acknowledger: &str) -> AckOutcome {
        self.ack_tracker.acknowledge(message_id, acknowledger).await
    }

    /// `persistence.mark_failed`; retries via RetryHandler's backoff if
    /// under budget, else dead-letters (spec.md §4.12).
    pub async fn handle_failure(&self, msg: &Message, error: &str) -> PtcResult<()> {
        self.require_started()?;
        self.messages_store.mark_failed(msg.id.clone(), error.to_string()).await?;

        if msg.retry_count < self.config.retry_max_attempts {
            let delay = self.retry_handler.calculate_backoff(msg.retry_count);
            tokio::time::sleep(delay).await;

            let mut retried = msg.clone();
            retried.retry_count += 1;
            retried.status = MessageStatus::Pending;
            self.queue.enqueue(retried).await;
        } else {
            let dl = self.dead_letters.store(msg, error).await?;
            info!(dl_id = dl.id, message_id = msg.id, "message dead-lettered after exhausting retries");
        }
        Ok(())
    }

    /// Dispatches a delivered message to its registered handler by `type` tag.
    pub async fn dispatch(&self, msg: &Message) -> PtcResult<()> {
        let handler = {
            let dispatcher = self.dispatcher.read().await;
            dispatcher.get(&msg.message_type).cloned()
        };
        match handler {
            Some(handler) => {
                if let Err(e) = handler(msg.clone()).await {
                    self.handle_failure(msg, &e).await?;
                }
                Ok(())
            }
            None => {
                warn!(message_type = msg.message_type, "no handler registered for message type");
                Ok(())
            }
        }
    }

    /// Aggregates worker, message, and config views (spec.md §4.12).
    pub async fn get_status(&self) -> PtcResult<CoordinatorStatus> {
        let worker_stats = self.registry.get_stats().await?;
        let message_stats = self.messages_store.get_stats().await?;
        let dl_stats = self.dead_letters.get_stats().await?;

        Ok(CoordinatorStatus {
            running: self.running.load(Ordering::SeqCst),
            coordinator_name: self.config.coordinator_name.clone(),
            workers_active: worker_stats.active,
            workers_stale: worker_stats.stale,
            workers_offline: worker_stats.offline,
            messages_pending: message_stats.pending,
            messages_delivered: message_stats.delivered,
            messages_acknowledged: message_stats.acknowledged,
            messages_failed: message_stats.failed,
            messages_dead_letter: message_stats.dead_letter,
            dead_letters_unresolved: dl_stats.unresolved,
        })
    }

    /// Cheaper snapshot than [`Coordinator::get_status`]: skips the message
    /// table scan and instead reports the in-memory queue/ack state, which
    /// is what an operator polling a liveness endpoint actually wants.
    pub async fn health(&self) -> PtcResult<Health> {
        let worker_stats = self.registry.get_stats().await?;
        let queue = self.queue.get_stats().await;
        let ack_stats = self.ack_tracker.get_stats().await;
        let dl_stats = self.dead_letters.get_stats().await?;

        Ok(Health {
            running: self.running.load(Ordering::SeqCst),
            queue,
            workers_by_status: WorkerCounts {
                active: worker_stats.active,
                stale: worker_stats.stale,
                offline: worker_stats.offline,
            },
            pending_acks: ack_stats.pending,
            overdue_acks: ack_stats.overdue,
            dead_letters_unresolved: dl_stats.unresolved,
        })
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn claims(&self) -> &Arc<TaskClaimManager> {
        &self.claims
    }

    pub fn reassignment(&self) -> &Arc<Reassignment> {
        &self.reassignment
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterStore> {
        &self.dead_letters
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    pub fn heartbeats(&self) -> &Arc<HeartbeatManager> {
        &self.heartbeats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    async fn new_test_coordinator() -> Arc<Coordinator> {
        let config = Config::default();
        Arc::new(Coordinator::new(
            config,
            Store::open_in_memory().unwrap(),
            Store::open_in_memory().unwrap(),
            Store::open_in_memory().unwrap(),
            Store::open_in_memory().unwrap(),
            "/bin/false".to_string(),
        ))
    }

    #[tokio::test]
    async fn operations_before_start_are_rejected() {
        let coordinator = new_test_coordinator().await;
        let msg = coordinator.create_message("work", "coordinator", "W1", serde_json::json!({}), None, None);
        let result = coordinator.send(msg, false).await;
        assert!(matches!(result, Err(PtcError::NotStarted)));
    }

    #[tokio::test]
    async fn happy_path_send_deliver_acknowledge() {
        let coordinator = new_test_coordinator().await;
        coordinator.start().await.unwrap();

        coordinator
            .registry()
            .register("W1".to_string(), "worker-one".to_string(), 1, BTreeSet::new())
            .await
            .unwrap();

        let msg = coordinator.create_message("work", "coordinator", "W1", serde_json::json!({}), Some(Importance::Normal), None);
        let msg_id = msg.id.clone();
        let send_result = coordinator.send(msg, false).await.unwrap();
        assert!(send_result.success);

        let delivered = coordinator.deliver_next("W1").await.unwrap().unwrap();
        assert_eq!(delivered.id, msg_id);

        let outcome = coordinator.acknowledge(&msg_id, "W1").await;
        assert_eq!(outcome, AckOutcome::Acknowledged);

        let stored = coordinator.messages_store.get_message(msg_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Acknowledged);
        assert_eq!(stored.retry_count, 0);

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn health_reflects_queue_and_worker_state() {
        let coordinator = new_test_coordinator().await;
        coordinator.start().await.unwrap();
        coordinator
            .registry()
            .register("W1".to_string(), "worker-one".to_string(), 1, BTreeSet::new())
            .await
            .unwrap();

        let msg = coordinator.create_message("work", "coordinator", "W1", serde_json::json!({}), Some(Importance::Normal), None);
        coordinator.send(msg, false).await.unwrap();

        let health = coordinator.health().await.unwrap();
        assert!(health.running);
        assert_eq!(health.queue.lengths[Importance::Normal.rank() as usize], 1);
        assert_eq!(health.workers_by_status.active, 1);
        assert_eq!(health.dead_letters_unresolved, 0);

        coordinator.stop().await.unwrap();
    }
}
