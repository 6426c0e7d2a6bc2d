//! C4 — AckTracker (spec.md §4.4): per-message acknowledgment tracking
//! with timeouts.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::error;

use crate::model::now_ms;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct RegisterOptions {
    pub sender: String,
    pub recipient: Option<String>,
    pub timeout_ms: i64,
}

pub struct PendingAck {
    pub message_id: String,
    pub sender: String,
    pub recipient: Option<String>,
    pub registered_at: i64,
    pub timeout_at: Option<i64>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AckOutcome {
    Acknowledged,
    NotFound,
    AlreadyAcknowledged,
    NotRecipient,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct AckStats {
    pub pending: usize,
    pub overdue: usize,
    pub total_registered: u64,
}

struct Entry {
    ack: PendingAck,
    timer: Option<JoinHandle<()>>,
}

/// Invoked with the message id of an ack that timed out unacknowledged.
pub type OnTimeout = Arc<dyn Fn(String) + Send + Sync>;

pub struct AckTracker {
    store: Store,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    registered_count: Arc<Mutex<u64>>,
}

impl AckTracker {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            entries: Arc::new(Mutex::new(HashMap::new())),
            registered_count: Arc::new(Mutex::new(0)),
        }
    }

    pub async fn register(&self, message_id: String, opts: RegisterOptions, on_timeout: Option<OnTimeout>) {
        let registered_at = now_ms();
        let timeout_at = if opts.timeout_ms > 0 {
            Some(registered_at + opts.timeout_ms)
        } else {
            None
        };

        let ack = PendingAck {
            message_id: message_id.clone(),
            sender: opts.sender,
            recipient: opts.recipient,
            registered_at,
            timeout_at,
            acknowledged: false,
            acknowledged_at: None,
        };

        let timer = if opts.timeout_ms > 0 {
            let entries = self.entries.clone();
            let id_for_timer = message_id.clone();
            Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(opts.timeout_ms as u64)).await;
                let mut guard = entries.lock().await;
                if let Some(entry) = guard.remove(&id_for_timer) {
                    if !entry.ack.acknowledged {
                        if let Some(cb) = on_timeout {
                            cb(id_for_timer);
                        }
                    }
                }
            }))
        } else {
            None
        };

        let mut guard = self.entries.lock().await;
        guard.insert(message_id, Entry { ack, timer });
        drop(guard);
        *self.registered_count.lock().await += 1;
    }

    /// `not_found`, `already_acknowledged`, `not_recipient`, or success per
    /// spec.md §4.4. On success, best-effort persists the ack but keeps the
    /// entry in the map (marked `acknowledged`) so a repeat call observes
    /// `already_acknowledged` rather than `not_found`; [`AckTracker::reap`]
    /// is the path that actually drops acknowledged entries.
    pub async fn acknowledge(&self, message_id: &str, acknowledger: &str) -> AckOutcome {
        let mut guard = self.entries.lock().await;
        let Some(entry) = guard.get_mut(message_id) else {
            return AckOutcome::NotFound;
        };
        if entry.ack.acknowledged {
            return AckOutcome::AlreadyAcknowledged;
        }
        if let Some(recipient) = &entry.ack.recipient {
            if recipient != acknowledger {
                return AckOutcome::NotRecipient;
            }
        }

        entry.ack.acknowledged = true;
        entry.ack.acknowledged_at = Some(now_ms());
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        drop(guard);

        if let Err(e) = self
            .store
            .acknowledge(message_id.to_string(), acknowledger.to_string())
            .await
        {
            error!(error = %e, message_id, "best-effort persistence acknowledge failed");
        }

        AckOutcome::Acknowledged
    }

    /// Drops entries already marked `acknowledged`, aborting any leftover
    /// timer handles. The GC path for entries `acknowledge` intentionally
    /// leaves behind; callers run this periodically rather than on every
    /// acknowledge, so a duplicate ack arriving immediately after the first
    /// still observes `already_acknowledged`.
    pub async fn reap(&self) -> usize {
        let mut guard = self.entries.lock().await;
        let done: Vec<String> = guard
            .iter()
            .filter(|(_, e)| e.ack.acknowledged)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &done {
            if let Some(entry) = guard.remove(id) {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
            }
        }
        done.len()
    }

    pub async fn is_pending(&self, message_id: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(message_id)
            .is_some_and(|entry| !entry.ack.acknowledged)
    }

    pub async fn get_pending(
        &self,
        sender: Option<&str>,
        recipient: Option<&str>,
        overdue_only: bool,
    ) -> Vec<String> {
        let now = now_ms();
        let guard = self.entries.lock().await;
        guard
            .values()
            .filter(|entry| {
                if entry.ack.acknowledged {
                    return false;
                }
                if let Some(sender) = sender {
                    if entry.ack.sender != sender {
                        return false;
                    }
                }
                if let Some(recipient) = recipient {
                    if entry.ack.recipient.as_deref() != Some(recipient) {
                        return false;
                    }
                }
                if overdue_only {
                    match entry.ack.timeout_at {
                        Some(t) => now > t,
                        None => return false,
                    }
                } else {
                    true
                }
            })
            .map(|entry| entry.ack.message_id.clone())
            .collect()
    }

    pub async fn get_stats(&self) -> AckStats {
        let now = now_ms();
        let guard = self.entries.lock().await;
        let pending = guard.values().filter(|e| !e.ack.acknowledged).count();
        let overdue = guard
            .values()
            .filter(|e| !e.ack.acknowledged && matches!(e.ack.timeout_at, Some(t) if now > t))
            .count();
        drop(guard);
        let total_registered = *self.registered_count.lock().await;
        AckStats {
            pending,
            overdue,
            total_registered,
        }
    }

    pub async fn cancel(&self, message_id: &str) -> bool {
        let mut guard = self.entries.lock().await;
        if let Some(entry) = guard.remove(message_id) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            true
        } else {
            false
        }
    }

    pub async fn clear(&self) {
        let mut guard = self.entries.lock().await;
        for (_, entry) in guard.drain() {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }

    pub async fn close(&self) {
        self.clear().await;
    }
}
