//! C6 — HeartbeatManager (spec.md §4.6): per-worker periodic emission.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::warn;

pub type HeartbeatFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ScheduleStatus {
    pub worker_id: String,
    pub running: bool,
}

struct Schedule {
    handle: JoinHandle<()>,
}

/// `running` is a global flag consulted by every active schedule; ticks
/// while paused are no-ops rather than cancellations (spec.md §4.6).
pub struct HeartbeatManager {
    interval: Duration,
    running: Arc<AtomicBool>,
    schedules: Arc<Mutex<HashMap<String, Schedule>>>,
}

impl HeartbeatManager {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            running: Arc::new(AtomicBool::new(false)),
            schedules: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedules `heartbeat_fn` every `interval` after an initial eager call.
    pub async fn start_heartbeat(&self, worker_id: String, heartbeat_fn: HeartbeatFn) {
        self.stop_heartbeat(&worker_id).await;

        let running = self.running.clone();
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            heartbeat_fn().await;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; already emitted eagerly above
            loop {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    continue;
                }
                heartbeat_fn().await;
            }
        });

        let mut guard = self.schedules.lock().await;
        guard.insert(worker_id, Schedule { handle });
    }

    pub async fn stop_heartbeat(&self, worker_id: &str) {
        let mut guard = self.schedules.lock().await;
        if let Some(schedule) = guard.remove(worker_id) {
            schedule.handle.abort();
        }
    }

    pub fn start_all(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop_all(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn get_status(&self) -> Vec<ScheduleStatus> {
        let guard = self.schedules.lock().await;
        let running = self.running.load(Ordering::SeqCst);
        guard
            .keys()
            .map(|id| ScheduleStatus {
                worker_id: id.clone(),
                running,
            })
            .collect()
    }

    pub async fn stop(&self) {
        self.stop_all();
        let mut guard = self.schedules.lock().await;
        for (_, schedule) in guard.drain() {
            schedule.handle.abort();
        }
    }
}

/// Wraps a fallible heartbeat emission so a failure is logged, never
/// cancels the schedule (spec.md §4.6).
pub fn logged(worker_id: String, f: impl Fn() -> Pin<Box<dyn Future<Output = PtcHeartbeatResult> + Send>> + Send + Sync + 'static) -> HeartbeatFn {
    Arc::new(move || {
        let worker_id = worker_id.clone();
        let fut = f();
        Box::pin(async move {
            if let Err(e) = fut.await {
                warn!(worker_id, error = %e, "heartbeat emission failed");
            }
        })
    })
}

pub type PtcHeartbeatResult = Result<(), crate::error::PtcError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn start_all_enables_ticks() {
        let manager = HeartbeatManager::new(Duration::from_millis(15));
        manager.start_all();
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();
        manager
            .start_heartbeat(
                "W1".to_string(),
                Arc::new(move || {
                    let count = count_clone.clone();
                    Box::pin(async move {
                        count.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        manager.stop_heartbeat("W1").await;
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn stop_all_pauses_ticks_without_cancelling_schedule() {
        let manager = HeartbeatManager::new(Duration::from_millis(15));
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = count.clone();
        manager
            .start_heartbeat(
                "W1".to_string(),
                Arc::new(move || {
                    let count = count_clone.clone();
                    Box::pin(async move {
                        count.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .await;
        // eager call happened, nothing scheduled yet because start_all was never called
        tokio::time::sleep(Duration::from_millis(80)).await;
        let after_pause = count.load(Ordering::SeqCst);
        assert_eq!(after_pause, 1); // only the eager call

        manager.stop_heartbeat("W1").await;
    }
}
