//! C7 — StaleDetector (spec.md §4.7): periodic scan marking workers stale
//! past `STALE_THRESHOLD_MS`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info};

use crate::error::PtcResult;
use crate::model::{Worker, WorkerStatus};
use crate::registry::WorkerRegistry;

pub type OnStale = Arc<dyn Fn(Worker) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DetectorStatus {
    pub running: bool,
    pub poll_interval_ms: u64,
    pub stale_threshold_ms: i64,
}

pub struct StaleDetector {
    registry: Arc<WorkerRegistry>,
    poll_interval: Duration,
    stale_threshold_ms: i64,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    on_stale: Option<OnStale>,
}

impl StaleDetector {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        poll_interval: Duration,
        stale_threshold_ms: i64,
        on_stale: Option<OnStale>,
    ) -> Self {
        Self {
            registry,
            poll_interval,
            stale_threshold_ms,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            on_stale,
        }
    }

    /// One scan pass: `registry.find_stale_workers(threshold)`, mark each
    /// `status=stale`, invoke `on_stale` (spec.md §4.7).
    pub async fn check(&self) -> PtcResult<Vec<Worker>> {
        let stale = self.registry.find_stale_workers(self.stale_threshold_ms).await?;
        for worker in &stale {
            self.registry.update_status(&worker.id, WorkerStatus::Stale).await?;
            if let Some(cb) = &self.on_stale {
                cb(worker.clone());
            }
        }
        Ok(stale)
    }

    pub async fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let this = self.clone();
        let mut interval = tokio::time::interval(this.poll_interval);
        let handle = tokio::spawn(async move {
            loop {
                interval.tick().await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = this.check().await {
                    error!(error = %e, "stale detector scan failed");
                }
            }
        });
        *self.handle.lock().await = Some(handle);
        info!("stale detector started");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }

    pub fn get_status(&self) -> DetectorStatus {
        DetectorStatus {
            running: self.running.load(Ordering::SeqCst),
            poll_interval_ms: self.poll_interval.as_millis() as u64,
            stale_threshold_ms: self.stale_threshold_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn check_marks_stale_and_invokes_callback() {
        let store = Store::open_in_memory().unwrap();
        let registry = Arc::new(WorkerRegistry::new(store));
        registry
            .register("W1".to_string(), "worker-one".to_string(), 1, BTreeSet::new())
            .await
            .unwrap();
        // force a stale heartbeat by writing directly through the store
        registry.heartbeat("W1").await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let detector = StaleDetector::new(
            registry.clone(),
            Duration::from_secs(10),
            -1, // any elapsed time counts as stale
            Some(Arc::new(move |_w| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );

        let stale = detector.check().await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let worker = registry.get("W1").await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Stale);
    }
}
