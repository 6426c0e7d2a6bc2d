//! C5 — WorkerRegistry (spec.md §4.5): a thin facade over the `workers`
//! table. The store is authoritative; this type carries no cache of its
//! own, consistent with spec.md §5's "store is authoritative, re-reads on
//! boot".

use std::collections::BTreeSet;

use crate::error::PtcResult;
use crate::model::{Worker, WorkerStatus};
use crate::store::workers::WorkerStats;
use crate::store::Store;

pub struct WorkerRegistry {
    store: Store,
}

impl WorkerRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn register(
        &self,
        id: String,
        name: String,
        pid: i64,
        capabilities: BTreeSet<String>,
    ) -> PtcResult<Worker> {
        let worker = Worker {
            id,
            name,
            pid,
            capabilities,
            status: WorkerStatus::Active,
            last_heartbeat: crate::model::now_ms(),
        };
        self.store.register_worker(worker.clone()).await?;
        Ok(worker)
    }

    pub async fn unregister(&self, id: &str) -> PtcResult<bool> {
        self.store.unregister_worker(id.to_string()).await
    }

    /// Atomic update of `last_heartbeat` and `status=active` (spec.md §4.5).
    pub async fn heartbeat(&self, id: &str) -> PtcResult<bool> {
        self.store.heartbeat_worker(id.to_string()).await
    }

    pub async fn get(&self, id: &str) -> PtcResult<Option<Worker>> {
        self.store.get_worker(id.to_string()).await
    }

    pub async fn list(&self, status: Option<WorkerStatus>) -> PtcResult<Vec<Worker>> {
        self.store.list_workers(status).await
    }

    pub async fn find_stale_workers(&self, threshold_ms: i64) -> PtcResult<Vec<Worker>> {
        self.store.find_stale_workers(threshold_ms).await
    }

    pub async fn update_status(&self, id: &str, status: WorkerStatus) -> PtcResult<bool> {
        self.store.update_worker_status(id.to_string(), status).await
    }

    pub async fn get_stats(&self) -> PtcResult<WorkerStats> {
        self.store.worker_stats().await
    }
}
