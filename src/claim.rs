//! C8 — TaskClaim (spec.md §4.8): the core atomic handoff.
//!
//! `pending_claims` mirrors `status=active` rows and is populated at
//! `initialize()`; it is consulted before the store round-trip so repeat
//! contention on a hot task doesn't all reach the database.

use dashmap::DashSet;
use serde::Serialize;
use std::sync::Arc;

use crate::error::PtcResult;
use crate::model::TaskClaim;
use crate::ready_task::{invoke, ReadyTaskOutcome};
use crate::store::claims::ClaimOutcome as StoreClaimOutcome;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ClaimOutcome {
    Claimed { task_id: String, worker_id: String, claimed_at: i64 },
    WorkerTaskLimitReached,
    NoReadyTasks,
    TaskAlreadyClaimed,
    AlreadyClaimed,
    ClaimRaceCondition,
}

pub struct TaskClaimManager {
    store: Store,
    pending_claims: Arc<DashSet<String>>,
    ready_task_command: String,
    namespace: String,
}

impl TaskClaimManager {
    pub fn new(store: Store, ready_task_command: String, namespace: String) -> Self {
        Self {
            store,
            pending_claims: Arc::new(DashSet::new()),
            ready_task_command,
            namespace,
        }
    }

    /// Populates `pending_claims` from the store's active rows.
    pub async fn initialize(&self) -> PtcResult<()> {
        let active = self.store.list_active_claims().await?;
        for claim in active {
            self.pending_claims.insert(claim.task_id);
        }
        Ok(())
    }

    /// The full algorithm from spec.md §4.8.
    pub async fn claim(&self, worker_id: &str, max_tasks: usize, worker_active_claims: usize) -> PtcResult<ClaimOutcome> {
        if worker_active_claims >= max_tasks {
            return Ok(ClaimOutcome::WorkerTaskLimitReached);
        }

        let task_id = match invoke(&self.ready_task_command, &self.namespace).await {
            ReadyTaskOutcome::Ready(id) => id,
            ReadyTaskOutcome::NoReadyTasks => return Ok(ClaimOutcome::NoReadyTasks),
        };

        if self.pending_claims.contains(&task_id) {
            return Ok(ClaimOutcome::TaskAlreadyClaimed);
        }

        match self.store.try_claim(task_id.clone(), worker_id.to_string()).await? {
            StoreClaimOutcome::Claimed(claim) => {
                self.pending_claims.insert(task_id.clone());
                Ok(ClaimOutcome::Claimed {
                    task_id,
                    worker_id: claim.worker_id,
                    claimed_at: claim.claimed_at,
                })
            }
            StoreClaimOutcome::AlreadyClaimed => Ok(ClaimOutcome::AlreadyClaimed),
            StoreClaimOutcome::RaceCondition => Ok(ClaimOutcome::ClaimRaceCondition),
        }
    }

    /// Only the claim owner may release.
    pub async fn release(&self, task_id: &str, worker_id: &str) -> PtcResult<bool> {
        let released = self.store.release_claim(task_id.to_string(), worker_id.to_string()).await?;
        if released {
            self.pending_claims.remove(task_id);
        }
        Ok(released)
    }

    pub async fn get_worker_claims(&self, worker_id: &str) -> PtcResult<Vec<TaskClaim>> {
        self.store.get_worker_claims(worker_id.to_string()).await
    }

    /// Same query as `get_worker_claims`; the semantic difference is only
    /// in the caller (spec.md §4.8).
    pub async fn get_abandoned_tasks(&self, worker_id: &str) -> PtcResult<Vec<TaskClaim>> {
        self.store.get_worker_claims(worker_id.to_string()).await
    }

    /// Deletes the row; after this, the ready-task source may re-surface
    /// the task id, enabling a fresh claim.
    pub async fn mark_for_reassignment(&self, task_id: &str) -> PtcResult<bool> {
        let deleted = self.store.mark_for_reassignment(task_id.to_string()).await?;
        self.pending_claims.remove(task_id);
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn worker_over_limit_is_rejected_before_invoking_ready_task_source() {
        let store = Store::open_in_memory().unwrap();
        let manager = TaskClaimManager::new(store, "/bin/false".to_string(), "ptc".to_string());
        let outcome = manager.claim("W1", 1, 1).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::WorkerTaskLimitReached);
    }

    #[tokio::test]
    async fn no_ready_task_source_yields_no_ready_tasks() {
        let store = Store::open_in_memory().unwrap();
        // /bin/false exits nonzero with empty stdout -> treated as no ready tasks
        let manager = TaskClaimManager::new(store, "/bin/false".to_string(), "ptc".to_string());
        let outcome = manager.claim("W1", 5, 0).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::NoReadyTasks);
    }

    #[tokio::test]
    async fn mark_for_reassignment_then_release_is_noop() {
        let store = Store::open_in_memory().unwrap();
        let manager = TaskClaimManager::new(store.clone(), "/bin/false".to_string(), "ptc".to_string());
        store.try_claim("T1".to_string(), "W1".to_string()).await.unwrap();
        manager.initialize().await.unwrap();

        assert!(manager.mark_for_reassignment("T1").await.unwrap());
        assert!(!manager.release("T1", "W1").await.unwrap());
    }
}
