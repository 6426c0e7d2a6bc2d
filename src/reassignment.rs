//! C9 — Reassignment (spec.md §4.9): return claims abandoned by stale
//! workers to the pool.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::claim::TaskClaimManager;
use crate::error::PtcResult;
use crate::model::now_ms;

#[derive(Debug, Clone, Serialize)]
pub struct ReassignmentRecord {
    pub task_id: String,
    pub from_worker: String,
    pub reassigned_at: i64,
    pub status: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ReassignmentStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
}

pub struct Reassignment {
    claims: Arc<TaskClaimManager>,
    history: Arc<Mutex<Vec<ReassignmentRecord>>>,
}

impl Reassignment {
    pub fn new(claims: Arc<TaskClaimManager>) -> Self {
        Self {
            claims,
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fetches the worker's abandoned tasks, marks each for reassignment,
    /// and records a history entry per task (spec.md §4.9).
    pub async fn reassign_from_worker(&self, worker_id: &str) -> PtcResult<Vec<ReassignmentRecord>> {
        let abandoned = self.claims.get_abandoned_tasks(worker_id).await?;
        let mut records = Vec::with_capacity(abandoned.len());

        for claim in abandoned {
            let record = match self.claims.mark_for_reassignment(&claim.task_id).await {
                Ok(true) => ReassignmentRecord {
                    task_id: claim.task_id.clone(),
                    from_worker: worker_id.to_string(),
                    reassigned_at: now_ms(),
                    status: "success".to_string(),
                    error: None,
                },
                Ok(false) => ReassignmentRecord {
                    task_id: claim.task_id.clone(),
                    from_worker: worker_id.to_string(),
                    reassigned_at: now_ms(),
                    status: "not_found".to_string(),
                    error: None,
                },
                Err(e) => {
                    error!(error = %e, task_id = claim.task_id, "reassignment failed");
                    ReassignmentRecord {
                        task_id: claim.task_id.clone(),
                        from_worker: worker_id.to_string(),
                        reassigned_at: now_ms(),
                        status: "error".to_string(),
                        error: Some(e.to_string()),
                    }
                }
            };
            records.push(record);
        }

        info!(worker_id, count = records.len(), "reassigned abandoned claims");
        let mut history = self.history.lock().await;
        history.extend(records.clone());
        Ok(records)
    }

    /// Manual operator-triggered reassignment of a single task.
    pub async fn reassign_task(&self, task_id: &str, reason: &str) -> PtcResult<ReassignmentRecord> {
        let deleted = self.claims.mark_for_reassignment(task_id).await?;
        let record = ReassignmentRecord {
            task_id: task_id.to_string(),
            from_worker: "manual".to_string(),
            reassigned_at: now_ms(),
            status: if deleted { "success".to_string() } else { "not_found".to_string() },
            error: if deleted { None } else { Some(reason.to_string()) },
        };
        self.history.lock().await.push(record.clone());
        Ok(record)
    }

    pub async fn get_history(&self, limit: usize, worker_id: Option<&str>) -> Vec<ReassignmentRecord> {
        let history = self.history.lock().await;
        history
            .iter()
            .rev()
            .filter(|r| worker_id.map(|w| r.from_worker == w).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get_stats(&self) -> ReassignmentStats {
        let history = self.history.lock().await;
        let total = history.len();
        let succeeded = history.iter().filter(|r| r.status == "success").count();
        ReassignmentStats {
            total,
            succeeded,
            failed: total - succeeded,
            success_rate: if total == 0 { 0.0 } else { succeeded as f64 / total as f64 },
        }
    }
}
