//! Task-claims table operations backing C8 TaskClaim (spec.md §4.8).
//!
//! The transaction in `try_claim` is the single cross-process atomic the
//! spec calls out (§5 "Atomicity"): the PRIMARY KEY on `task_id` is the
//! sole arbiter of who wins, never a timestamp comparison.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::PtcResult;
use crate::model::{ClaimStatus, TaskClaim};

use super::Store;

/// Outcome of a claim attempt at the store layer. Spec.md §4.8 distinguishes
/// an existing row found before the transaction (`AlreadyClaimed`) from a
/// collision discovered only inside it (`RaceCondition`) — both are
/// expected contention, not `PtcError`.
pub enum ClaimOutcome {
    Claimed(TaskClaim),
    AlreadyClaimed,
    RaceCondition,
}

fn row_to_claim(row: &Row) -> rusqlite::Result<TaskClaim> {
    let status: String = row.get("status")?;
    let metadata: String = row.get("metadata")?;
    Ok(TaskClaim {
        task_id: row.get("task_id")?,
        worker_id: row.get("worker_id")?,
        status: ClaimStatus::from_str(&status).unwrap_or(ClaimStatus::Active),
        claimed_at: row.get("claimed_at")?,
        completed_at: row.get("completed_at")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

impl Store {
    /// Step 4 of the `claim` algorithm (spec.md §4.8): within one
    /// transaction, check for any existing row (any status), then insert.
    pub async fn try_claim(&self, task_id: String, worker_id: String) -> PtcResult<ClaimOutcome> {
        self.run(move |conn: &Connection| {
            let tx = conn.unchecked_transaction()?;
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM task_claims WHERE task_id=?1",
                    params![task_id],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                tx.rollback()?;
                return Ok(ClaimOutcome::AlreadyClaimed);
            }

            let now = crate::model::now_ms();
            let insert = tx.execute(
                "INSERT INTO task_claims (task_id, worker_id, status, claimed_at, metadata)
                 VALUES (?1, ?2, 'active', ?3, '{}')",
                params![task_id, worker_id, now],
            );

            match insert {
                Ok(_) => {
                    tx.commit()?;
                    Ok(ClaimOutcome::Claimed(TaskClaim {
                        task_id,
                        worker_id,
                        status: ClaimStatus::Active,
                        claimed_at: now,
                        completed_at: None,
                        metadata: serde_json::Value::Object(Default::default()),
                    }))
                }
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    tx.rollback()?;
                    Ok(ClaimOutcome::RaceCondition)
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    pub async fn release_claim(&self, task_id: String, worker_id: String) -> PtcResult<bool> {
        self.run(move |conn: &Connection| {
            let now = crate::model::now_ms();
            let changed = conn.execute(
                "UPDATE task_claims SET status='completed', completed_at=?1 WHERE task_id=?2 AND worker_id=?3 AND status='active'",
                params![now, task_id, worker_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn get_worker_claims(&self, worker_id: String) -> PtcResult<Vec<TaskClaim>> {
        self.run(move |conn: &Connection| {
            let mut stmt = conn.prepare(
                "SELECT * FROM task_claims WHERE worker_id=?1 AND status='active' ORDER BY claimed_at ASC",
            )?;
            let rows = stmt
                .query_map(params![worker_id], row_to_claim)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// `mark_for_reassignment`: deletes the row so the ready-task source may
    /// re-surface the task id (spec.md §4.8).
    pub async fn mark_for_reassignment(&self, task_id: String) -> PtcResult<bool> {
        self.run(move |conn: &Connection| {
            let changed = conn.execute("DELETE FROM task_claims WHERE task_id=?1", params![task_id])?;
            Ok(changed > 0)
        })
        .await
    }

    /// All active claims, used to populate the `pending_claims` in-memory
    /// cache at startup (spec.md §4.8).
    pub async fn list_active_claims(&self) -> PtcResult<Vec<TaskClaim>> {
        self.run(|conn: &Connection| {
            let mut stmt = conn.prepare("SELECT * FROM task_claims WHERE status='active'")?;
            let rows = stmt.query_map([], row_to_claim)?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}
