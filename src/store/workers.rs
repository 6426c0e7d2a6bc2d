//! Worker table operations backing C5 WorkerRegistry (spec.md §4.5).

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::PtcResult;
use crate::model::{Worker, WorkerStatus};

use super::Store;

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub active: i64,
    pub stale: i64,
    pub offline: i64,
}

fn row_to_worker(row: &Row) -> rusqlite::Result<Worker> {
    let capabilities: String = row.get("capabilities")?;
    let status: String = row.get("status")?;
    Ok(Worker {
        id: row.get("id")?,
        name: row.get("name")?,
        pid: row.get("pid")?,
        capabilities: serde_json::from_str::<BTreeSet<String>>(&capabilities).unwrap_or_default(),
        status: WorkerStatus::from_str(&status).unwrap_or(WorkerStatus::Offline),
        last_heartbeat: row.get("last_heartbeat")?,
    })
}

impl Store {
    pub async fn register_worker(&self, worker: Worker) -> PtcResult<()> {
        self.run(move |conn: &Connection| {
            let capabilities = serde_json::to_string(&worker.capabilities)?;
            conn.execute(
                "INSERT INTO workers (id, name, pid, capabilities, status, last_heartbeat)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET name=excluded.name, pid=excluded.pid,
                     capabilities=excluded.capabilities, status=excluded.status,
                     last_heartbeat=excluded.last_heartbeat",
                params![
                    worker.id,
                    worker.name,
                    worker.pid,
                    capabilities,
                    worker.status.as_str(),
                    worker.last_heartbeat,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn unregister_worker(&self, id: String) -> PtcResult<bool> {
        self.run(move |conn: &Connection| {
            let changed = conn.execute(
                "UPDATE workers SET status='offline' WHERE id=?1",
                params![id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn heartbeat_worker(&self, id: String) -> PtcResult<bool> {
        self.run(move |conn: &Connection| {
            let now = crate::model::now_ms();
            let changed = conn.execute(
                "UPDATE workers SET last_heartbeat=?1, status='active' WHERE id=?2",
                params![now, id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn get_worker(&self, id: String) -> PtcResult<Option<Worker>> {
        self.run(move |conn: &Connection| {
            let worker = conn
                .query_row("SELECT * FROM workers WHERE id=?1", params![id], row_to_worker)
                .optional()?;
            Ok(worker)
        })
        .await
    }

    pub async fn list_workers(&self, status: Option<WorkerStatus>) -> PtcResult<Vec<Worker>> {
        self.run(move |conn: &Connection| {
            let workers = match status {
                Some(status) => {
                    let mut stmt = conn.prepare("SELECT * FROM workers WHERE status=?1 ORDER BY id")?;
                    let rows = stmt
                        .query_map(params![status.as_str()], row_to_worker)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare("SELECT * FROM workers ORDER BY id")?;
                    let rows = stmt.query_map([], row_to_worker)?.collect::<Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(workers)
        })
        .await
    }

    /// `now - last_heartbeat > threshold_ms AND status='active'`, per spec.md §4.5.
    pub async fn find_stale_workers(&self, threshold_ms: i64) -> PtcResult<Vec<Worker>> {
        self.run(move |conn: &Connection| {
            let cutoff = crate::model::now_ms() - threshold_ms;
            let mut stmt = conn.prepare(
                "SELECT * FROM workers WHERE status='active' AND last_heartbeat < ?1",
            )?;
            let rows = stmt
                .query_map(params![cutoff], row_to_worker)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn update_worker_status(&self, id: String, status: WorkerStatus) -> PtcResult<bool> {
        self.run(move |conn: &Connection| {
            let changed = conn.execute(
                "UPDATE workers SET status=?1 WHERE id=?2",
                params![status.as_str(), id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn worker_stats(&self) -> PtcResult<WorkerStats> {
        self.run(|conn: &Connection| {
            let mut by_status: BTreeMap<String, i64> = BTreeMap::new();
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM workers GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                by_status.insert(status, count);
            }
            Ok(WorkerStats {
                active: *by_status.get("active").unwrap_or(&0),
                stale: *by_status.get("stale").unwrap_or(&0),
                offline: *by_status.get("offline").unwrap_or(&0),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_worker(id: &str) -> Worker {
        Worker {
            id: id.to_string(),
            name: format!("worker-{id}"),
            pid: 1234,
            capabilities: BTreeSet::new(),
            status: WorkerStatus::Active,
            last_heartbeat: crate::model::now_ms(),
        }
    }

    #[tokio::test]
    async fn register_and_get_round_trips() {
        let store = Store::open_in_memory().unwrap();
        store.register_worker(sample_worker("W1")).await.unwrap();
        let fetched = store.get_worker("W1".to_string()).await.unwrap().unwrap();
        assert_eq!(fetched.name, "worker-W1");
    }

    #[tokio::test]
    async fn find_stale_workers_respects_threshold() {
        let store = Store::open_in_memory().unwrap();
        let mut worker = sample_worker("W1");
        worker.last_heartbeat = crate::model::now_ms() - 200_000;
        store.register_worker(worker).await.unwrap();

        let stale = store.find_stale_workers(90_000).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "W1");
    }

    #[tokio::test]
    async fn unregister_marks_offline() {
        let store = Store::open_in_memory().unwrap();
        store.register_worker(sample_worker("W1")).await.unwrap();
        store.unregister_worker("W1".to_string()).await.unwrap();
        let fetched = store.get_worker("W1".to_string()).await.unwrap().unwrap();
        assert_eq!(fetched.status, WorkerStatus::Offline);
    }
}
