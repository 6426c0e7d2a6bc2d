//! Dead-letters table operations backing C11 DeadLetter (spec.md §4.11).

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::PtcResult;
use crate::model::{DeadLetter, DeadLetterResolution, Importance};

use super::Store;

#[derive(Debug, Clone, Default)]
pub struct DeadLetterListParams {
    pub unresolved: Option<bool>,
    pub limit: i64,
    pub offset: i64,
    pub sender: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterStats {
    pub total: i64,
    pub unresolved: i64,
    pub resolved: i64,
}

fn row_to_dead_letter(row: &Row) -> rusqlite::Result<DeadLetter> {
    let content: String = row.get("content")?;
    let importance: String = row.get("importance")?;
    let resolution: Option<String> = row.get("resolution")?;
    Ok(DeadLetter {
        id: row.get("id")?,
        original_message_id: row.get("original_message_id")?,
        sender: row.get("sender")?,
        recipient: row.get("recipient")?,
        content: serde_json::from_str(&content).unwrap_or(serde_json::Value::Null),
        importance: Importance::from_str_lenient(&importance),
        message_type: row.get("type")?,
        error: row.get("error")?,
        failed_at: row.get("failed_at")?,
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        resolved: row.get::<_, i64>("resolved")? != 0,
        resolved_at: row.get("resolved_at")?,
        resolution: resolution.and_then(|r| DeadLetterResolution::from_str(&r)),
        next_retry_at: row.get("next_retry_at")?,
    })
}

impl Store {
    pub async fn insert_dead_letter(&self, dl: DeadLetter) -> PtcResult<()> {
        self.run(move |conn: &Connection| {
            let content = serde_json::to_string(&dl.content)?;
            conn.execute(
                "INSERT INTO dead_letters (id, original_message_id, sender, recipient, content, importance, type, error, failed_at, retry_count, resolved)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
                params![
                    dl.id,
                    dl.original_message_id,
                    dl.sender,
                    dl.recipient,
                    content,
                    dl.importance.as_str(),
                    dl.message_type,
                    dl.error,
                    dl.failed_at,
                    dl.retry_count,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_dead_letter(&self, id: String) -> PtcResult<Option<DeadLetter>> {
        self.run(move |conn: &Connection| {
            let dl = conn
                .query_row("SELECT * FROM dead_letters WHERE id=?1", params![id], row_to_dead_letter)
                .optional()?;
            Ok(dl)
        })
        .await
    }

    pub async fn list_dead_letters(&self, filter: DeadLetterListParams) -> PtcResult<Vec<DeadLetter>> {
        self.run(move |conn: &Connection| {
            let mut sql = "SELECT * FROM dead_letters WHERE 1=1".to_string();
            let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(unresolved) = filter.unresolved {
                sql.push_str(" AND resolved=?");
                bound.push(Box::new(if unresolved { 0 } else { 1 }));
            }
            if let Some(sender) = &filter.sender {
                sql.push_str(" AND sender=?");
                bound.push(Box::new(sender.clone()));
            }
            sql.push_str(" ORDER BY failed_at DESC LIMIT ? OFFSET ?");
            bound.push(Box::new(filter.limit));
            bound.push(Box::new(filter.offset));

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
            let rows = stmt
                .query_map(params.as_slice(), row_to_dead_letter)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// `resolved=0 AND (next_retry_at IS NULL OR next_retry_at <= now)`, per spec.md §4.11.
    pub async fn get_due_for_retry(&self, limit: i64) -> PtcResult<Vec<DeadLetter>> {
        self.run(move |conn: &Connection| {
            let now = crate::model::now_ms();
            let mut stmt = conn.prepare(
                "SELECT * FROM dead_letters WHERE resolved=0 AND (next_retry_at IS NULL OR next_retry_at <= ?1) ORDER BY failed_at ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![now, limit], row_to_dead_letter)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Terminal per spec.md §4.11: a second `resolve` on an already-resolved
    /// row is a no-op (`changes() == 0`), matching the idempotence law in §8.
    pub async fn resolve_dead_letter(&self, id: String, resolution: DeadLetterResolution) -> PtcResult<bool> {
        self.run(move |conn: &Connection| {
            let now = crate::model::now_ms();
            let changed = conn.execute(
                "UPDATE dead_letters SET resolved=1, resolved_at=?1, resolution=?2 WHERE id=?3 AND resolved=0",
                params![now, resolution.as_str(), id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn update_retry_count(&self, id: String, retry_count: u32) -> PtcResult<bool> {
        self.run(move |conn: &Connection| {
            let changed = conn.execute(
                "UPDATE dead_letters SET retry_count=?1 WHERE id=?2",
                params![retry_count, id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn schedule_retry(&self, id: String, delay_ms: i64) -> PtcResult<bool> {
        self.run(move |conn: &Connection| {
            let next_retry_at = crate::model::now_ms() + delay_ms;
            let changed = conn.execute(
                "UPDATE dead_letters SET next_retry_at=?1 WHERE id=?2 AND resolved=0",
                params![next_retry_at, id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn dead_letter_stats(&self) -> PtcResult<DeadLetterStats> {
        self.run(|conn: &Connection| {
            let total: i64 = conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
            let unresolved: i64 = conn.query_row(
                "SELECT COUNT(*) FROM dead_letters WHERE resolved=0",
                [],
                |row| row.get(0),
            )?;
            Ok(DeadLetterStats {
                total,
                unresolved,
                resolved: total - unresolved,
            })
        })
        .await
    }

    pub async fn batch_resolve(&self, ids: Vec<String>, resolution: DeadLetterResolution) -> PtcResult<u64> {
        self.run(move |conn: &Connection| {
            let now = crate::model::now_ms();
            let mut changed = 0u64;
            for id in ids {
                changed += conn.execute(
                    "UPDATE dead_letters SET resolved=1, resolved_at=?1, resolution=?2 WHERE id=?3 AND resolved=0",
                    params![now, resolution.as_str(), id],
                )? as u64;
            }
            Ok(changed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dl(message_id: &str) -> DeadLetter {
        DeadLetter {
            id: DeadLetter::id_for(message_id),
            original_message_id: message_id.to_string(),
            sender: "coordinator".to_string(),
            recipient: "W1".to_string(),
            content: serde_json::json!({}),
            importance: Importance::Normal,
            message_type: "work".to_string(),
            error: "boom".to_string(),
            failed_at: crate::model::now_ms(),
            retry_count: 3,
            resolved: false,
            resolved_at: None,
            resolution: None,
            next_retry_at: None,
        }
    }

    #[tokio::test]
    async fn resolve_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.insert_dead_letter(sample_dl("m1")).await.unwrap();
        let id = DeadLetter::id_for("m1");

        let first = store
            .resolve_dead_letter(id.clone(), DeadLetterResolution::Skipped)
            .await
            .unwrap();
        assert!(first);

        let second = store
            .resolve_dead_letter(id, DeadLetterResolution::Skipped)
            .await
            .unwrap();
        assert!(!second);
    }

    #[tokio::test]
    async fn get_due_for_retry_honors_next_retry_at() {
        let store = Store::open_in_memory().unwrap();
        store.insert_dead_letter(sample_dl("m1")).await.unwrap();
        let id = DeadLetter::id_for("m1");
        store.schedule_retry(id.clone(), 3_600_000).await.unwrap();

        let due_now = store.get_due_for_retry(10).await.unwrap();
        assert!(due_now.is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_sender_and_unresolved() {
        let store = Store::open_in_memory().unwrap();
        store.insert_dead_letter(sample_dl("m1")).await.unwrap();
        let results = store
            .list_dead_letters(DeadLetterListParams {
                unresolved: Some(true),
                limit: 10,
                offset: 0,
                sender: Some("coordinator".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }
}
