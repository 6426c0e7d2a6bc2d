//! C2 — MessagePersistence (spec.md §4.2).

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::PtcResult;
use crate::model::{Importance, Message, MessageStatus};

use super::Store;

#[derive(Debug, Clone, Serialize)]
pub struct OpResult {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageStats {
    pub pending: i64,
    pub delivered: i64,
    pub acknowledged: i64,
    pub failed: i64,
    pub dead_letter: i64,
    pub avg_ack_latency_ms: Option<f64>,
}

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let content: String = row.get("content")?;
    let importance: String = row.get("importance")?;
    let status: String = row.get("status")?;
    Ok(Message {
        id: row.get("id")?,
        message_type: row.get("type")?,
        version: "1.0".to_string(),
        timestamp: row.get("created_at")?,
        sender: row.get("sender")?,
        recipient: row.get("recipient")?,
        importance: Importance::from_str_lenient(&importance),
        payload: serde_json::from_str(&content).unwrap_or(serde_json::Value::Null),
        correlation_id: row.get("correlation_id")?,
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        status: MessageStatus::from_str(&status).unwrap_or(MessageStatus::Pending),
    })
}

impl Store {
    pub async fn store_outgoing(&self, msg: Message) -> PtcResult<OpResult> {
        self.run(move |conn: &Connection| {
            let content = serde_json::to_string(&msg.payload)?;
            let changed = conn.execute(
                "INSERT INTO messages (id, sender, recipient, content, importance, type, status, correlation_id, created_at, retry_count, dead_letter)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, 0, 0)",
                params![
                    msg.id,
                    msg.sender,
                    msg.recipient,
                    content,
                    msg.importance.as_str(),
                    msg.message_type,
                    msg.correlation_id,
                    msg.timestamp,
                ],
            )?;
            Ok(OpResult { success: changed > 0 })
        })
        .await
    }

    pub async fn mark_delivered(&self, id: String) -> PtcResult<OpResult> {
        self.run(move |conn: &Connection| {
            let now = crate::model::now_ms();
            let changed = conn.execute(
                "UPDATE messages SET status='delivered', delivered_at=?1 WHERE id=?2",
                params![now, id],
            )?;
            Ok(OpResult { success: changed > 0 })
        })
        .await
    }

    /// `acknowledge(id, recipient)`: no row matching `id AND recipient` is
    /// not an error, per spec.md §4.2 — the caller does not escalate.
    pub async fn acknowledge(&self, id: String, recipient: String) -> PtcResult<OpResult> {
        self.run(move |conn: &Connection| {
            let now = crate::model::now_ms();
            let changed = conn.execute(
                "UPDATE messages SET status='acknowledged', acknowledged_at=?1 WHERE id=?2 AND recipient=?3",
                params![now, id, recipient],
            )?;
            Ok(OpResult { success: changed > 0 })
        })
        .await
    }

    pub async fn mark_failed(&self, id: String, error: String) -> PtcResult<OpResult> {
        self.run(move |conn: &Connection| {
            let changed = conn.execute(
                "UPDATE messages SET status='failed', error=?1, retry_count=retry_count+1 WHERE id=?2",
                params![error, id],
            )?;
            Ok(OpResult { success: changed > 0 })
        })
        .await
    }

    pub async fn mark_dead_letter(&self, id: String, error: String) -> PtcResult<OpResult> {
        self.run(move |conn: &Connection| {
            let changed = conn.execute(
                "UPDATE messages SET status='dead_letter', dead_letter=1, error=?1 WHERE id=?2",
                params![error, id],
            )?;
            Ok(OpResult { success: changed > 0 })
        })
        .await
    }

    pub async fn get_message(&self, id: String) -> PtcResult<Option<Message>> {
        self.run(move |conn: &Connection| {
            let msg = conn
                .query_row("SELECT * FROM messages WHERE id=?1", params![id], row_to_message)
                .optional()?;
            Ok(msg)
        })
        .await
    }

    pub async fn get_by_status(&self, status: MessageStatus, limit: i64) -> PtcResult<Vec<Message>> {
        self.run(move |conn: &Connection| {
            let mut stmt = conn.prepare(
                "SELECT * FROM messages WHERE status=?1 ORDER BY created_at ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![status.as_str(), limit], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn get_by_sender(&self, sender: String, limit: i64) -> PtcResult<Vec<Message>> {
        self.run(move |conn: &Connection| {
            let mut stmt = conn.prepare(
                "SELECT * FROM messages WHERE sender=?1 ORDER BY created_at ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![sender, limit], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn get_by_recipient(&self, recipient: String, limit: i64) -> PtcResult<Vec<Message>> {
        self.run(move |conn: &Connection| {
            let mut stmt = conn.prepare(
                "SELECT * FROM messages WHERE recipient=?1 ORDER BY created_at ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![recipient, limit], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn get_by_correlation(&self, correlation_id: String) -> PtcResult<Vec<Message>> {
        self.run(move |conn: &Connection| {
            let mut stmt = conn.prepare(
                "SELECT * FROM messages WHERE correlation_id=?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![correlation_id], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// `status=failed AND retry_count<max_attempts`, per spec.md §4.2.
    pub async fn get_pending_for_retry(&self, max_attempts: u32, limit: i64) -> PtcResult<Vec<Message>> {
        self.run(move |conn: &Connection| {
            let mut stmt = conn.prepare(
                "SELECT * FROM messages WHERE status='failed' AND retry_count < ?1 ORDER BY created_at ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![max_attempts, limit], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn get_stats(&self) -> PtcResult<MessageStats> {
        self.run(|conn: &Connection| {
            let mut counts = [0i64; 5];
            let statuses = ["pending", "delivered", "acknowledged", "failed", "dead_letter"];
            for (i, status) in statuses.iter().enumerate() {
                counts[i] = conn.query_row(
                    "SELECT COUNT(*) FROM messages WHERE status=?1",
                    params![status],
                    |row| row.get(0),
                )?;
            }
            let avg_ack_latency_ms: Option<f64> = conn
                .query_row(
                    "SELECT AVG(acknowledged_at - delivered_at) FROM messages WHERE status='acknowledged' AND delivered_at IS NOT NULL",
                    [],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            Ok(MessageStats {
                pending: counts[0],
                delivered: counts[1],
                acknowledged: counts[2],
                failed: counts[3],
                dead_letter: counts[4],
                avg_ack_latency_ms,
            })
        })
        .await
    }

    /// Deletes rows older than `older_than_days` whose status is terminal
    /// (`acknowledged` or `dead_letter`), per spec.md §4.2.
    pub async fn cleanup(&self, older_than_days: i64) -> PtcResult<u64> {
        self.run(move |conn: &Connection| {
            let cutoff = crate::model::now_ms() - older_than_days * 86_400_000;
            let changed = conn.execute(
                "DELETE FROM messages WHERE created_at < ?1 AND status IN ('acknowledged', 'dead_letter')",
                params![cutoff],
            )?;
            Ok(changed as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{new_message_id, NewIdOptions};

    fn sample_message(recipient: &str) -> Message {
        Message {
            id: new_message_id(&NewIdOptions::default()),
            message_type: "work".to_string(),
            version: "1.0".to_string(),
            timestamp: crate::model::now_ms(),
            sender: "coordinator".to_string(),
            recipient: recipient.to_string(),
            importance: Importance::Normal,
            payload: serde_json::json!({"k": "v"}),
            correlation_id: None,
            retry_count: 0,
            status: MessageStatus::Pending,
        }
    }

    #[tokio::test]
    async fn store_then_deliver_then_ack_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let msg = sample_message("W1");
        let id = msg.id.clone();
        assert!(store.store_outgoing(msg).await.unwrap().success);
        assert!(store.mark_delivered(id.clone()).await.unwrap().success);
        assert!(store.acknowledge(id.clone(), "W1".to_string()).await.unwrap().success);

        let fetched = store.get_message(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, MessageStatus::Acknowledged);
        assert_eq!(fetched.retry_count, 0);
    }

    #[tokio::test]
    async fn acknowledge_with_wrong_recipient_does_not_mutate() {
        let store = Store::open_in_memory().unwrap();
        let msg = sample_message("W1");
        let id = msg.id.clone();
        store.store_outgoing(msg).await.unwrap();
        let result = store.acknowledge(id, "W2".to_string()).await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn mark_failed_increments_retry_count() {
        let store = Store::open_in_memory().unwrap();
        let msg = sample_message("W1");
        let id = msg.id.clone();
        store.store_outgoing(msg).await.unwrap();
        store.mark_failed(id.clone(), "boom".to_string()).await.unwrap();
        store.mark_failed(id.clone(), "boom again".to_string()).await.unwrap();
        let fetched = store.get_message(id).await.unwrap().unwrap();
        assert_eq!(fetched.retry_count, 2);
        assert_eq!(fetched.status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn get_pending_for_retry_respects_max_attempts() {
        let store = Store::open_in_memory().unwrap();
        let msg = sample_message("W1");
        let id = msg.id.clone();
        store.store_outgoing(msg).await.unwrap();
        store.mark_failed(id.clone(), "e".to_string()).await.unwrap();

        let retryable = store.get_pending_for_retry(3, 10).await.unwrap();
        assert_eq!(retryable.len(), 1);

        let none_left = store.get_pending_for_retry(1, 10).await.unwrap();
        assert!(none_left.is_empty());
    }

    #[tokio::test]
    async fn get_stats_counts_by_status() {
        let store = Store::open_in_memory().unwrap();
        store.store_outgoing(sample_message("W1")).await.unwrap();
        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.acknowledged, 0);
    }
}
