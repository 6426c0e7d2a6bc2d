//! C11 — DeadLetter facade (spec.md §4.11): durable store of terminally
//! failed messages, with replay.

use serde::Serialize;
use tracing::error;

use crate::error::PtcResult;
use crate::id::{new_message_id, NewIdOptions};
use crate::model::{DeadLetter, DeadLetterResolution, Message, MessageStatus};
use crate::store::dead_letters::{DeadLetterListParams, DeadLetterStats};
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct ExportSnapshot {
    pub exported_at: i64,
    pub entries: Vec<DeadLetter>,
}

pub struct DeadLetterStore {
    store: Store,
}

impl DeadLetterStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// `store(msg, error)`: inserts `dl-<id>`, then best-effort marks the
    /// original message dead-letter in persistence (spec.md §4.11).
    pub async fn store(&self, original: &Message, error: &str) -> PtcResult<DeadLetter> {
        let dl = DeadLetter {
            id: DeadLetter::id_for(&original.id),
            original_message_id: original.id.clone(),
            sender: original.sender.clone(),
            recipient: original.recipient.clone(),
            content: original.payload.clone(),
            importance: original.importance,
            message_type: original.message_type.clone(),
            error: error.to_string(),
            failed_at: crate::model::now_ms(),
            retry_count: original.retry_count,
            resolved: false,
            resolved_at: None,
            resolution: None,
            next_retry_at: None,
        };
        self.store.insert_dead_letter(dl.clone()).await?;

        if let Err(e) = self
            .store
            .mark_dead_letter(original.id.clone(), error.to_string())
            .await
        {
            error!(error = %e, message_id = original.id, "best-effort mark_dead_letter failed");
        }

        Ok(dl)
    }

    pub async fn get(&self, id: &str) -> PtcResult<Option<DeadLetter>> {
        self.store.get_dead_letter(id.to_string()).await
    }

    pub async fn list(&self, filter: DeadLetterListParams) -> PtcResult<Vec<DeadLetter>> {
        self.store.list_dead_letters(filter).await
    }

    pub async fn get_due_for_retry(&self, limit: i64) -> PtcResult<Vec<DeadLetter>> {
        self.store.get_due_for_retry(limit).await
    }

    /// Terminal w.r.t. automatic processing (spec.md §3).
    pub async fn resolve(&self, id: &str, resolution: DeadLetterResolution) -> PtcResult<bool> {
        self.store.resolve_dead_letter(id.to_string(), resolution).await
    }

    pub async fn update_retry_count(&self, id: &str, retry_count: u32) -> PtcResult<bool> {
        self.store.update_retry_count(id.to_string(), retry_count).await
    }

    pub async fn schedule_retry(&self, id: &str, delay_ms: i64) -> PtcResult<bool> {
        self.store.schedule_retry(id.to_string(), delay_ms).await
    }

    pub async fn get_stats(&self) -> PtcResult<DeadLetterStats> {
        self.store.dead_letter_stats().await
    }

    /// Returns a fresh message with incremented `retry_count`, or `None` if
    /// missing/resolved. Per spec.md §9 Open Question (b), the DL row's
    /// `retry_count` increments; the original `messages` row is untouched —
    /// the re-sent message is a brand new row, not a revival of the old one.
    pub async fn retry(&self, id: &str) -> PtcResult<Option<Message>> {
        let Some(dl) = self.get(id).await? else {
            return Ok(None);
        };
        if dl.resolved {
            return Ok(None);
        }

        let new_retry_count = dl.retry_count + 1;
        self.update_retry_count(id, new_retry_count).await?;

        Ok(Some(Message {
            id: new_message_id(&NewIdOptions {
                prefix: None,
                with_timestamp: true,
            }),
            message_type: dl.message_type,
            version: "1.0".to_string(),
            timestamp: crate::model::now_ms(),
            sender: dl.sender,
            recipient: dl.recipient,
            importance: dl.importance,
            payload: dl.content,
            correlation_id: None,
            retry_count: new_retry_count,
            status: MessageStatus::Pending,
        }))
    }

    pub async fn batch_resolve(&self, ids: Vec<String>, resolution: DeadLetterResolution) -> PtcResult<u64> {
        self.store.batch_resolve(ids, resolution).await
    }

    pub async fn export_data(&self, unresolved_only: bool) -> PtcResult<ExportSnapshot> {
        let entries = self
            .list(DeadLetterListParams {
                unresolved: if unresolved_only { Some(true) } else { None },
                limit: i64::MAX,
                offset: 0,
                sender: None,
            })
            .await?;
        Ok(ExportSnapshot {
            exported_at: crate::model::now_ms(),
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Importance;

    fn sample_message() -> Message {
        Message {
            id: new_message_id(&NewIdOptions::default()),
            message_type: "work".to_string(),
            version: "1.0".to_string(),
            timestamp: crate::model::now_ms(),
            sender: "coordinator".to_string(),
            recipient: "W1".to_string(),
            importance: Importance::Normal,
            payload: serde_json::json!({"k": "v"}),
            correlation_id: None,
            retry_count: 3,
            status: MessageStatus::Failed,
        }
    }

    #[tokio::test]
    async fn store_inserts_dl_row_and_marks_original() {
        let store = Store::open_in_memory().unwrap();
        let msg = sample_message();
        store.store_outgoing(msg.clone()).await.unwrap();

        let dl_store = DeadLetterStore::new(store.clone());
        let dl = dl_store.store(&msg, "boom").await.unwrap();
        assert_eq!(dl.id, DeadLetter::id_for(&msg.id));

        let original = store.get_message(msg.id).await.unwrap().unwrap();
        assert_eq!(original.status, MessageStatus::DeadLetter);
    }

    #[tokio::test]
    async fn retry_increments_dl_retry_count_and_leaves_original_message_untouched() {
        let store = Store::open_in_memory().unwrap();
        let msg = sample_message();
        store.store_outgoing(msg.clone()).await.unwrap();
        let dl_store = DeadLetterStore::new(store.clone());
        dl_store.store(&msg, "boom").await.unwrap();

        let dl_id = DeadLetter::id_for(&msg.id);
        let retried = dl_store.retry(&dl_id).await.unwrap().unwrap();
        assert_eq!(retried.retry_count, 4);
        assert_ne!(retried.id, msg.id);

        let original_still_dead = store.get_message(msg.id).await.unwrap().unwrap();
        assert_eq!(original_still_dead.status, MessageStatus::DeadLetter);
    }

    #[tokio::test]
    async fn retry_on_resolved_dl_returns_none() {
        let store = Store::open_in_memory().unwrap();
        let msg = sample_message();
        store.store_outgoing(msg.clone()).await.unwrap();
        let dl_store = DeadLetterStore::new(store.clone());
        dl_store.store(&msg, "boom").await.unwrap();
        let dl_id = DeadLetter::id_for(&msg.id);
        dl_store.resolve(&dl_id, DeadLetterResolution::Skipped).await.unwrap();

        assert!(dl_store.retry(&dl_id).await.unwrap().is_none());
    }
}
