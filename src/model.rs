//! Data model (spec.md §3): messages, workers, task claims, dead letters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Milliseconds since the Unix epoch. All durations/timestamps in PTC are
/// expressed in this unit, per spec.md §5's "monotonic wall clocks with
/// millisecond resolution" assumption.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `importance` is total over these four values; any unrecognized string
/// maps to `Normal` (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Critical,
    High,
    Normal,
    Low,
}

impl Importance {
    pub fn from_str_lenient(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Importance::Critical,
            "high" => Importance::High,
            "low" => Importance::Low,
            _ => Importance::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Importance::Critical => "critical",
            Importance::High => "high",
            Importance::Normal => "normal",
            Importance::Low => "low",
        }
    }

    /// Priority ordering used by the queue: CRITICAL(0) < HIGH(1) < NORMAL(2) < LOW(3).
    pub fn rank(&self) -> u8 {
        match self {
            Importance::Critical => 0,
            Importance::High => 1,
            Importance::Normal => 2,
            Importance::Low => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Acknowledged,
    Failed,
    DeadLetter,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Acknowledged => "acknowledged",
            MessageStatus::Failed => "failed",
            MessageStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => MessageStatus::Pending,
            "delivered" => MessageStatus::Delivered,
            "acknowledged" => MessageStatus::Acknowledged,
            "failed" => MessageStatus::Failed,
            "dead_letter" => MessageStatus::DeadLetter,
            _ => return None,
        })
    }

    /// `acknowledged` and `dead_letter` are terminal (spec.md §3).
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Acknowledged | MessageStatus::DeadLetter)
    }
}

/// A message exchanged between producers/consumers through the coordinator.
///
/// `payload` is carried as an opaque JSON value and round-tripped
/// byte-for-byte on the wire (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub version: String,
    pub timestamp: i64,
    pub sender: String,
    pub recipient: String,
    pub importance: Importance,
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
    pub retry_count: u32,
    pub status: MessageStatus,
}

/// Recipient value meaning "all registered workers".
pub const BROADCAST_RECIPIENT: &str = "*";

impl Message {
    pub fn is_broadcast(&self) -> bool {
        self.recipient == BROADCAST_RECIPIENT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Stale,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Stale => "stale",
            WorkerStatus::Offline => "offline",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "active" => WorkerStatus::Active,
            "stale" => WorkerStatus::Stale,
            "offline" => WorkerStatus::Offline,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub pid: i64,
    pub capabilities: BTreeSet<String>,
    pub status: WorkerStatus,
    pub last_heartbeat: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Active,
    Completed,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Active => "active",
            ClaimStatus::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "active" => ClaimStatus::Active,
            "completed" => ClaimStatus::Completed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskClaim {
    pub task_id: String,
    pub worker_id: String,
    pub status: ClaimStatus,
    pub claimed_at: i64,
    pub completed_at: Option<i64>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterResolution {
    Retried,
    Skipped,
    Escalated,
}

impl DeadLetterResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterResolution::Retried => "retried",
            DeadLetterResolution::Skipped => "skipped",
            DeadLetterResolution::Escalated => "escalated",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "retried" => DeadLetterResolution::Retried,
            "skipped" => DeadLetterResolution::Skipped,
            "escalated" => DeadLetterResolution::Escalated,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub original_message_id: String,
    pub sender: String,
    pub recipient: String,
    pub content: serde_json::Value,
    pub importance: Importance,
    #[serde(rename = "type")]
    pub message_type: String,
    pub error: String,
    pub failed_at: i64,
    pub retry_count: u32,
    pub resolved: bool,
    pub resolved_at: Option<i64>,
    pub resolution: Option<DeadLetterResolution>,
    pub next_retry_at: Option<i64>,
}

impl DeadLetter {
    pub fn id_for(message_id: &str) -> String {
        format!("dl-{message_id}")
    }
}
