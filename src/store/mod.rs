//! Embedded storage engine (spec.md §6 "Storage layout"): SQLite via
//! `rusqlite`, opened with WAL journaling and `execute_batch` schema
//! creation. The connection is a plain `std::sync::Mutex`, never touched
//! directly off the async executor — every public method here is
//! synchronous and callers reach it through `tokio::task::spawn_blocking`
//! (see `Store::run`).

pub mod claims;
pub mod dead_letters;
pub mod messages;
pub mod workers;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{instrument, warn};

use crate::error::{PtcError, PtcResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY,
    sender          TEXT NOT NULL,
    recipient       TEXT NOT NULL,
    content         TEXT NOT NULL,
    importance      TEXT NOT NULL,
    type            TEXT NOT NULL,
    status          TEXT NOT NULL,
    correlation_id  TEXT,
    created_at      INTEGER NOT NULL,
    delivered_at    INTEGER,
    acknowledged_at INTEGER,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    dead_letter     INTEGER NOT NULL DEFAULT 0,
    error           TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status);
CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender);
CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient);
CREATE INDEX IF NOT EXISTS idx_messages_type ON messages(type);
CREATE INDEX IF NOT EXISTS idx_messages_correlation_id ON messages(correlation_id);
CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);

CREATE TABLE IF NOT EXISTS workers (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    pid             INTEGER NOT NULL,
    capabilities    TEXT NOT NULL DEFAULT '[]',
    status          TEXT NOT NULL,
    last_heartbeat  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS task_claims (
    task_id      TEXT PRIMARY KEY,
    worker_id    TEXT NOT NULL,
    status       TEXT NOT NULL,
    claimed_at   INTEGER NOT NULL,
    completed_at INTEGER,
    metadata     TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_task_claims_worker_id ON task_claims(worker_id);
CREATE INDEX IF NOT EXISTS idx_task_claims_status ON task_claims(status);

CREATE TABLE IF NOT EXISTS dead_letters (
    id                  TEXT PRIMARY KEY,
    original_message_id TEXT NOT NULL,
    sender              TEXT NOT NULL,
    recipient           TEXT NOT NULL,
    content             TEXT NOT NULL,
    importance          TEXT NOT NULL,
    type                TEXT NOT NULL,
    error               TEXT NOT NULL,
    failed_at           INTEGER NOT NULL,
    retry_count         INTEGER NOT NULL DEFAULT 0,
    resolved            INTEGER NOT NULL DEFAULT 0,
    resolved_at         INTEGER,
    resolution          TEXT,
    next_retry_at       INTEGER
);
CREATE INDEX IF NOT EXISTS idx_dead_letters_resolved ON dead_letters(resolved);
CREATE INDEX IF NOT EXISTS idx_dead_letters_failed_at ON dead_letters(failed_at);
CREATE INDEX IF NOT EXISTS idx_dead_letters_sender ON dead_letters(sender);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Trips to `Open` after a run of consecutive store failures and fails
/// fast for `cooldown` rather than letting every caller queue up behind a
/// struggling disk. A single probe is allowed through once the cooldown
/// elapses (`HalfOpen`); it closes the breaker on success or reopens it on
/// failure.
struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                if inner.opened_at.is_some_and(|at| at.elapsed() >= self.cooldown) {
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        if inner.state == BreakerState::HalfOpen || inner.consecutive_failures >= self.failure_threshold {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(failures = inner.consecutive_failures, "store circuit breaker open");
        }
    }
}

/// A single SQLite connection, pragma'd for the single-writer embedded
/// workload spec.md §1 calls for, shared behind a mutex.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    breaker: Arc<CircuitBreaker>,
}

impl Store {
    /// Open (creating if absent) the database file at `path` and apply schema.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> PtcResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            breaker: Arc::new(CircuitBreaker::new(5, Duration::from_secs(30))),
        })
    }

    /// In-memory store, used by tests and `Config::storage_dir == ":memory:"`.
    pub fn open_in_memory() -> PtcResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            breaker: Arc::new(CircuitBreaker::new(5, Duration::from_secs(30))),
        })
    }

    /// Run a synchronous closure against the connection on a blocking
    /// thread, keeping the async facade non-blocking (spec.md §5 "operations
    /// are non-blocking at the API surface"). Fails fast with
    /// `PtcError::CircuitOpen` while the breaker is tripped instead of
    /// piling more blocking work onto a struggling disk.
    pub async fn run<F, T>(&self, f: F) -> PtcResult<T>
    where
        F: FnOnce(&Connection) -> PtcResult<T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.breaker.allow() {
            return Err(PtcError::CircuitOpen);
        }
        let conn = self.conn.clone();
        let result = tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| PtcError::StorePoisoned)?;
            f(&guard)
        })
        .await?;

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(PtcError::Store(_)) | Err(PtcError::StorePoisoned) => self.breaker.record_failure(),
            Err(_) => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_creates_all_tables() {
        let store = Store::open_in_memory().unwrap();
        let guard = store.conn.lock().unwrap();
        for table in ["messages", "workers", "task_claims", "dead_letters"] {
            let count: i64 = guard
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn open_on_disk_creates_parent_dirs_and_persists_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("messages.db");
        let store = Store::open(&path).unwrap();
        assert!(path.exists());

        let guard = store.conn.lock().unwrap();
        let journal_mode: String = guard.query_row("PRAGMA journal_mode", [], |row| row.get(0)).unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");
        let foreign_keys: i64 = guard.query_row("PRAGMA foreign_keys", [], |row| row.get(0)).unwrap();
        assert_eq!(foreign_keys, 1);
    }

    #[test]
    fn circuit_breaker_opens_after_threshold_and_recovers_after_cooldown() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(20));
        assert!(breaker.allow());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow(), "still closed below threshold");
        breaker.record_failure();
        assert!(!breaker.allow(), "trips open at threshold");

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.allow(), "half-open probe allowed after cooldown");
        assert!(!breaker.allow(), "only one probe permitted while half-open");

        breaker.record_success();
        assert!(breaker.allow(), "closed again after a successful probe");
    }
}
