//! Crate-wide error type.
//!
//! `PtcError` is reserved for transient I/O and internal invariant failures
//! (spec.md §7's "Transient I/O" and "Internal" taxonomy entries). Expected
//! outcomes — contention (`task_already_claimed`), policy
//! (`worker_task_limit_reached`) — are returned as typed result enums at the
//! call site, never as `PtcError`, so callers can match on them without
//! downcasting.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PtcError {
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("store connection poisoned")]
    StorePoisoned,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invariant violation: {0}")]
    Internal(String),

    #[error("operation not permitted before start() / after stop()")]
    NotStarted,

    #[error("blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("store circuit breaker open, retry after cooldown")]
    CircuitOpen,
}

pub type PtcResult<T> = Result<T, PtcError>;
