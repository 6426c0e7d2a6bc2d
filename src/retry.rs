//! C10 — RetryHandler (spec.md §4.10): exponential backoff + jitter executor.
//!
//! Backoff is computed per attempt, then widened by a symmetric jitter
//! spread (`1 - jitter_factor` to `1 + jitter_factor`) so a burst of
//! concurrently failing callers doesn't retry in lockstep.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub backoff_schedule_ms: Vec<u64>,
    pub max_backoff_ms: u64,
    pub jitter_factor: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_schedule_ms: vec![1_000, 5_000, 30_000],
            max_backoff_ms: 30_000,
            jitter_factor: 0.2,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RetrySuccess<T> {
    pub result: T,
    pub attempts: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
    pub duration_ms: u64,
    pub max_attempts: u32,
}

pub struct RetryCallbacks<E> {
    pub on_retry: Option<Arc<dyn Fn(&E, u32, Duration) + Send + Sync>>,
    pub on_success: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_final_error: Option<Arc<dyn Fn(&E) + Send + Sync>>,
}

impl<E> Default for RetryCallbacks<E> {
    fn default() -> Self {
        Self {
            on_retry: None,
            on_success: None,
            on_final_error: None,
        }
    }
}

pub struct RetryHandler {
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Base delay from the schedule, doubled beyond the schedule's last
    /// index, capped at `max_backoff_ms`, then symmetric jitter of
    /// `±jitter_factor` is applied (spec.md §4.10). Bounded by
    /// `[0, max_backoff_ms * (1 + jitter_factor)]` (spec.md §8).
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let schedule = &self.config.backoff_schedule_ms;
        let idx = attempt as usize;
        let base = if idx < schedule.len() {
            schedule[idx]
        } else {
            let last = *schedule.last().unwrap_or(&1_000);
            let extra_doublings = (idx - schedule.len() + 1) as u32;
            last.saturating_mul(2u64.saturating_pow(extra_doublings))
        };
        let capped = base.min(self.config.max_backoff_ms);

        let jitter_spread = self.config.jitter_factor.clamp(0.0, 1.0);
        let factor = 1.0 - jitter_spread + fastrand::f64() * (2.0 * jitter_spread);
        let jittered = (capped as f64 * factor).max(0.0);
        Duration::from_millis(jittered as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.config.max_attempts
    }

    /// Runs `op` until it succeeds or `should_retry` is exhausted.
    /// Callback failures never abort the outer retry (spec.md §4.10);
    /// there is none to catch here since callbacks are infallible closures,
    /// but panics inside them are not caught — callers must keep them simple.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F, callbacks: RetryCallbacks<E>) -> Result<RetrySuccess<T>, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Debug,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(result) => {
                    if let Some(cb) = &callbacks.on_success {
                        cb();
                    }
                    return Ok(RetrySuccess {
                        result,
                        attempts: attempt + 1,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(error) => {
                    if self.should_retry(attempt) {
                        let delay = self.calculate_backoff(attempt);
                        if let Some(cb) = &callbacks.on_retry {
                            cb(&error, attempt, delay);
                        }
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    } else {
                        if let Some(cb) = &callbacks.on_final_error {
                            cb(&error);
                        } else {
                            warn!(?error, attempts = attempt + 1, "retry budget exhausted");
                        }
                        return Err(RetryFailure {
                            error,
                            attempts: attempt + 1,
                            duration_ms: started.elapsed().as_millis() as u64,
                            max_attempts: self.config.max_attempts,
                        });
                    }
                }
            }
        }
    }
}
