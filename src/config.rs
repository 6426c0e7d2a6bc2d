//! Process-wide configuration (spec.md §6, §9 "Global state").
//!
//! Layered: built-in defaults, then an optional TOML file, then `PTC_*`
//! environment variables. `deny_unknown_fields` satisfies spec.md §6's
//! "unknown keys are rejected".

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::PtcResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub heartbeat_interval_ms: u64,
    pub stale_threshold_ms: u64,
    pub poll_interval_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_backoff_ms: Vec<u64>,
    pub max_backoff_ms: u64,
    pub jitter_factor: f64,
    pub ack_timeout_ms: u64,
    pub dead_letter_enabled: bool,
    pub escalation_timeout_ms: u64,
    /// Coordinator identity, used as `sender` on broadcast/system messages.
    pub coordinator_name: String,
    /// Root namespace, used both for default storage paths and for
    /// validating ready-task ids (`<namespace>-\w+`, spec.md §6).
    pub namespace: String,
    /// Directory holding the SQLite store files. Defaults under `$HOME`.
    pub storage_dir: Option<PathBuf>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            stale_threshold_ms: 90_000,
            poll_interval_ms: 10_000,
            retry_max_attempts: 3,
            retry_backoff_ms: vec![1_000, 5_000, 30_000],
            max_backoff_ms: 30_000,
            jitter_factor: 0.2,
            ack_timeout_ms: 60_000,
            dead_letter_enabled: true,
            escalation_timeout_ms: 30_000,
            coordinator_name: "ptc-coordinator".to_string(),
            namespace: "ptc".to_string(),
            storage_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load config: defaults -> optional TOML file -> `PTC_*` env overrides.
    ///
    /// `path` is optional; when absent only defaults + environment apply.
    pub fn load(path: Option<&std::path::Path>) -> PtcResult<Self> {
        let _ = dotenvy::dotenv();

        let defaults_json =
            serde_json::to_string(&Config::default()).expect("Config always serializes");

        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(&defaults_json, config::FileFormat::Json));

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PTC")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let merged = builder.build()?;
        let config: Config = merged.try_deserialize()?;
        Ok(config)
    }

    /// Resolve the directory storage files live under:
    /// `storage_dir` if set, else `$HOME/<namespace>/`.
    pub fn resolve_storage_dir(&self) -> PathBuf {
        if let Some(dir) = &self.storage_dir {
            return dir.clone();
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&self.namespace)
    }

    pub fn messages_db_path(&self) -> PathBuf {
        self.resolve_storage_dir().join("messages.db")
    }

    pub fn workers_db_path(&self) -> PathBuf {
        self.resolve_storage_dir().join("workers.db")
    }

    pub fn task_claims_db_path(&self) -> PathBuf {
        self.resolve_storage_dir().join("task-claims.db")
    }

    pub fn dead_letters_db_path(&self) -> PathBuf {
        self.resolve_storage_dir().join("dead-letters.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.heartbeat_interval_ms, 30_000);
        assert_eq!(config.stale_threshold_ms, 90_000);
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.retry_backoff_ms, vec![1_000, 5_000, 30_000]);
        assert!(config.dead_letter_enabled);
    }

    #[test]
    fn resolve_storage_dir_uses_namespace_under_home() {
        let mut config = Config::default();
        config.storage_dir = None;
        config.namespace = "ptc-test-ns".to_string();
        let dir = config.resolve_storage_dir();
        assert!(dir.ends_with("ptc-test-ns"));
    }

    #[test]
    fn load_with_no_file_returns_defaults() {
        let config = Config::load(None).expect("defaults-only load should succeed");
        assert_eq!(config.heartbeat_interval_ms, 30_000);
    }
}
