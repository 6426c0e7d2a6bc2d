//! External ready-task source contract (spec.md §6 "Ready-task source
//! contract"). PTC invokes an opaque command but does not define it
//! (spec.md §1 Out of scope); this module only knows how to parse its
//! output.

use std::process::Stdio;
use tokio::process::Command;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyTaskOutcome {
    Ready(String),
    NoReadyTasks,
}

/// Matches `<namespace>-\w+`. The namespace is the configured one; any
/// other shape, or the phrase "No ready work", yields `no_ready_tasks`.
pub fn parse_output(namespace: &str, output: &str) -> ReadyTaskOutcome {
    let trimmed = output.trim();
    if trimmed.to_lowercase().contains("no ready work") {
        return ReadyTaskOutcome::NoReadyTasks;
    }

    let prefix = format!("{namespace}-");
    for token in trimmed.split_whitespace() {
        if let Some(rest) = token.strip_prefix(&prefix) {
            if !rest.is_empty() && rest.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return ReadyTaskOutcome::Ready(token.to_string());
            }
        }
    }
    ReadyTaskOutcome::NoReadyTasks
}

/// Invokes `command` with no arguments and parses its stdout.
pub async fn invoke(command: &str, namespace: &str) -> ReadyTaskOutcome {
    let output = Command::new(command)
        .stdin(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            parse_output(namespace, &stdout)
        }
        Err(e) => {
            warn!(error = %e, command, "ready-task source invocation failed");
            ReadyTaskOutcome::NoReadyTasks
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_task_id_matching_namespace() {
        let outcome = parse_output("ptc", "next task: ptc-abc123\n");
        assert_eq!(outcome, ReadyTaskOutcome::Ready("ptc-abc123".to_string()));
    }

    #[test]
    fn recognizes_no_ready_work_phrase() {
        let outcome = parse_output("ptc", "No ready work available right now");
        assert_eq!(outcome, ReadyTaskOutcome::NoReadyTasks);
    }

    #[test]
    fn anything_else_is_no_ready_tasks() {
        let outcome = parse_output("ptc", "some garbage output");
        assert_eq!(outcome, ReadyTaskOutcome::NoReadyTasks);
    }
}
