use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::tracker::Outcome;

/// Externally visible phase of the run scheduler.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
pub enum RunState {
    /// Waiting for a change.
    #[serde(rename = "idle")]
    Idle,
    /// A change arrived; the debounce timer is pending.
    #[serde(rename = "waiting")]
    WaitingToRun,
    /// The test runner is active.
    #[serde(rename = "running")]
    Running,
}

/// Snapshot written to the configured status file after every transition so
/// editors and prompts can show whether the suite is green.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AutotestStatus {
    /// Binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: RunState,
    pub last_outcome: Outcome,
    /// Number of runs started in this session.
    pub runs: u64,
    /// Arguments of the most recently started run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_args: Option<Vec<String>>,
    /// RFC 3339 start time of the most recently started run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_started: Option<String>,
    /// Most recent spawn failure, cleared by the next successful start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AutotestStatus {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: RunState::Idle,
            last_outcome: Outcome::Unknown,
            runs: 0,
            last_run_args: None,
            last_run_started: None,
            error: None,
        }
    }

    /// Records the start of a run.
    pub fn run_started(&mut self, args: &[String]) {
        self.state = RunState::Running;
        self.runs += 1;
        self.last_run_args = Some(args.to_vec());
        self.last_run_started = Some(chrono::Local::now().to_rfc3339());
        self.error = None;
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Failures are logged; a status write never stops the watch loop.
pub fn write_status(path: &Path, status: &AutotestStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("failed to create status directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!("failed to write status file {}: {e}", path.display());
            }
        }
        Err(e) => warn!("failed to serialize status: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_starts_idle_and_unknown() {
        let s = AutotestStatus::new();
        assert_eq!(s.state, RunState::Idle);
        assert_eq!(s.last_outcome, Outcome::Unknown);
        assert_eq!(s.runs, 0);
        assert_eq!(s.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn run_started_counts_and_records_args() {
        let mut s = AutotestStatus::new();
        s.error = Some("spawn failed".to_string());
        s.run_started(&["-t".to_string(), "a.js".to_string()]);

        assert_eq!(s.state, RunState::Running);
        assert_eq!(s.runs, 1);
        assert_eq!(s.last_run_args.as_deref(), Some(&["-t".to_string(), "a.js".to_string()][..]));
        assert!(s.last_run_started.is_some());
        assert!(s.error.is_none());
    }

    #[test]
    fn state_and_outcome_serialize_to_lowercase() {
        let mut s = AutotestStatus::new();
        let idle = toml::to_string_pretty(&s).unwrap();
        assert!(idle.contains("state = \"idle\""));
        assert!(idle.contains("last_outcome = \"unknown\""));

        s.state = RunState::WaitingToRun;
        s.last_outcome = Outcome::Failed;
        let waiting = toml::to_string_pretty(&s).unwrap();
        assert!(waiting.contains("state = \"waiting\""));
        assert!(waiting.contains("last_outcome = \"failed\""));
    }

    #[test]
    fn write_status_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("status.toml");
        write_status(&path, &AutotestStatus::new());
        assert!(path.exists());
    }

    #[test]
    fn write_status_content_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");

        let mut original = AutotestStatus::new();
        original.run_started(&["--tests".to_string(), "test/a.js".to_string()]);
        original.last_outcome = Outcome::Passed;
        write_status(&path, &original);

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: AutotestStatus = toml::from_str(&content).unwrap();
        assert_eq!(parsed.state, RunState::Running);
        assert_eq!(parsed.last_outcome, Outcome::Passed);
        assert_eq!(parsed.runs, 1);
        assert_eq!(
            parsed.last_run_args,
            Some(vec!["--tests".to_string(), "test/a.js".to_string()])
        );
    }

    #[test]
    fn write_status_omits_empty_optional_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        write_status(&path, &AutotestStatus::new());

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("last_run_args"));
        assert!(!content.contains("last_run_started"));
        assert!(!content.contains("error"));
    }
}
