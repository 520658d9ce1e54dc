use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::time::Duration;

pub const CONFIG_FILE_NAME: &str = "autotest.toml";
pub const DEFAULT_RUNNER: &str = "buster-test";
pub const DEFAULT_DEBOUNCE_MS: u64 = 10;
pub const DEFAULT_STALL_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_EXCLUDE: [&str; 3] = [".git", "node_modules", "target"];

/// Root configuration structure. Deserialized from `<root>/autotest.toml`.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    /// Where to write the status snapshot. Relative paths are resolved against
    /// the watch root. No status file is written when unset.
    pub status_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct RunnerConfig {
    /// Test runner executable, looked up on PATH.
    #[serde(default = "default_runner")]
    pub program: String,
    /// Base arguments passed to every run.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_RUNNER.to_string(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TimingConfig {
    /// Quiet period after a change before the run starts.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// How long a runner may keep going after its first output before it is
    /// terminated.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            stall_timeout_ms: DEFAULT_STALL_TIMEOUT_MS,
        }
    }
}

impl TimingConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

#[derive(Debug, Deserialize)]
pub struct WatchConfig {
    /// Path components whose subtrees never trigger a run.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            exclude: default_exclude(),
        }
    }
}

/// Returns the default config file location for a watch root.
pub fn config_file_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE_NAME)
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn default_runner() -> String {
    DEFAULT_RUNNER.to_string()
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_stall_timeout_ms() -> u64 {
    DEFAULT_STALL_TIMEOUT_MS
}

fn default_exclude() -> Vec<String> {
    DEFAULT_EXCLUDE.iter().map(|s| s.to_string()).collect()
}
