//! Daemon configuration loaded from `.courier/config.toml`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level courier configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Group id of the main conversation. The main group never requires a
    /// trigger phrase.
    pub main_group: String,

    /// Trigger phrase that non-main groups must contain before a worker is
    /// dispatched (case-insensitive substring match).
    #[serde(default = "default_trigger")]
    pub trigger: String,

    /// How often the dispatch loop polls for new messages (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Close a worker's input stream after this many seconds without output.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How long shutdown waits for workers to finish before force-killing
    /// them (milliseconds).
    #[serde(default = "default_shutdown_deadline")]
    pub shutdown_deadline_ms: u64,

    /// Worker process configuration.
    pub worker: WorkerConfig,
}

/// How to launch the external worker process.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Worker binary (assumed on PATH unless absolute).
    pub command: String,

    /// Extra arguments passed before the per-invocation flags.
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_trigger() -> String {
    "@courier".into()
}

fn default_poll_interval() -> u64 {
    2
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_shutdown_deadline() -> u64 {
    10_000
}

impl Config {
    /// Load config from `.courier/config.toml` under the given root.
    pub fn load(root: &Path) -> color_eyre::Result<Self> {
        let path = root.join(".courier/config.toml");
        let content = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                color_eyre::eyre::eyre!(
                    "No config found at {}\n\n\
                     Create .courier/config.toml:\n\n\
                     main_group = \"main\"\n\n\
                     [worker]\n\
                     command = \"courier-worker\"\n",
                    path.display()
                )
            } else {
                color_eyre::eyre::eyre!("failed to read {}: {e}", path.display())
            }
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| color_eyre::eyre::eyre!("failed to parse {}: {e}", path.display()))?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs)
    }

    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.shutdown_deadline_ms)
    }

    /// State directory (`.courier/`) under the given root.
    pub fn state_dir(root: &Path) -> PathBuf {
        root.join(".courier")
    }
}
