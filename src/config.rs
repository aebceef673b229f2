//! Configuration management for dgate.
//!
//! Loads configuration from ${DGATE_HOME}/config.toml with sensible defaults.
//! Secrets (the Discord bot token) may also come from the environment.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub mod paths {
    //! Path resolution for dgate configuration and data directories.
    //!
    //! DGATE_HOME resolution order:
    //! 1. DGATE_HOME environment variable (if set)
    //! 2. ~/.config/dgate (default)
    //!
    //! All persisted state lives under this directory regardless of the
    //! current working directory at launch.

    use std::path::PathBuf;

    /// Returns the dgate home directory.
    ///
    /// Checks DGATE_HOME env var first, falls back to ~/.config/dgate
    pub fn dgate_home() -> PathBuf {
        if let Ok(home) = std::env::var("DGATE_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir()
            .map(|h| h.join(".config").join("dgate"))
            .expect("Could not determine home directory")
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        dgate_home().join("config.toml")
    }

    /// Returns the path to the thread → session map file.
    pub fn session_map_path() -> PathBuf {
        dgate_home().join("sessions.json")
    }

    /// Returns the directory holding per-thread conversation transcripts.
    pub fn transcripts_dir() -> PathBuf {
        dgate_home().join("transcripts")
    }
}

/// Worker subprocess configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Program invoked for each request (expected to speak the
    /// `-p` / `--session-id` / `--resume` CLI contract).
    pub command: String,

    /// Extra args appended to every invocation, before the prompt.
    pub extra_args: Vec<String>,

    /// Kill the worker if it produces no output for this long (0 disables).
    pub timeout_secs: u64,

    /// Environment variables removed from the child process.
    pub scrub_env: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: Config::DEFAULT_WORKER_COMMAND.to_string(),
            extra_args: Vec::new(),
            timeout_secs: Config::DEFAULT_WORKER_TIMEOUT_SECS,
            scrub_env: vec!["CLAUDECODE".to_string()],
        }
    }
}

/// Discord connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DiscordConfig {
    /// Bot token; DGATE_DISCORD_TOKEN overrides.
    pub bot_token: Option<String>,

    /// Channel watched for new conversations (0 = none).
    pub channel_id: u64,

    /// The only user allowed to talk to the gateway.
    pub admin_user_id: u64,

    /// Seconds between inbound polls.
    pub poll_interval_secs: u64,
}

/// Streaming/delivery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Minimum milliseconds between progress edits.
    pub interval_ms: u64,

    /// Maximum characters per delivered message.
    pub max_message_len: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            interval_ms: Config::DEFAULT_STREAM_INTERVAL_MS,
            max_message_len: Config::DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

/// Session-memory (retrieval) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// "none", "local", or "external".
    pub mode: String,

    /// External retrieval API base URL.
    pub base_url: String,

    /// External retrieval API key.
    pub api_key: String,

    /// Dataset id for the external API; required for "external" mode.
    pub dataset_id: String,

    /// Number of hits returned by search.
    pub top_n: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: "none".to_string(),
            base_url: "http://localhost:9380".to_string(),
            api_key: String::new(),
            dataset_id: String::new(),
            top_n: 8,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default worker model when a thread has no override.
    pub model: String,

    pub worker: WorkerConfig,
    pub discord: DiscordConfig,
    pub stream: StreamConfig,
    pub retrieval: RetrievalConfig,
}

impl Config {
    pub const DEFAULT_MODEL: &str = "sonnet";
    pub const DEFAULT_WORKER_COMMAND: &str = "claude";
    pub const DEFAULT_WORKER_TIMEOUT_SECS: u64 = 300;
    pub const DEFAULT_STREAM_INTERVAL_MS: u64 = 1500;
    pub const DEFAULT_MAX_MESSAGE_LEN: usize = 1900;
    const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

    /// Loads configuration from the default config path.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Worker no-output timeout; zero disables.
    pub fn worker_timeout(&self) -> Option<Duration> {
        if self.worker.timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.worker.timeout_secs))
        }
    }

    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream.interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        let secs = if self.discord.poll_interval_secs == 0 {
            Self::DEFAULT_POLL_INTERVAL_SECS
        } else {
            self.discord.poll_interval_secs
        };
        Duration::from_secs(secs)
    }

    /// Returns the default worker model.
    ///
    /// A `--model` in `worker.extra_args` wins over the `model` field, since
    /// extra args are passed verbatim and would override it anyway.
    pub fn default_model(&self) -> &str {
        let args = &self.worker.extra_args;
        for (i, arg) in args.iter().enumerate() {
            if arg == "--model"
                && let Some(value) = args.get(i + 1)
            {
                return value;
            }
        }
        &self.model
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: Self::DEFAULT_MODEL.to_string(),
            worker: WorkerConfig::default(),
            discord: DiscordConfig::default(),
            stream: StreamConfig::default(),
            retrieval: RetrievalConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("nonexistent.toml");

        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config.model, "sonnet");
        assert_eq!(config.worker.command, "claude");
        assert_eq!(config.worker.timeout_secs, 300);
        assert_eq!(config.stream.max_message_len, 1900);
    }

    #[test]
    fn test_load_partial_config_merges_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");

        fs::write(
            &config_path,
            "model = \"opus\"\n\n[worker]\ntimeout_secs = 60\n",
        )
        .unwrap();

        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config.model, "opus");
        assert_eq!(config.worker.timeout_secs, 60);
        assert_eq!(config.stream.interval_ms, 1500); // default preserved
        assert_eq!(config.worker.scrub_env, vec!["CLAUDECODE".to_string()]);
    }

    #[test]
    fn test_worker_timeout_zero_disables() {
        let mut config = Config::default();
        config.worker.timeout_secs = 0;
        assert_eq!(config.worker_timeout(), None);
    }

    #[test]
    fn test_default_model_prefers_extra_args() {
        let mut config = Config::default();
        config.worker.extra_args = vec!["--model".to_string(), "haiku".to_string()];
        assert_eq!(config.default_model(), "haiku");
    }

    #[test]
    fn test_default_model_ignores_dangling_flag() {
        let mut config = Config::default();
        config.worker.extra_args = vec!["--model".to_string()];
        assert_eq!(config.default_model(), "sonnet");
    }

    #[test]
    fn test_retrieval_defaults() {
        let config = Config::default();
        assert_eq!(config.retrieval.mode, "none");
        assert_eq!(config.retrieval.top_n, 8);
    }
}
