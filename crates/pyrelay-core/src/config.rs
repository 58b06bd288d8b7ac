//! Configuration for the relay and the client.
//!
//! Both are read from one JSON file (default `<config_dir>/pyrelay/config.json`)
//! with `"relay"` and `"client"` sections. Missing files or sections fall back
//! to defaults; a few environment variables override file values, and CLI
//! flags override both.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const ENV_OLLAMA_URL: &str = "PYRELAY_OLLAMA_URL";
pub const ENV_MODEL: &str = "PYRELAY_MODEL";
pub const ENV_SERVER: &str = "PYRELAY_SERVER";
pub const ENV_USER: &str = "PYRELAY_USER";

/// Return the default config path: `<config_dir>/pyrelay/config.json`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pyrelay")
        .join("config.json")
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub client: ClientConfig,
}

impl Config {
    /// Load from `path` (or the default location). A missing file yields defaults;
    /// an unparseable file is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?
        } else {
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup(ENV_OLLAMA_URL).filter(|v| !v.is_empty()) {
            self.relay.llm.base_url = v;
        }
        if let Some(v) = lookup(ENV_MODEL).filter(|v| !v.is_empty()) {
            self.relay.llm.model = v;
        }
        if let Some(v) = lookup(ENV_SERVER).filter(|v| !v.is_empty()) {
            self.client.server_url = v;
        }
        if let Some(v) = lookup(ENV_USER).filter(|v| !v.is_empty()) {
            self.client.user_id = v;
        }
    }
}

// ── Relay ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: String,
    pub port: u16,
    pub llm: LlmConfig,
    pub exec: ExecConfig,
    pub watch: WatchConfig,
    /// Upper bound on concurrently running job workers.
    pub max_workers: usize,
    pub job_retention_secs: u64,
    pub history_ttl_secs: u64,
    pub history_max_turns: usize,
    /// Registered clients silent for this long are dropped by the sweep.
    pub monitor_idle_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5000,
            llm: LlmConfig::default(),
            exec: ExecConfig::default(),
            watch: WatchConfig::default(),
            max_workers: 8,
            job_retention_secs: 24 * 60 * 60,
            history_ttl_secs: 60 * 60,
            history_max_turns: 20,
            monitor_idle_secs: 24 * 60 * 60,
            sweep_interval_secs: 60 * 60,
        }
    }
}

impl RelayConfig {
    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_secs)
    }

    pub fn monitor_idle(&self) -> Duration {
        Duration::from_secs(self.monitor_idle_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Ollama base URL, without the `/api/...` suffix.
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".into(),
            model: "qwen2.5-coder:7b".into(),
            timeout_secs: 30,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    pub interpreter: PathBuf,
    /// Arguments placed before the script path.
    pub args: Vec<String>,
    pub timeout_secs: u64,
    /// Directory for throwaway script files (system temp dir when unset).
    pub scratch_dir: Option<PathBuf>,
    /// Output lines kept as context for runtime analysis.
    pub context_lines: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from(if cfg!(windows) { "python" } else { "python3" }),
            args: vec!["-u".into()],
            timeout_secs: 30,
            scratch_dir: None,
            context_lines: 10,
        }
    }
}

impl ExecConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// File-name glob for watched files.
    pub pattern: String,
    pub interval_ms: u64,
    pub debounce_ms: u64,
    pub upload_cooldown_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            pattern: "*.py".into(),
            interval_ms: 800,
            debounce_ms: 500,
            upload_cooldown_ms: 2000,
        }
    }
}

impl WatchConfig {
    /// Tick period; never zero.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn upload_cooldown(&self) -> Duration {
        Duration::from_millis(self.upload_cooldown_ms)
    }
}

// ── Client ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub user_id: String,
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub watch: WatchConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            user_id: "local".into(),
            poll_attempts: 30,
            poll_interval_ms: 2000,
            request_timeout_secs: 30,
            watch: WatchConfig::default(),
        }
    }
}
