use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use anyhow::{bail, Context, Result};

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:8090";
pub const DEFAULT_CONFIG_FILE: &str = "mindmapd.toml";

/// Creation-time options of one session. Fixed for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub charttype: String,
    pub turbo_mode: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            charttype: "auto".to_string(),
            turbo_mode: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process document per session
    Memory,
    /// One helper process per session, JSON lines over stdio
    Process,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Program and arguments for the `process` backend
    pub command: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Memory,
            command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub session_idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub shutdown_grace_ms: u64,
    pub max_frame_size: usize,
    pub startup_failure_hold_secs: u64,
    pub backend: BackendConfig,
    pub default_session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            session_idle_ttl_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
            shutdown_grace_ms: 2000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            startup_failure_hold_secs: 10,
            backend: BackendConfig::default(),
            default_session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("failed to write config {}", path.as_ref().display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_idle_ttl_secs == 0 {
            bail!("session_idle_ttl_secs must be greater than zero");
        }
        if self.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be greater than zero");
        }
        if self.max_frame_size == 0 {
            bail!("max_frame_size must be greater than zero");
        }
        if self.backend.kind == BackendKind::Process && self.backend.command.is_empty() {
            bail!("the process backend needs a non-empty backend.command");
        }
        Ok(())
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.session_idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
