//! Configuration for the registry and messaging nodes.
//!
//! Resolution order: environment variables → config file → defaults.
//! Command-line arguments, where given, override all three.
//!
//! Config file location:
//!   1. $OVERLAY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/overlay/config.toml
//!   3. ~/.config/overlay/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub registry: RegistryConfig,
    pub node: NodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Address the registry binds.
    pub listen_host: String,
    /// TCP port the registry listens on.
    pub port: u16,
    /// Overlay construction restarts before giving up.
    pub topology_attempts: u32,
    /// How long `start` waits for every node to finish its burst.
    pub round_timeout_ms: u64,
    /// How long to keep polling summaries until sent == received.
    pub quiescence_timeout_ms: u64,
    /// Delay between summary polls.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Host this node registers under. Must match the address the registry
    /// sees the connection coming from.
    pub advertise_host: String,
    /// Port for neighbor connections. 0 = OS-assigned.
    pub listen_port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            port: 5050,
            topology_attempts: 10_000,
            round_timeout_ms: 30_000,
            quiescence_timeout_ms: 10_000,
            poll_interval_ms: 250,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            advertise_host: "127.0.0.1".to_string(),
            listen_port: 0,
        }
    }
}

impl RegistryConfig {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn quiescence_timeout(&self) -> Duration {
        Duration::from_millis(self.quiescence_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("overlay")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl OverlayConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            OverlayConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("OVERLAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&OverlayConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply OVERLAY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("OVERLAY_REGISTRY__LISTEN_HOST") {
            self.registry.listen_host = v;
        }
        if let Some(p) = lookup("OVERLAY_REGISTRY__PORT").and_then(|v| v.parse().ok()) {
            self.registry.port = p;
        }
        if let Some(n) = lookup("OVERLAY_REGISTRY__TOPOLOGY_ATTEMPTS").and_then(|v| v.parse().ok())
        {
            self.registry.topology_attempts = n;
        }
        if let Some(v) = lookup("OVERLAY_NODE__ADVERTISE_HOST") {
            self.node.advertise_host = v;
        }
        if let Some(p) = lookup("OVERLAY_NODE__LISTEN_PORT").and_then(|v| v.parse().ok()) {
            self.node.listen_port = p;
        }
    }
}
