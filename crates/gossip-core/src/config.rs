//! Configuration system for gossip nodes and the directory.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $GOSSIP_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/gossip/config.toml
//!   3. ~/.config/gossip/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub directory: DirectoryConfig,
    pub node: NodeConfig,
    pub identify: IdentifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Directory host nodes dial.
    pub host: String,
    /// Directory port nodes dial.
    pub port: u16,
    /// How often a disconnected node retries the directory.
    pub reconnect_interval_ms: u64,
    /// Port the directory server listens on.
    pub listen_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Chat listening port. 0 = random port in the range below.
    pub chat_port: u16,
    pub port_range_start: u16,
    pub port_range_len: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifyConfig {
    /// Lookups retried after the first miss before an inbound HELLO is dropped.
    pub retry_attempts: u32,
    /// Fixed delay between lookups.
    pub retry_backoff_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            reconnect_interval_ms: 2000,
            listen_port: 8080,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chat_port: 0,
            port_range_start: 9000,
            port_range_len: 1000,
        }
    }
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 5,
            retry_backoff_ms: 1000,
        }
    }
}

impl DirectoryConfig {
    /// `host:port` string to dial.
    pub fn dial_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

impl IdentifyConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("gossip")
}

fn dirs_or_home() -> PathBuf {
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

impl GossipConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            GossipConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("GOSSIP_CONFIG")
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
            let text = toml::to_string_pretty(&GossipConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply GOSSIP_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GOSSIP_DIRECTORY__HOST") {
            self.directory.host = v;
        }
        if let Ok(v) = std::env::var("GOSSIP_DIRECTORY__PORT") {
            if let Ok(p) = v.parse() {
                self.directory.port = p;
            }
        }
        if let Ok(v) = std::env::var("GOSSIP_DIRECTORY__LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.directory.listen_port = p;
            }
        }
        if let Ok(v) = std::env::var("GOSSIP_NODE__CHAT_PORT") {
            if let Ok(p) = v.parse() {
                self.node.chat_port = p;
            }
        }
        if let Ok(v) = std::env::var("GOSSIP_IDENTIFY__RETRY_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                self.identify.retry_attempts = n;
            }
        }
        if let Ok(v) = std::env::var("GOSSIP_IDENTIFY__RETRY_BACKOFF_MS") {
            if let Ok(ms) = v.parse() {
                self.identify.retry_backoff_ms = ms;
            }
        }
    }
}
