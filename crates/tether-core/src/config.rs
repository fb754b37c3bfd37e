//! Configuration system for tether.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TETHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tether/config.toml
//!   3. ~/.config/tether/config.toml

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::record::close_code;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Prompt printed before each interactive command.
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    /// 0 = OS-assigned.
    pub port: u16,
    /// Query parameter carrying the inbound connection id.
    pub id_param: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    /// How long to wait for the peer's close reply before dropping the socket.
    pub close_timeout_ms: u64,
    /// How long `run` waits for connections to drain after `stop`.
    pub drain_timeout_ms: u64,
    /// `Server` header sent on accepted handshakes. Empty = none.
    pub server_banner: String,
}

/// Close code and reason used when an endpoint shuts down with live peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub client_code: u16,
    pub client_reason: String,
    pub server_code: u16,
    pub server_reason: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            prompt: "Enter command: ".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8082,
            id_param: "id".to_string(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            close_timeout_ms: 5_000,
            drain_timeout_ms: 5_000,
            server_banner: format!("tether/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            client_code: close_code::GOING_AWAY,
            client_reason: "client shutting down".to_string(),
            server_code: close_code::NORMAL,
            server_reason: "Terminating connection...".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tether")
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

impl TetherConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load a specific file without env overrides. Missing file = defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(TetherConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TETHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&TetherConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply TETHER_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("TETHER_SERVER__BIND_ADDR") {
            if let Ok(addr) = v.parse() {
                self.server.bind_addr = addr;
            }
        }
        if let Some(v) = var("TETHER_SERVER__PORT") {
            if let Ok(p) = v.parse() {
                self.server.port = p;
            }
        }
        if let Some(v) = var("TETHER_SERVER__ID_PARAM") {
            if !v.is_empty() {
                self.server.id_param = v;
            }
        }
        if let Some(v) = var("TETHER_TRANSPORT__CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.transport.connect_timeout_ms = ms;
            }
        }
        if let Some(v) = var("TETHER_TRANSPORT__CLOSE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.transport.close_timeout_ms = ms;
            }
        }
        if let Some(v) = var("TETHER_TRANSPORT__DRAIN_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.transport.drain_timeout_ms = ms;
            }
        }
    }
}
