//! Client configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use torshare_core::TorConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path
    pub data_dir: String,

    /// Tor configuration
    pub tor: TorSection,

    /// Transfer configuration
    pub transfer: TransferConfig,

    /// Receiving configuration
    pub receive: ReceiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TorSection {
    /// Host of the Tor SOCKS and control ports
    pub socks_host: String,
    /// SOCKS5 proxy port
    pub socks_port: u16,
    /// Control port
    pub control_port: u16,
    /// Control port password
    pub control_password: Option<String>,
    /// Tor binary launched when no proxy is running; empty disables launching
    pub tor_binary: Option<String>,
    /// How long to wait for the proxy to come up, in seconds
    pub ready_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size in bytes
    pub chunk_size: u32,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Timeout for each protocol read, in seconds
    pub io_timeout_secs: u64,
    /// Maximum concurrent inbound sessions
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    /// Listening port
    pub port: u16,
    /// Where received files are stored
    pub download_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.torshare".to_string(),
            tor: TorSection::default(),
            transfer: TransferConfig::default(),
            receive: ReceiveConfig::default(),
        }
    }
}

impl Default for TorSection {
    fn default() -> Self {
        Self {
            socks_host: "127.0.0.1".to_string(),
            socks_port: 9050,
            control_port: 9051,
            control_password: None,
            tor_binary: Some("tor".to_string()),
            ready_timeout_secs: 30,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: torshare_core::CHUNK_SIZE,
            connect_timeout_secs: 30,
            io_timeout_secs: 120,
            max_sessions: 16,
        }
    }
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            download_dir: "~/.torshare/downloads".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults if it does not exist
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Write configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }

    pub fn download_dir(&self) -> PathBuf {
        expand_path(&self.receive.download_dir)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.io_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.tor.ready_timeout_secs)
    }

    /// Settings for the Tor transport
    pub fn tor_config(&self) -> TorConfig {
        TorConfig {
            host: self.tor.socks_host.clone(),
            socks_port: self.tor.socks_port,
            control_port: self.tor.control_port,
            control_password: self.tor.control_password.clone(),
            tor_binary: self
                .tor
                .tor_binary
                .as_deref()
                .filter(|b| !b.is_empty())
                .map(expand_path),
            connect_timeout: self.connect_timeout(),
            ..TorConfig::default()
        }
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
