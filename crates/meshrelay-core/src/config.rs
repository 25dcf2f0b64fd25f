//! Configuration management for meshrelay.
//!
//! The config file lives at a platform-appropriate location:
//! - Linux: `~/.config/meshrelay/config.toml`
//! - macOS: `~/Library/Application Support/meshrelay/config.toml`
//!
//! On first run, no config file exists; the daemon creates one from
//! CLI-supplied defaults (nick, ports, and the local overlay address).
//!
//! # Config File Format (TOML)
//!
//! ```toml
//! nick = "alice"
//! my_address = "fc00::1"
//! chat_port = 6667
//! mesh_port = 14627
//! admin_port = 11234
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Conventional IRC client port; the chat front end listens here by default.
pub const DEFAULT_CHAT_PORT: u16 = 6667;

/// Mesh peer-to-peer datagram port, carried over from the original relay.
pub const DEFAULT_MESH_PORT: u16 = 14627;

/// Overlay admin service port (`cjdns`-style), carried over from the
/// original relay.
pub const DEFAULT_ADMIN_PORT: u16 = 11234;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file at {path}: {source}")]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to write config file at {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("could not determine config directory for this platform")]
    NoConfigDir,
}

/// The persisted configuration for this meshrelay node.
///
/// `my_address` has no default: discovering the local overlay address is
/// out of scope for this daemon (the original scans the host's interface
/// list for an address in the overlay's reserved prefix). If absent, the
/// daemon is expected to exit at startup with a diagnostic rather than
/// guess.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    /// The node's chat nick, used both on the local chat protocol and as
    /// the identity announced in mesh greetings.
    pub nick: String,

    /// This node's canonical overlay address, as discovered or configured
    /// out-of-band. `None` until set; required before the daemon starts
    /// servicing peers.
    #[serde(default)]
    pub my_address: Option<String>,

    /// Loopback TCP port the chat front end listens on.
    #[serde(default = "default_chat_port")]
    pub chat_port: u16,

    /// UDP port used for mesh peer datagrams.
    #[serde(default = "default_mesh_port")]
    pub mesh_port: u16,

    /// UDP port of the local overlay admin service.
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
}

fn default_chat_port() -> u16 {
    DEFAULT_CHAT_PORT
}

fn default_mesh_port() -> u16 {
    DEFAULT_MESH_PORT
}

fn default_admin_port() -> u16 {
    DEFAULT_ADMIN_PORT
}

impl AppConfig {
    /// Returns the platform-appropriate config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("meshrelay"))
    }

    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("config.toml"))
    }

    /// Platform-appropriate data directory, used for the optional log file.
    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("meshrelay"))
    }

    pub fn default_log_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::data_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("meshrelay.log"))
    }

    /// Loads the config from the default config file path.
    ///
    /// Returns `Ok(None)` if the config file doesn't exist yet (first run).
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let path = Self::config_file_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_owned(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseFile {
            path: path.to_owned(),
            source: e,
        })?;
        Ok(Some(config))
    }

    /// Saves this config to the default config file path, creating the
    /// parent directory if needed.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_file_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
                path: path.to_owned(),
                source: e,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::WriteFile {
            path: path.to_owned(),
            source: e,
        })?;
        Ok(())
    }

    /// Builds a first-run config with default ports and no address set.
    pub fn new_first_run(nick: impl Into<String>) -> Self {
        Self {
            nick: nick.into(),
            my_address: None,
            chat_port: DEFAULT_CHAT_PORT,
            mesh_port: DEFAULT_MESH_PORT,
            admin_port: DEFAULT_ADMIN_PORT,
        }
    }
}
