//! Configuration management
//!
//! One TOML file with `[server]`, `[client]` and `[protocol]` sections. Every
//! field has a default so a partial file is valid.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::KdfBinding;
use crate::error::{ProtocolError, ProtocolResult};
use crate::{MAX_FIELD_LEN, MIN_FIELD_LEN};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Name the server presents; must match its certificate subject
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Certificate authority that issued the server certificate
    #[serde(default = "default_authority")]
    pub authority: String,

    /// Directory holding `server.crt`, `server.key` and `<user>.pub`
    #[serde(default = "default_identity_dir")]
    pub identity_dir: PathBuf,

    /// Registered usernames
    #[serde(default)]
    pub users: Vec<String>,

    /// Per-user directories live under this root
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server to connect to
    #[serde(default = "default_listen")]
    pub server: SocketAddr,

    #[serde(default)]
    pub username: Option<String>,

    /// Directory holding `<user>.key` and `ca.pub`
    #[serde(default = "default_identity_dir")]
    pub identity_dir: PathBuf,

    /// Name the server certificate must carry
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Certificate authority trusted to vouch for the server
    #[serde(default = "default_authority")]
    pub authority: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Largest accepted variable-length field, in bytes
    #[serde(default = "default_max_field_len")]
    pub max_field_len: usize,

    /// Read timeout in seconds
    #[serde(default = "default_timeout")]
    pub read_timeout_secs: u64,

    /// Write timeout in seconds
    #[serde(default = "default_timeout")]
    pub write_timeout_secs: u64,

    #[serde(default)]
    pub kdf_binding: KdfBinding,
}

// Default value functions
fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4433))
}
fn default_server_name() -> String {
    "secure-transfer-server".to_string()
}
fn default_authority() -> String {
    "secure-transfer-ca".to_string()
}
fn default_identity_dir() -> PathBuf {
    PathBuf::from("./identities")
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("./storage")
}
fn default_max_field_len() -> usize {
    MAX_FIELD_LEN
}
fn default_timeout() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            name: default_server_name(),
            authority: default_authority(),
            identity_dir: default_identity_dir(),
            users: Vec::new(),
            storage_root: default_storage_root(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_listen(),
            username: None,
            identity_dir: default_identity_dir(),
            server_name: default_server_name(),
            authority: default_authority(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_field_len: default_max_field_len(),
            read_timeout_secs: default_timeout(),
            write_timeout_secs: default_timeout(),
            kdf_binding: KdfBinding::default(),
        }
    }
}

impl ProtocolConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Field lengths travel as u16. Below [`MIN_FIELD_LEN`] a rename request
    /// no longer fits in one field.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.max_field_len < MIN_FIELD_LEN || self.max_field_len > u16::MAX as usize {
            return Err(ProtocolError::ConfigError(format!(
                "max_field_len must be between {} and {}, got {}",
                MIN_FIELD_LEN,
                u16::MAX,
                self.max_field_len
            )));
        }
        Ok(())
    }
}

impl Config {
    pub fn validate(&self) -> ProtocolResult<()> {
        self.protocol.validate()?;
        if self.server.name.is_empty() {
            return Err(ProtocolError::ConfigError(
                "server name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> ProtocolResult<Config> {
    let content = fs::read_to_string(path).map_err(|e| {
        ProtocolError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
    })?;
    let config: Config = toml::from_str(&content).map_err(|e| {
        ProtocolError::ConfigError(format!("Invalid config {}: {}", path.display(), e))
    })?;
    config.validate()?;
    Ok(config)
}

/// Generate a sample configuration file
pub fn generate_sample() -> String {
    toml::to_string_pretty(&Config::default()).unwrap_or_default()
}
