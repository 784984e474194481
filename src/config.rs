// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Configuration files for the node daemon and the panel.
//!
//! Both are TOML. A missing file means "all defaults"; pairing writes the
//! issued token back into the node file.
//!
//! ```toml
//! # /etc/axis/node.toml
//! port = 8443
//! data_dir = "/var/lib/axis/volumes"
//! backup_dir = "/var/lib/axis/backups"
//! token_id = "abcd1234ef567890"
//! token = "deadbeef..."
//! panel_url = "https://panel.example.com"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const NODE_CONFIG_PATH: &str = "/etc/axis/node.toml";
pub const PANEL_CONFIG_PATH: &str = "/etc/axis/panel.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub bind: String,
    pub port: u16,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Root for per-server bind mounts
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub docker_bin: String,
    pub docker_socket: String,
    pub token_id: String,
    pub token: String,
    /// Panel that paired this node; heartbeats go here
    pub panel_url: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub log_level: Option<String>,
    /// Largest single file accepted through the upload route
    pub max_upload_bytes: u64,
    /// Accept self-signed certificates when pulling transfer archives from other nodes
    pub accept_invalid_node_certs: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8443,
            tls_cert: None,
            tls_key: None,
            data_dir: PathBuf::from("/var/lib/axis/volumes"),
            backup_dir: PathBuf::from("/var/lib/axis/backups"),
            docker_bin: "docker".to_string(),
            docker_socket: "/var/run/docker.sock".to_string(),
            token_id: String::new(),
            token: String::new(),
            panel_url: None,
            heartbeat_interval_secs: 15,
            log_level: None,
            max_upload_bytes: crate::files::MAX_UPLOAD_BYTES,
            accept_invalid_node_certs: false,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        load_toml(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        save_toml(path, self)
    }

    /// `<token_id>.<token>`, what the panel presents as its bearer
    pub fn daemon_token(&self) -> Option<String> {
        if self.token_id.is_empty() || self.token.is_empty() {
            None
        } else {
            Some(format!("{}.{}", self.token_id, self.token))
        }
    }
}

/// Resource defaults applied to users without their own overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultLimits {
    /// MiB
    pub ram: Option<u64>,
    /// Hundredths of a core
    pub cpu: Option<u64>,
    /// MiB
    pub disk: Option<u64>,
    pub servers: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub bind: String,
    pub port: u16,
    /// Externally reachable URL of the panel, sent to nodes during pairing
    pub public_url: String,
    pub state_file: PathBuf,
    pub node_refresh_interval_secs: u64,
    pub default_limits: DefaultLimits,
    /// Accept self-signed certificates on node WebSocket legs
    pub accept_invalid_node_certs: bool,
    pub log_level: Option<String>,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            public_url: "http://localhost:8080".to_string(),
            state_file: PathBuf::from("/var/lib/axis/panel.json"),
            node_refresh_interval_secs: 15,
            default_limits: DefaultLimits::default(),
            accept_invalid_node_certs: false,
            log_level: None,
        }
    }
}

impl PanelConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        load_toml(path)
    }
}

fn load_toml<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> Result<T, String> {
    match fs::read_to_string(path) {
        Ok(data) => toml::from_str(&data)
            .map_err(|e| format!("Invalid config {}: {}", path.display(), e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No config at {}, using defaults", path.display());
            Ok(T::default())
        }
        Err(e) => Err(format!("Cannot read {}: {}", path.display(), e)),
    }
}

fn save_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| format!("Failed to create config dir: {}", e))?;
    }
    let text = toml::to_string_pretty(value)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, text).map_err(|e| format!("Failed to write {}: {}", path.display(), e))
}
