// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Wire types exchanged between the panel and node daemons.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything a node needs to create, start or reinstall one server.
/// Assembled by the panel from package + server state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub id: String,
    pub docker_image: String,
    pub startup: String,
    /// MiB
    #[serde(default)]
    pub memory: u64,
    /// Hundredths of a core
    #[serde(default)]
    pub cpu: u64,
    /// MiB
    #[serde(default)]
    pub disk: u64,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub install_script: Option<String>,
    #[serde(default)]
    pub install_image: Option<String>,
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,
    #[serde(default)]
    pub stop_command: Option<String>,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,
    #[serde(default)]
    pub config_files: Vec<ConfigFilePatch>,
}

pub fn default_stop_signal() -> String { "SIGTERM".to_string() }
pub fn default_stop_timeout() -> u64 { 30 }

impl ServerConfig {
    pub fn has_install_script(&self) -> bool {
        self.install_script.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    #[default]
    Tcp,
    Udp,
    Both,
}

impl PortProtocol {
    pub fn docker_suffixes(&self) -> &'static [&'static str] {
        match self {
            Self::Tcp => &["tcp"],
            Self::Udp => &["udp"],
            Self::Both => &["tcp", "udp"],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default)]
    pub protocol: PortProtocol,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigParser {
    Properties,
    Json,
}

/// Key replacements applied to a file in the data dir before container creation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigFilePatch {
    pub file: String,
    pub parser: ConfigParser,
    #[serde(default)]
    pub replace: BTreeMap<String, String>,
}

/// Body of /stop and /restart; every field falls back to the cached config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopOptions {
    #[serde(default)]
    pub stop_command: Option<String>,
    #[serde(default)]
    pub stop_signal: Option<String>,
    #[serde(default)]
    pub stop_timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Installing,
    Running,
    Stopped,
    Failed,
    Offline,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerStats {
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub cpu_percent: f64,
    pub disk_usage: u64,
    pub net_rx: u64,
    pub net_tx: u64,
}

/// Frames on the per-server WebSocket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsMessage {
    Log { data: String },
    Status { status: ServerStatus },
    Stats { stats: ServerStats },
    /// Client to server only
    Command { command: String },
}

impl WsMessage {
    pub fn log(data: impl Into<String>) -> Self {
        Self::Log { data: data.into() }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRequest {
    pub panel_url: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PairResponse {
    pub fn rejected(error: &str) -> Self {
        Self { success: false, token_id: None, token: None, error: Some(error.to_string()) }
    }
}

/// Body of POST /api/servers/:id/import when the target pulls from the source node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRequest {
    pub url: String,
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_messages_use_type_tag() {
        let json = WsMessage::log("hello").to_json();
        assert_eq!(json, r#"{"type":"log","data":"hello"}"#);

        let json = WsMessage::Status { status: ServerStatus::Running }.to_json();
        assert_eq!(json, r#"{"type":"status","status":"running"}"#);

        let parsed: WsMessage = serde_json::from_str(r#"{"type":"command","command":"say hi"}"#).unwrap();
        assert_eq!(parsed, WsMessage::Command { command: "say hi".into() });
    }

    #[test]
    fn stats_frame_field_names() {
        let msg = WsMessage::Stats { stats: ServerStats { memory_usage: 1, memory_limit: 2, cpu_percent: 0.5, disk_usage: 3, net_rx: 4, net_tx: 5 } };
        let v: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(v["stats"]["memory_limit"], 2);
        assert_eq!(v["stats"]["net_tx"], 5);
    }

    #[test]
    fn server_config_defaults_stop_policy() {
        let cfg: ServerConfig = serde_json::from_str(r#"{"id":"s1","docker_image":"img","startup":"java"}"#).unwrap();
        assert_eq!(cfg.stop_signal, "SIGTERM");
        assert_eq!(cfg.stop_timeout, 30);
        assert!(!cfg.has_install_script());
    }

    #[test]
    fn pair_rejection_omits_tokens() {
        let json = serde_json::to_string(&PairResponse::rejected("Pairing rejected by user")).unwrap();
        assert_eq!(json, r#"{"success":false,"error":"Pairing rejected by user"}"#);
    }
}
