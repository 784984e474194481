// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Node registry: node records, daemon tokens, heartbeats and liveness
//!
//! `is_online` is never trusted from storage; it is derived from
//! `last_heartbeat` every time a node is read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::store::{new_id, Node, PanelStore};
use crate::auth::{issue_node_token, sha256_hex, split_daemon_token, verify_daemon_token, IssuedToken};
use crate::error::{AxisError, Result};
use crate::monitoring::SystemInfo;
use crate::protocol::{PairRequest, PairResponse};

pub const LIVENESS_WINDOW_SECS: i64 = 45;
/// The node waits up to 90 s for its operator, so the pair call must outlive that
const PAIR_TIMEOUT: Duration = Duration::from_secs(120);
const REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

pub fn is_online(last_heartbeat: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last_heartbeat.is_some_and(|t| (now - t).num_seconds() < LIVENESS_WINDOW_SECS)
}

/// Node as shown to admins; secrets stay behind
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: String,
    pub name: String,
    pub fqdn: String,
    pub port: u16,
    pub scheme: String,
    pub icon: Option<String>,
    pub display_ip: Option<String>,
    pub is_online: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub system_info: Option<SystemInfo>,
    pub auth_error: bool,
    pub server_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewNode {
    pub name: String,
    pub fqdn: String,
    #[serde(default = "default_node_port")]
    pub port: u16,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub display_ip: Option<String>,
}

fn default_node_port() -> u16 {
    8443
}

fn default_scheme() -> String {
    "https".to_string()
}

impl NewNode {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.fqdn.trim().is_empty() {
            return Err(AxisError::invalid("name and fqdn are required"));
        }
        if !matches!(self.scheme.as_str(), "http" | "https") {
            return Err(AxisError::invalid("scheme must be http or https"));
        }
        if self.fqdn.contains(['/', ' ', '@']) {
            return Err(AxisError::invalid("Invalid fqdn"));
        }
        Ok(())
    }

    fn into_node(self, issued: &IssuedToken) -> Node {
        Node {
            id: new_id(),
            name: self.name.trim().to_string(),
            fqdn: self.fqdn.trim().to_string(),
            port: self.port,
            scheme: self.scheme,
            token_id: issued.token_id.clone(),
            token_hash: issued.token_hash(),
            daemon_token: issued.daemon_token(),
            icon: self.icon,
            display_ip: self.display_ip,
            last_heartbeat: None,
            system_info: None,
            auth_error: false,
            is_online: false,
        }
    }
}

/// Build the HTTP client the panel uses for every node call
pub fn node_http_client(accept_invalid_certs: bool, timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .danger_accept_invalid_certs(accept_invalid_certs)
        .connect_timeout(Duration::from_secs(10));
    if let Some(t) = timeout {
        builder = builder.timeout(t);
    }
    builder.build().map_err(|e| AxisError::internal(format!("HTTP client: {}", e)))
}

pub struct NodeRegistry {
    store: Arc<PanelStore>,
    http: reqwest::Client,
}

impl NodeRegistry {
    pub fn new(store: Arc<PanelStore>, accept_invalid_certs: bool) -> Result<Self> {
        Ok(Self { store, http: node_http_client(accept_invalid_certs, None)? })
    }

    fn view(node: &Node, server_count: usize, now: DateTime<Utc>) -> NodeView {
        NodeView {
            id: node.id.clone(),
            name: node.name.clone(),
            fqdn: node.fqdn.clone(),
            port: node.port,
            scheme: node.scheme.clone(),
            icon: node.icon.clone(),
            display_ip: node.display_ip.clone(),
            is_online: is_online(node.last_heartbeat, now),
            last_heartbeat: node.last_heartbeat,
            system_info: node.system_info.clone(),
            auth_error: node.auth_error,
            server_count,
        }
    }

    pub fn list(&self) -> Vec<NodeView> {
        let now = Utc::now();
        self.store.read(|d| {
            d.nodes.values()
                .map(|n| Self::view(n, d.servers_on_node(&n.id).count(), now))
                .collect()
        })
    }

    pub fn get(&self, id: &str) -> Result<NodeView> {
        let now = Utc::now();
        self.store.read(|d| d.nodes.get(id).map(|n| Self::view(n, d.servers_on_node(id).count(), now)))
            .ok_or_else(|| AxisError::not_found("Node not found"))
    }

    /// Admin creates the node record; the returned daemon token goes into
    /// the node's config by hand. Shown once.
    pub fn create_direct(&self, req: NewNode) -> Result<(NodeView, String)> {
        req.validate()?;
        let issued = issue_node_token();
        let node = self.store.add_node(req.into_node(&issued))?;
        info!("Node {} ({}) created", node.name, node.id);
        Ok((Self::view(&node, 0, Utc::now()), issued.daemon_token()))
    }

    /// Pair with a node showing `code`; the node issues the token
    pub async fn pair(&self, req: NewNode, code: &str, panel_url: &str) -> Result<NodeView> {
        req.validate()?;
        let url = format!("{}://{}:{}/api/pair", req.scheme, req.fqdn, req.port);
        let body = PairRequest { panel_url: panel_url.to_string(), code: code.trim().to_string() };
        let resp = self.http.post(&url).timeout(PAIR_TIMEOUT).json(&body).send().await?;
        let status = resp.status();
        let pair: PairResponse = resp.json().await
            .map_err(|e| AxisError::NodeUnreachable(format!("Bad pairing response (HTTP {}): {}", status, e)))?;
        if !pair.success {
            let reason = pair.error.unwrap_or_else(|| format!("HTTP {}", status));
            warn!("Pairing with {} refused: {}", url, reason);
            return Err(AxisError::forbidden(reason));
        }
        let (Some(token_id), Some(token)) = (pair.token_id, pair.token) else {
            return Err(AxisError::NodeUnreachable("Pairing response is missing the token".to_string()));
        };

        let issued = IssuedToken { token_id, token };
        let node = self.store.add_node(req.into_node(&issued))?;
        info!("Paired node {} ({}) at {}", node.name, node.id, url);
        Ok(Self::view(&node, 0, Utc::now()))
    }

    /// New token pair; the plaintext daemon token is returned once
    pub fn reset_token(&self, id: &str) -> Result<String> {
        let issued = issue_node_token();
        self.store.write(|d| {
            let node = d.nodes.get_mut(id).ok_or_else(|| AxisError::not_found("Node not found"))?;
            node.token_id = issued.token_id.clone();
            node.token_hash = sha256_hex(&issued.token);
            node.daemon_token = issued.daemon_token();
            node.auth_error = false;
            Ok(())
        })?;
        info!("Token for node {} reset", id);
        Ok(issued.daemon_token())
    }

    /// Node id owning this daemon token, if it checks out
    pub fn validate(&self, presented: &str) -> Option<String> {
        let (token_id, _) = split_daemon_token(presented)?;
        self.store.read(|d| {
            d.nodes.values()
                .find(|n| n.token_id == token_id)
                .filter(|n| verify_daemon_token(presented, &n.token_id, &n.token_hash))
                .map(|n| n.id.clone())
        })
    }

    pub fn record_heartbeat(&self, id: &str, info: SystemInfo) -> Result<()> {
        self.store.write(|d| {
            let node = d.nodes.get_mut(id).ok_or_else(|| AxisError::not_found("Node not found"))?;
            node.last_heartbeat = Some(Utc::now());
            node.system_info = Some(info);
            node.auth_error = false;
            Ok(())
        })
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.store.delete_node(id)?;
        info!("Node {} deleted", id);
        Ok(())
    }

    /// Poll every node's `/api/system` in parallel
    pub async fn refresh_all(&self) {
        let nodes: Vec<Node> = self.store.read(|d| d.nodes.values().cloned().collect());
        futures::future::join_all(nodes.iter().map(|n| self.refresh_one(n))).await;
    }

    async fn refresh_one(&self, node: &Node) {
        let url = format!("{}/api/system", node.base_url());
        let resp = self.http.get(&url)
            .bearer_auth(&node.daemon_token)
            .timeout(REFRESH_TIMEOUT)
            .send()
            .await;
        let outcome = match resp {
            Ok(r) if r.status().is_success() => {
                let body: Option<serde_json::Value> = r.json().await.ok();
                body.and_then(|b| serde_json::from_value::<SystemInfo>(b["data"].clone()).ok()).map(Ok)
            }
            Ok(r) if matches!(r.status().as_u16(), 401 | 403) => Some(Err(())),
            Ok(r) => {
                debug!("Node {} answered HTTP {}", node.name, r.status());
                None
            }
            Err(e) => {
                debug!("Node {} unreachable: {}", node.name, e);
                None
            }
        };

        match outcome {
            Some(Ok(info)) => {
                if let Err(e) = self.record_heartbeat(&node.id, info) {
                    debug!("Heartbeat for {} not stored: {}", node.id, e);
                }
            }
            Some(Err(())) => {
                warn!("Node {} rejected the panel's token", node.name);
                self.store.write_logged("node auth flag", |d| {
                    if let Some(n) = d.nodes.get_mut(&node.id) {
                        n.auth_error = true;
                    }
                    Ok(())
                });
            }
            // Offline is derived from the stale heartbeat
            None => {}
        }
    }

    pub fn spawn_refresher(self: &Arc<Self>, interval: Duration) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval.max(Duration::from_secs(1)));
            loop {
                tick.tick().await;
                registry.refresh_all().await;
            }
        });
    }
}
