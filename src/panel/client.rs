// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Panel side of the node API
//!
//! The panel never touches containers. Every server operation is turned
//! into a request to the owning node, and `build_config` is the one place
//! where package defaults and server overrides are merged.

use actix_web::web::Bytes;
use reqwest::Method;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::nodes::node_http_client;
use super::store::{Node, Package, PanelStore, Server};
use super::ws::connect_node_ws;
use crate::error::{AxisError, Result};
use crate::protocol::{
    CommandRequest, ImportRequest, PortMapping, PortProtocol, ServerConfig, ServerStats, ServerStatus, StopOptions,
    WsMessage,
};

/// Proxied calls; archive transfers use a client without a timeout
pub const PROXY_TIMEOUT: Duration = Duration::from_secs(120);

/// Merge a package with a server's overrides into what the node runs
pub fn build_config(server: &Server, pkg: &Package) -> ServerConfig {
    let mut ports: Vec<PortMapping> = pkg.ports.iter().enumerate().map(|(i, spec)| PortMapping {
        host_port: server.ports.get(i).map(|p| p.port).unwrap_or(spec.port),
        container_port: spec.port,
        protocol: spec.protocol,
    }).collect();
    // Additional allocations map straight through
    ports.extend(server.ports.iter().skip(pkg.ports.len()).map(|p| PortMapping {
        host_port: p.port,
        container_port: p.port,
        protocol: PortProtocol::Both,
    }));

    let mut variables: BTreeMap<String, String> = pkg.variables.iter()
        .map(|v| (v.name.clone(), v.default.clone()))
        .collect();
    variables.extend(server.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
    if let Some(first) = ports.first() {
        variables.insert("SERVER_PORT".to_string(), first.container_port.to_string());
    }
    variables.insert("SERVER_MEMORY".to_string(), server.memory.to_string());

    let pick = |own: &str, fallback: &str| if own.trim().is_empty() { fallback.to_string() } else { own.to_string() };

    ServerConfig {
        id: server.id.clone(),
        docker_image: pick(&server.docker_image, &pkg.docker_image),
        startup: pick(&server.startup, &pkg.startup),
        memory: server.memory,
        cpu: server.cpu,
        disk: server.disk,
        ports,
        variables,
        install_script: pkg.install_script.clone(),
        install_image: pkg.install_image.clone(),
        stop_signal: pkg.stop_signal.clone(),
        stop_command: pkg.stop_command.clone(),
        stop_timeout: pkg.stop_timeout,
        config_files: pkg.config_files.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
    Kill,
}

impl std::str::FromStr for PowerAction {
    type Err = AxisError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "kill" => Ok(Self::Kill),
            other => Err(AxisError::invalid(format!("Unknown power action: {}", other))),
        }
    }
}

/// Raw node answer
#[derive(Debug)]
pub struct NodeResponse {
    pub status: u16,
    pub body: Bytes,
}

impl NodeResponse {
    fn error_message(&self) -> String {
        serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| v["error"].as_str().map(str::to_string))
            .unwrap_or_else(|| format!("Node returned HTTP {}", self.status))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Map a node failure onto the matching error kind
    pub fn into_error(self) -> AxisError {
        match self.status {
            400 => AxisError::invalid(self.error_message()),
            401 | 403 => AxisError::NodeUnreachable("Node rejected the panel's token".to_string()),
            404 => AxisError::not_found(self.error_message()),
            409 => AxisError::conflict(self.error_message()),
            _ => AxisError::driver(self.error_message()),
        }
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_success() { Ok(self) } else { Err(self.into_error()) }
    }

    /// `data` of a `{success, data}` body
    pub fn data<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let v: serde_json::Value = serde_json::from_slice(&self.body)?;
        Ok(serde_json::from_value(v["data"].clone())?)
    }
}

pub struct NodeClient {
    store: Arc<PanelStore>,
    http: reqwest::Client,
    transfer_http: reqwest::Client,
    accept_invalid_certs: bool,
}

impl NodeClient {
    pub fn new(store: Arc<PanelStore>, accept_invalid_certs: bool) -> Result<Self> {
        Ok(Self {
            store,
            http: node_http_client(accept_invalid_certs, Some(PROXY_TIMEOUT))?,
            transfer_http: node_http_client(accept_invalid_certs, None)?,
            accept_invalid_certs,
        })
    }

    pub fn store(&self) -> &Arc<PanelStore> {
        &self.store
    }

    pub fn accepts_invalid_certs(&self) -> bool {
        self.accept_invalid_certs
    }

    /// Server row with its node
    pub fn locate(&self, server_id: &str) -> Result<(Server, Node)> {
        let server = self.store.server(server_id)?;
        let node = self.store.node(&server.node_id)?;
        Ok((server, node))
    }

    pub fn config_for(&self, server_id: &str) -> Result<ServerConfig> {
        let server = self.store.server(server_id)?;
        let pkg = self.store.package(&server.package_id)?;
        Ok(build_config(&server, &pkg))
    }

    // ─── Raw proxying ───

    /// Send to `path` on `node` with the daemon token. Transport errors are
    /// `NodeUnreachable`; HTTP errors come back as a response.
    pub async fn request<B: Serialize + ?Sized>(
        &self,
        node: &Node,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<NodeResponse> {
        self.send(&self.http, node, method, path, body).await
    }

    /// Like `request` but without the proxy timeout
    pub async fn request_long<B: Serialize + ?Sized>(
        &self,
        node: &Node,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<NodeResponse> {
        self.send(&self.transfer_http, node, method, path, body).await
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        client: &reqwest::Client,
        node: &Node,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<NodeResponse> {
        let url = format!("{}{}", node.base_url(), path);
        debug!("{} {}", method, url);
        let mut req = client.request(method, &url).bearer_auth(&node.daemon_token);
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        Ok(NodeResponse { status, body })
    }

    /// `suffix` is relative to `/api/servers/{id}` and may carry a query
    pub async fn proxy(&self, server_id: &str, method: Method, suffix: &str, body: Option<&serde_json::Value>) -> Result<NodeResponse> {
        let (_, node) = self.locate(server_id)?;
        self.request(&node, method, &format!("/api/servers/{}{}", server_id, suffix), body).await
    }

    /// Forward a body untouched, keeping its content type (multipart uploads)
    pub async fn proxy_raw(&self, server_id: &str, method: Method, suffix: &str, content_type: Option<&str>, body: Bytes) -> Result<NodeResponse> {
        let (_, node) = self.locate(server_id)?;
        let url = format!("{}/api/servers/{}{}", node.base_url(), server_id, suffix);
        let mut req = self.transfer_http.request(method, &url).bearer_auth(&node.daemon_token);
        if let Some(ct) = content_type {
            req = req.header(reqwest::header::CONTENT_TYPE, ct);
        }
        let resp = req.body(body.to_vec()).send().await?;
        let status = resp.status().as_u16();
        Ok(NodeResponse { status, body: resp.bytes().await? })
    }

    /// Live response for streaming a download through to the user
    pub async fn stream_download(&self, server_id: &str, suffix: &str) -> Result<reqwest::Response> {
        let (_, node) = self.locate(server_id)?;
        let url = format!("{}/api/servers/{}{}", node.base_url(), server_id, suffix);
        let resp = self.transfer_http.get(&url).bearer_auth(&node.daemon_token).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.bytes().await.unwrap_or_default();
            return Err(NodeResponse { status, body }.into_error());
        }
        Ok(resp)
    }

    /// Node URL with the daemon token in the query, for browser redirects
    pub fn presigned_url(&self, node: &Node, path: &str) -> String {
        let sep = if path.contains('?') { '&' } else { '?' };
        format!("{}{}{}token={}", node.base_url(), path, sep, urlencoding::encode(&node.daemon_token))
    }

    // ─── Lifecycle ───

    /// Create on the node; provisioning continues there in the background
    pub async fn create_server(&self, server_id: &str, start_on_completion: bool) -> Result<()> {
        let (_, node) = self.locate(server_id)?;
        let mut body = serde_json::to_value(self.config_for(server_id)?)?;
        body["start_on_completion"] = serde_json::Value::Bool(start_on_completion);
        self.request(&node, Method::POST, "/api/servers", Some(&body)).await?.into_result()?;
        info!("Server {} submitted to node {}", server_id, node.name);
        Ok(())
    }

    /// Start with the current config so the node recreates a missing container
    pub async fn start(&self, server_id: &str) -> Result<()> {
        let body = serde_json::to_value(self.config_for(server_id)?)?;
        self.proxy(server_id, Method::POST, "/start", Some(&body)).await?.into_result()?;
        Ok(())
    }

    fn stop_options(&self, server_id: &str) -> Result<serde_json::Value> {
        let cfg = self.config_for(server_id)?;
        Ok(serde_json::to_value(StopOptions {
            stop_command: cfg.stop_command,
            stop_signal: Some(cfg.stop_signal),
            stop_timeout: Some(cfg.stop_timeout),
        })?)
    }

    pub async fn stop(&self, server_id: &str) -> Result<()> {
        let body = self.stop_options(server_id)?;
        self.proxy(server_id, Method::POST, "/stop", Some(&body)).await?.into_result()?;
        Ok(())
    }

    pub async fn restart(&self, server_id: &str) -> Result<()> {
        let body = self.stop_options(server_id)?;
        self.proxy(server_id, Method::POST, "/restart", Some(&body)).await?.into_result()?;
        Ok(())
    }

    pub async fn kill(&self, server_id: &str) -> Result<()> {
        self.proxy(server_id, Method::POST, "/kill", None).await?.into_result()?;
        Ok(())
    }

    /// Dispatch a power action and record the resulting state on the row
    pub async fn power(&self, server_id: &str, action: PowerAction) -> Result<()> {
        match action {
            PowerAction::Start => self.start(server_id).await?,
            PowerAction::Stop => self.stop(server_id).await?,
            PowerAction::Restart => self.restart(server_id).await?,
            PowerAction::Kill => self.kill(server_id).await?,
        }
        let status = match action {
            PowerAction::Start | PowerAction::Restart => ServerStatus::Running,
            PowerAction::Stop | PowerAction::Kill => ServerStatus::Stopped,
        };
        self.store.update_server(server_id, |s| s.status = status)?;
        info!("Power {:?} sent for {}", action, server_id);
        Ok(())
    }

    pub async fn reinstall(&self, server_id: &str) -> Result<()> {
        let body = serde_json::to_value(self.config_for(server_id)?)?;
        self.proxy(server_id, Method::POST, "/reinstall", Some(&body)).await?.into_result()?;
        Ok(())
    }

    pub async fn delete_on_node(&self, server_id: &str) -> Result<()> {
        self.proxy(server_id, Method::DELETE, "", None).await?.into_result()?;
        Ok(())
    }

    pub async fn send_command(&self, server_id: &str, command: &str) -> Result<()> {
        let body = serde_json::to_value(CommandRequest { command: command.to_string() })?;
        self.proxy(server_id, Method::POST, "/command", Some(&body)).await?.into_result()?;
        Ok(())
    }

    pub async fn status(&self, server_id: &str) -> Result<(ServerStatus, Option<ServerStats>)> {
        #[derive(serde::Deserialize)]
        struct StatusBody {
            status: ServerStatus,
            stats: Option<ServerStats>,
        }
        let resp = self.proxy(server_id, Method::GET, "/status", None).await?.into_result()?;
        let body: StatusBody = resp.data()?;
        Ok((body.status, body.stats))
    }

    pub async fn create_backup(&self, server_id: &str, name: Option<&str>) -> Result<()> {
        let body = serde_json::json!({ "name": name });
        self.proxy(server_id, Method::POST, "/backups", Some(&body)).await?.into_result()?;
        Ok(())
    }

    // ─── Transfer legs ───

    pub async fn create_archive(&self, node: &Node, server_id: &str) -> Result<()> {
        let path = format!("/api/servers/{}/archive", server_id);
        self.request_long::<()>(node, Method::POST, &path, None).await?.into_result()?;
        Ok(())
    }

    /// Ask `target` to pull the archive straight from `source`
    pub async fn import_from(&self, target: &Node, source: &Node, server_id: &str) -> Result<()> {
        let body = ImportRequest {
            url: format!("{}/api/servers/{}/archive/download", source.base_url(), server_id),
            token: source.daemon_token.clone(),
        };
        let path = format!("/api/servers/{}/import", server_id);
        self.request_long(target, Method::POST, &path, Some(&body)).await?.into_result()?;
        Ok(())
    }

    pub async fn delete_archive(&self, node: &Node, server_id: &str) -> Result<()> {
        let path = format!("/api/servers/{}/archive", server_id);
        self.request::<()>(node, Method::DELETE, &path, None).await?.into_result()?;
        Ok(())
    }

    pub async fn delete_from(&self, node: &Node, server_id: &str) -> Result<()> {
        let path = format!("/api/servers/{}", server_id);
        self.request::<()>(node, Method::DELETE, &path, None).await?.into_result()?;
        Ok(())
    }

    // ─── Console subscription ───

    /// Follow a server's console; log lines arrive on the channel until the
    /// node closes or the receiver is dropped
    pub async fn subscribe_console(&self, server_id: &str) -> Result<mpsc::Receiver<String>> {
        use futures::StreamExt;
        use tokio_tungstenite::tungstenite::Message;

        let (_, node) = self.locate(server_id)?;
        let stream = connect_node_ws(&node, server_id, self.accept_invalid_certs).await?;
        let (tx, rx) = mpsc::channel(256);
        let id = server_id.to_string();
        tokio::spawn(async move {
            let (_sink, mut source) = stream.split();
            while let Some(Ok(msg)) = source.next().await {
                let Message::Text(text) = msg else { continue };
                if let Ok(WsMessage::Log { data }) = serde_json::from_str::<WsMessage>(&text) {
                    if tx.send(data).await.is_err() {
                        break;
                    }
                }
            }
            debug!("Console subscription for {} ended", id);
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::store::tests::{node, package, seeded, server};
    use crate::panel::store::ServerPort;

    #[test]
    fn config_merges_package_and_server() {
        let pkg = package("p1");
        let mut srv = server("s1", "alice", "n1", "p1");
        srv.ports = vec![
            ServerPort { port: 27001, primary: true },
            ServerPort { port: 27002, primary: false },
            ServerPort { port: 27003, primary: false },
        ];
        srv.variables.insert("VERSION".into(), "1.21.1".into());
        srv.docker_image = "ghcr.io/games/java:17".into();

        let cfg = build_config(&srv, &pkg);
        assert_eq!(cfg.id, "s1");
        assert_eq!(cfg.docker_image, "ghcr.io/games/java:17");
        assert_eq!(cfg.startup, pkg.startup);
        assert_eq!(cfg.ports.len(), 3);
        assert_eq!((cfg.ports[0].host_port, cfg.ports[0].container_port), (27001, 25565));
        assert_eq!((cfg.ports[1].host_port, cfg.ports[1].container_port), (27002, 25575));
        assert_eq!((cfg.ports[2].host_port, cfg.ports[2].container_port), (27003, 27003));
        assert_eq!(cfg.variables["VERSION"], "1.21.1");
        assert_eq!(cfg.variables["EULA"], "true");
        assert_eq!(cfg.variables["SERVER_PORT"], "25565");
        assert_eq!(cfg.variables["SERVER_MEMORY"], "2048");
        assert_eq!(cfg.stop_command.as_deref(), Some("stop"));
        assert_eq!(cfg.stop_timeout, 30);
    }

    #[test]
    fn missing_server_ports_fall_back_to_package_defaults() {
        let pkg = package("p1");
        let mut srv = server("s1", "alice", "n1", "p1");
        srv.ports.clear();
        let cfg = build_config(&srv, &pkg);
        assert_eq!(cfg.ports[0].host_port, 25565);
        assert_eq!(cfg.ports[1].host_port, 25575);
    }

    #[test]
    fn node_errors_map_to_kinds() {
        let r = |status: u16, body: &str| NodeResponse { status, body: Bytes::from(body.to_string()) };
        assert!(r(200, "{}").into_result().is_ok());
        match r(404, r#"{"success":false,"error":"Server container does not exist"}"#).into_result() {
            Err(AxisError::NotFound(m)) => assert_eq!(m, "Server container does not exist"),
            other => panic!("unexpected {:?}", other.map(|r| r.status)),
        }
        assert!(matches!(r(401, "").into_result(), Err(AxisError::NodeUnreachable(_))));
        assert!(matches!(r(409, "").into_result(), Err(AxisError::Conflict(_))));
        assert!(matches!(r(500, "oops").into_result(), Err(AxisError::Driver(_))));
    }

    #[test]
    fn power_actions_parse() {
        assert_eq!("restart".parse::<PowerAction>().unwrap(), PowerAction::Restart);
        assert!(matches!("reboot".parse::<PowerAction>(), Err(AxisError::InvalidInput(_))));
    }

    #[test]
    fn presigned_urls_carry_the_token() {
        let client = NodeClient::new(Arc::new(seeded()), false).unwrap();
        let n = node("n1");
        assert_eq!(
            client.presigned_url(&n, "/api/servers/s1/backups/b1/download"),
            "https://n1.example.com:8443/api/servers/s1/backups/b1/download?token=abcd1234ef567890.secret"
        );
        assert!(client.presigned_url(&n, "/x?a=1").contains("?a=1&token="));
    }
}
