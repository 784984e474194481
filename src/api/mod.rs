// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Node daemon REST API and per-server WebSocket
//!
//! Every route except `/api/health` requires the node's daemon token, as
//! `Authorization: Bearer` on REST and `?token=` on the WebSocket.

use actix_files::NamedFile;
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{web, HttpRequest, HttpResponse};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::{constant_time_eq, require_token};
use crate::backup::BackupEngine;
use crate::config::NodeConfig;
use crate::containers::docker::DockerRuntime;
use crate::containers::validate_server_id;
use crate::error::{AxisError, Result};
use crate::lifecycle::Engine;
use crate::modpack::ModpackInstaller;
use crate::monitoring::{SystemInfo, SystemMonitor};
use crate::pairing::Pairing;
use crate::protocol::PairRequest;

mod backups;
mod files;
mod servers;
mod ws;

/// Request bodies up to 100 GiB (archive imports)
pub const MAX_BODY_BYTES: usize = 100 * 1024 * 1024 * 1024;
/// JSON bodies: a full editor save after escaping
pub const MAX_JSON_BYTES: usize = 4 * crate::files::MAX_EDIT_BYTES as usize;

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(MAX_JSON_BYTES)
        .error_handler(|err, _req| AxisError::invalid(err.to_string()).into())
}

/// Shared application state
pub struct AppState {
    pub engine: Arc<Engine>,
    pub backups: Arc<BackupEngine>,
    pub modpacks: Arc<ModpackInstaller>,
    pub monitor: Mutex<SystemMonitor>,
    pub docker: Arc<DockerRuntime>,
    pub config: NodeConfig,
    daemon_token: String,
}

impl AppState {
    pub fn new(config: NodeConfig, docker: Arc<DockerRuntime>, engine: Arc<Engine>, backups: Arc<BackupEngine>) -> Result<Self> {
        let daemon_token = config.daemon_token()
            .ok_or_else(|| AxisError::Unauthorized("Node is not paired; run `axis pair` first".to_string()))?;
        Ok(Self {
            modpacks: Arc::new(ModpackInstaller::new(engine.clone())),
            engine,
            backups,
            monitor: Mutex::new(SystemMonitor::new()),
            docker,
            config,
            daemon_token,
        })
    }

    pub async fn system_info(&self) -> SystemInfo {
        let mut info = {
            let mut monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
            monitor.collect(&self.config.data_dir)
        };
        info.docker_version = self.docker.version().await;
        info
    }
}

// ─── Auth helpers ───

/// Bearer header, or `?token=` for WebSocket upgrades
pub fn require_auth(req: &HttpRequest, state: &AppState) -> Result<()> {
    let presented = require_token(req)?;
    if constant_time_eq(&presented, &state.daemon_token) {
        Ok(())
    } else {
        debug!("Rejected token from {:?}", req.peer_addr());
        Err(AxisError::Unauthorized("Invalid token".to_string()))
    }
}

fn server_id(raw: &str) -> Result<String> {
    validate_server_id(raw)?;
    Ok(raw.to_string())
}

fn ok_message(message: &str) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "success": true, "message": message }))
}

fn ok_data<T: serde::Serialize>(data: T) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "success": true, "data": data }))
}

/// Stream a file from disk as an attachment
async fn send_file(req: &HttpRequest, path: &Path) -> Result<HttpResponse> {
    let name = path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    let file = NamedFile::open_async(path).await?.set_content_disposition(ContentDisposition {
        disposition: DispositionType::Attachment,
        parameters: vec![DispositionParam::Filename(name)],
    });
    Ok(file.into_response(req))
}

// ─── System ───

/// GET /api/health
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /api/system
async fn system(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse> {
    require_auth(&req, &state)?;
    Ok(ok_data(state.system_info().await))
}

// ─── Heartbeat ───

/// Push system info to the panel every `heartbeat_interval_secs`
pub fn spawn_heartbeat(state: web::Data<AppState>) {
    let Some(panel_url) = state.config.panel_url.clone().filter(|u| !u.is_empty()) else {
        info!("No panel_url configured, heartbeat disabled");
        return;
    };
    let url = format!("{}/api/remote/heartbeat", panel_url.trim_end_matches('/'));
    let interval = Duration::from_secs(state.config.heartbeat_interval_secs.max(1));
    tokio::spawn(async move {
        let client = match reqwest::Client::builder().timeout(Duration::from_secs(10)).build() {
            Ok(c) => c,
            Err(e) => {
                warn!("Heartbeat client could not be built: {}", e);
                return;
            }
        };
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            let info = state.system_info().await;
            match client.post(&url).bearer_auth(&state.daemon_token).json(&info).send().await {
                Ok(resp) if resp.status().is_success() => debug!("Heartbeat sent to {}", url),
                Ok(resp) => warn!("Heartbeat rejected by panel: HTTP {}", resp.status()),
                Err(e) => warn!("Heartbeat to {} failed: {}", url, e),
            }
        }
    });
}

// ─── Pairing mode ───

/// POST /api/pair
async fn pair(pairing: web::Data<Arc<Pairing>>, body: web::Json<PairRequest>) -> HttpResponse {
    info!("Pairing request from {}", body.panel_url);
    let resp = pairing.handle(&body).await;
    if resp.success {
        HttpResponse::Ok().json(resp)
    } else {
        HttpResponse::Forbidden().json(resp)
    }
}

/// Routes served while `axis pair` is waiting for a panel
pub fn configure_pairing(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/health", web::get().to(health))
        .route("/api/pair", web::post().to(pair));
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
        .app_data(json_config())
        .route("/api/health", web::get().to(health))
        .route("/api/system", web::get().to(system))
        // Servers
        .route("/api/servers", web::post().to(servers::create))
        .route("/api/servers/{id}", web::delete().to(servers::delete))
        .route("/api/servers/{id}/start", web::post().to(servers::start))
        .route("/api/servers/{id}/stop", web::post().to(servers::stop))
        .route("/api/servers/{id}/kill", web::post().to(servers::kill))
        .route("/api/servers/{id}/restart", web::post().to(servers::restart))
        .route("/api/servers/{id}/reinstall", web::post().to(servers::reinstall))
        .route("/api/servers/{id}/command", web::post().to(servers::command))
        .route("/api/servers/{id}/status", web::get().to(servers::status))
        .route("/api/servers/{id}/logs", web::get().to(servers::logs))
        .route("/api/servers/{id}/logs/full", web::get().to(servers::logs_full))
        .route("/api/servers/{id}/logs/search", web::get().to(servers::logs_search))
        .route("/api/servers/{id}/modpack/install", web::post().to(servers::modpack_install))
        .route("/api/servers/{id}/ws", web::get().to(ws::server_ws))
        // Files
        .route("/api/servers/{id}/files", web::get().to(files::list_or_read))
        .route("/api/servers/{id}/files", web::delete().to(files::delete))
        .route("/api/servers/{id}/files/download", web::get().to(files::download))
        .route("/api/servers/{id}/files/folder", web::post().to(files::create_folder))
        .route("/api/servers/{id}/files/write", web::post().to(files::write))
        .route("/api/servers/{id}/files/upload", web::post().to(files::upload))
        .route("/api/servers/{id}/files/move", web::post().to(files::rename))
        .route("/api/servers/{id}/files/copy", web::post().to(files::copy))
        .route("/api/servers/{id}/files/compress", web::post().to(files::compress))
        .route("/api/servers/{id}/files/decompress", web::post().to(files::decompress))
        .route("/api/servers/{id}/files/download-url", web::post().to(files::download_url))
        .route("/api/servers/{id}/files/bulk-delete", web::post().to(files::bulk_delete))
        .route("/api/servers/{id}/files/bulk-copy", web::post().to(files::bulk_copy))
        .route("/api/servers/{id}/files/bulk-move", web::post().to(files::bulk_move))
        // Backups
        .route("/api/servers/{id}/backups", web::get().to(backups::list))
        .route("/api/servers/{id}/backups", web::post().to(backups::create))
        .route("/api/servers/{id}/backups/{backup}", web::delete().to(backups::delete))
        .route("/api/servers/{id}/backups/{backup}/download", web::get().to(backups::download))
        .route("/api/servers/{id}/backups/{backup}/restore", web::post().to(backups::restore))
        // Transfer
        .route("/api/servers/{id}/archive", web::post().to(backups::archive))
        .route("/api/servers/{id}/archive/download", web::get().to(backups::archive_download))
        .route("/api/servers/{id}/archive", web::delete().to(backups::archive_delete))
        .route("/api/servers/{id}/import", web::post().to(backups::import));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::mock::FakeRuntime;
    use crate::logbus::LogBus;
    use actix_web::{test, App};
    use tempfile::TempDir;

    pub(super) fn state(dir: &TempDir, rt: &FakeRuntime) -> web::Data<AppState> {
        state_with(dir, rt, |_| {})
    }

    pub(super) fn state_with(dir: &TempDir, rt: &FakeRuntime, tweak: impl FnOnce(&mut NodeConfig)) -> web::Data<AppState> {
        let mut config = NodeConfig::default();
        config.data_dir = dir.path().join("volumes");
        config.backup_dir = dir.path().join("backups");
        config.token_id = "abcd".into();
        config.token = "secret".into();
        tweak(&mut config);
        let engine = Arc::new(Engine::new(Arc::new(rt.clone()), Arc::new(LogBus::new()), config.data_dir.clone()));
        let backups = Arc::new(BackupEngine::new(engine.clone(), config.backup_dir.clone()));
        let docker = Arc::new(DockerRuntime::new("docker", "/nonexistent.sock"));
        web::Data::new(AppState::new(config, docker, engine, backups).unwrap())
    }

    #[actix_web::test]
    async fn health_is_public_and_servers_are_not() {
        let dir = TempDir::new().unwrap();
        let rt = FakeRuntime::new();
        let app = test::init_service(App::new().app_data(state(&dir, &rt)).configure(configure)).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/api/health").to_request()).await;
        assert!(resp.status().is_success());

        let req = test::TestRequest::get().uri("/api/servers/s1/status").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 401);

        let req = test::TestRequest::get().uri("/api/servers/s1/status")
            .insert_header(("Authorization", "Bearer abcd.wrong")).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 401);

        let req = test::TestRequest::get().uri("/api/servers/s1/status")
            .insert_header(("Authorization", "Bearer abcd.secret")).to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["status"], "offline");
    }

    #[actix_web::test]
    async fn malformed_server_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let rt = FakeRuntime::new();
        let app = test::init_service(App::new().app_data(state(&dir, &rt)).configure(configure)).await;
        let req = test::TestRequest::post().uri("/api/servers/bad.id/start")
            .insert_header(("Authorization", "Bearer abcd.secret")).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 400);
    }

    #[::core::prelude::v1::test]
    fn unpaired_node_has_no_state() {
        let dir = TempDir::new().unwrap();
        let rt = FakeRuntime::new();
        let engine = Arc::new(Engine::new(Arc::new(rt), Arc::new(LogBus::new()), dir.path().to_path_buf()));
        let backups = Arc::new(BackupEngine::new(engine.clone(), dir.path().join("b")));
        let docker = Arc::new(DockerRuntime::new("docker", "/nonexistent.sock"));
        assert!(AppState::new(NodeConfig::default(), docker, engine, backups).is_err());
    }
}
