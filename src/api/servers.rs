// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Server lifecycle routes

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use tracing::{error, info};

use super::{ok_data, ok_message, require_auth, server_id, AppState};
use crate::error::{AxisError, Result};
use crate::lifecycle::LogSearch;
use crate::modpack::ModpackRequest;
use crate::protocol::{CommandRequest, ServerConfig, ServerStatus, StopOptions};

const DEFAULT_LOG_LINES: usize = 100;
const MAX_LOG_LINES: usize = 5000;

#[derive(Deserialize)]
pub struct CreateRequest {
    #[serde(flatten)]
    pub config: ServerConfig,
    /// Start the server once the install finishes
    #[serde(default)]
    pub start_on_completion: bool,
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
}

/// POST /api/servers: provisioning runs in the background; poll status for `installing`
pub async fn create(req: HttpRequest, state: web::Data<AppState>, body: web::Json<CreateRequest>) -> Result<HttpResponse> {
    require_auth(&req, &state)?;
    let CreateRequest { config, start_on_completion } = body.into_inner();
    server_id(&config.id)?;
    if config.docker_image.trim().is_empty() {
        return Err(AxisError::invalid("docker_image is required"));
    }
    state.engine.files(&config.id).ensure_root()?;

    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.create(&config).await {
            error!("Create of {} failed: {}", config.id, e);
            return;
        }
        if start_on_completion {
            if let Err(e) = engine.start(&config.id).await {
                error!("Start of {} after create failed: {}", config.id, e);
            }
        }
    });
    Ok(HttpResponse::Accepted().json(serde_json::json!({
        "success": true,
        "message": "Server is being created",
    })))
}

/// POST /api/servers/{id}/start: an optional ServerConfig body recreates the container first
pub async fn start(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: Option<web::Json<ServerConfig>>,
) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    match body {
        Some(cfg) => {
            let mut cfg = cfg.into_inner();
            cfg.id = id.clone();
            state.engine.start_with_config(&cfg).await?;
        }
        None => state.engine.start(&id).await?,
    }
    Ok(ok_message("Server started"))
}

pub async fn stop(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: Option<web::Json<StopOptions>>,
) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    let opts = body.map(|b| b.into_inner()).unwrap_or_default();
    state.engine.stop(&id, &opts).await?;
    Ok(ok_message("Server stopped"))
}

pub async fn kill(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    state.engine.kill(&id).await?;
    Ok(ok_message("Server killed"))
}

pub async fn restart(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: Option<web::Json<StopOptions>>,
) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    let opts = body.map(|b| b.into_inner()).unwrap_or_default();
    state.engine.restart(&id, &opts).await?;
    Ok(ok_message("Server restarted"))
}

/// POST /api/servers/{id}/reinstall: runs in the background like create
pub async fn reinstall(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ServerConfig>,
) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    if state.engine.is_installing(&id) {
        return Err(AxisError::conflict("Server is already installing"));
    }
    let mut cfg = body.into_inner();
    cfg.id = id;

    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.reinstall(&cfg).await {
            error!("Reinstall of {} failed: {}", cfg.id, e);
        }
    });
    Ok(HttpResponse::Accepted().json(serde_json::json!({
        "success": true,
        "message": "Server is being reinstalled",
    })))
}

pub async fn delete(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    state.engine.delete(&id).await?;
    if let Err(e) = state.backups.delete_archive(&id).await {
        info!("Archive cleanup for {}: {}", id, e);
    }
    Ok(ok_message("Server deleted"))
}

pub async fn command(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<CommandRequest>,
) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    if body.command.trim().is_empty() {
        return Err(AxisError::invalid("Command is empty"));
    }
    state.engine.send_command(&id, &body.command).await?;
    Ok(ok_message("Command sent"))
}

/// GET /api/servers/{id}/status: status plus stats when running, or the
/// install error when failed
pub async fn status(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    let status = state.engine.status(&id).await;
    let stats = if status == ServerStatus::Running { state.engine.stats(&id).await } else { None };
    let error = if status == ServerStatus::Failed { state.engine.failure(&id) } else { None };
    Ok(ok_data(serde_json::json!({ "status": status, "stats": stats, "error": error })))
}

pub async fn logs(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<LogsQuery>,
) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES).clamp(1, MAX_LOG_LINES);
    let logs = state.engine.recent_logs(&id, lines).await?;
    Ok(ok_data(logs))
}

/// GET /api/servers/{id}/logs/full: plain text
pub async fn logs_full(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    let logs = state.engine.full_logs(&id).await?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .insert_header(("Content-Disposition", format!("attachment; filename=\"{}.log\"", id)))
        .body(logs.join("\n")))
}

pub async fn logs_search(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<LogSearch>,
) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    let hits = state.engine.search_logs(&id, &query).await?;
    Ok(ok_data(serde_json::json!({ "count": hits.len(), "lines": hits })))
}

pub async fn modpack_install(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ModpackRequest>,
) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    state.modpacks.install(&id, body.into_inner())?;
    Ok(HttpResponse::Accepted().json(serde_json::json!({
        "success": true,
        "message": "Modpack installation started",
    })))
}

#[cfg(test)]
mod tests {
    use super::super::tests::state;
    use super::super::configure;
    use crate::containers::mock::FakeRuntime;
    use actix_web::{test, App};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    const AUTH: (&str, &str) = ("Authorization", "Bearer abcd.secret");

    #[actix_web::test]
    async fn create_start_command_stop() {
        let dir = TempDir::new().unwrap();
        let rt = FakeRuntime::new();
        let data = state(&dir, &rt);
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure)).await;

        let body = json!({
            "id": "s1",
            "docker_image": "ghcr.io/games/java:21",
            "startup": "java -jar server.jar",
            "stop_command": "stop",
        });
        let req = test::TestRequest::post().uri("/api/servers").insert_header(AUTH).set_json(&body).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 202);
        for _ in 0..100 {
            if rt.with(|s| s.containers.contains_key("axis-s1")) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let req = test::TestRequest::post().uri("/api/servers/s1/start").insert_header(AUTH).to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
        assert!(rt.is_running("axis-s1"));

        let req = test::TestRequest::post().uri("/api/servers/s1/command").insert_header(AUTH)
            .set_json(json!({"command": "say hi"})).to_request();
        assert!(test::call_service(&app, req).await.status().is_success());

        let req = test::TestRequest::get().uri("/api/servers/s1/status").insert_header(AUTH).to_request();
        let status: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status["data"]["status"], "running");

        let req = test::TestRequest::post().uri("/api/servers/s1/stop").insert_header(AUTH)
            .set_json(json!({"stop_timeout": 0})).to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
        assert!(!rt.is_running("axis-s1"));

        let req = test::TestRequest::post().uri("/api/servers/s1/command").insert_header(AUTH)
            .set_json(json!({"command": "say hi"})).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 409);
    }

    #[actix_web::test]
    async fn failed_install_is_reported_by_status() {
        let dir = TempDir::new().unwrap();
        let rt = FakeRuntime::new();
        rt.with(|s| s.install_exit_code = 3);
        let app = test::init_service(App::new().app_data(state(&dir, &rt)).configure(configure)).await;

        let body = json!({
            "id": "s9",
            "docker_image": "ghcr.io/games/java:21",
            "startup": "java -jar server.jar",
            "install_script": "exit 3",
            "start_on_completion": true,
        });
        let req = test::TestRequest::post().uri("/api/servers").insert_header(AUTH).set_json(&body).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 202);

        let mut status = Value::Null;
        for _ in 0..200 {
            let req = test::TestRequest::get().uri("/api/servers/s9/status").insert_header(AUTH).to_request();
            status = test::call_and_read_body_json(&app, req).await;
            if status["data"]["status"] == "failed" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(status["data"]["status"], "failed");
        assert_eq!(status["data"]["error"], "install script exited with code 3");
        assert!(!rt.with(|s| s.containers.contains_key("axis-s9")));
    }

    #[actix_web::test]
    async fn start_of_unknown_server_is_404() {
        let dir = TempDir::new().unwrap();
        let rt = FakeRuntime::new();
        let app = test::init_service(App::new().app_data(state(&dir, &rt)).configure(configure)).await;
        let req = test::TestRequest::post().uri("/api/servers/ghost/start").insert_header(AUTH).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], false);
    }
}
