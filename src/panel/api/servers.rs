// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Panel server routes: create, power, console and transfer

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, info, warn};

use super::{accepted, authenticate, ok_data, ok_message, require_admin, require_permission, require_visible};
use crate::error::{AxisError, Result};
use crate::panel::client::PowerAction;
use crate::panel::permissions::{
    can_see_server, check_quota, CONSOLE_READ, CONSOLE_WRITE, POWER_KILL, POWER_RESTART, POWER_START, POWER_STOP,
    REINSTALL,
};
use crate::panel::ports::{allocate_ports, used_ports};
use crate::panel::store::{new_id, Server};
use crate::panel::PanelState;
use crate::protocol::{CommandRequest, ServerStatus};

const MAX_EXTRA_PORTS: usize = 10;
const MAX_BULK_DELETE: usize = 100;

#[derive(Deserialize)]
pub struct CreateServer {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub package_id: String,
    pub node_id: String,
    /// Admins may create on behalf of another user
    #[serde(default)]
    pub owner_id: Option<String>,
    pub memory: u64,
    pub cpu: u64,
    pub disk: u64,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub docker_image: Option<String>,
    #[serde(default)]
    pub startup: Option<String>,
    /// Allocations beyond what the package declares
    #[serde(default)]
    pub extra_ports: usize,
    #[serde(default = "default_true")]
    pub start_on_completion: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
pub struct PowerRequest {
    pub action: PowerAction,
}

#[derive(Deserialize)]
pub struct TransferRequest {
    pub node_id: String,
}

#[derive(Deserialize)]
pub struct BulkDelete {
    pub ids: Vec<String>,
}

#[derive(Deserialize)]
pub struct DeleteQuery {
    /// Drop the row even when the node cannot be reached
    #[serde(default)]
    pub force: bool,
}

#[derive(Serialize)]
struct BulkResult {
    id: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// GET /api/servers
pub async fn list(req: HttpRequest, state: web::Data<PanelState>) -> Result<HttpResponse> {
    let user = authenticate(&req, &state)?;
    let servers: Vec<Server> = state.store.read(|d| {
        d.servers.values().filter(|s| can_see_server(d, &user, &s.id)).cloned().collect()
    });
    Ok(ok_data(servers))
}

/// GET /api/servers/{id}
pub async fn get(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>) -> Result<HttpResponse> {
    require_visible(&req, &state, &path)?;
    Ok(ok_data(state.store.server(&path)?))
}

/// Validate a create request; returns the row and how many ports it needs
fn plan_server(state: &PanelState, user_id: &str, is_admin: bool, req: CreateServer) -> Result<(Server, usize)> {
    if req.name.trim().is_empty() {
        return Err(AxisError::invalid("Server name is required"));
    }
    if req.memory == 0 {
        return Err(AxisError::invalid("memory must be greater than zero"));
    }
    if req.extra_ports > MAX_EXTRA_PORTS {
        return Err(AxisError::invalid(format!("At most {} extra ports", MAX_EXTRA_PORTS)));
    }
    let owner_id = match req.owner_id {
        Some(owner) if is_admin => owner,
        Some(_) => return Err(AxisError::forbidden("Only admins can create servers for other users")),
        None => user_id.to_string(),
    };
    let pkg = state.store.package(&req.package_id)?;
    state.store.node(&req.node_id)?;

    for name in req.variables.keys() {
        let spec = pkg.variables.iter().find(|v| &v.name == name)
            .ok_or_else(|| AxisError::invalid(format!("Unknown variable: {}", name)))?;
        if !spec.user_editable && !is_admin {
            return Err(AxisError::forbidden(format!("Variable {} is not editable", name)));
        }
    }
    let docker_image = req.docker_image.unwrap_or_default();
    if !docker_image.is_empty() && !pkg.image_editable && !is_admin {
        return Err(AxisError::forbidden("This package does not allow a custom image"));
    }
    let startup = req.startup.unwrap_or_default();
    if !startup.is_empty() && !pkg.startup_editable && !is_admin {
        return Err(AxisError::forbidden("This package does not allow a custom startup command"));
    }

    // One slot per package port, at least one
    let slots = pkg.ports.len().max(1) + req.extra_ports;
    let server = Server {
        id: new_id(),
        owner_id,
        node_id: req.node_id,
        package_id: req.package_id,
        name: req.name.trim().to_string(),
        description: req.description,
        memory: req.memory,
        cpu: req.cpu,
        disk: req.disk,
        startup,
        docker_image,
        variables: req.variables,
        ports: Vec::new(),
        status: ServerStatus::Installing,
        is_suspended: false,
        created_at: Utc::now(),
    };
    Ok((server, slots))
}

/// POST /api/servers: 202 once the node accepted; install continues there
pub async fn create(req: HttpRequest, state: web::Data<PanelState>, body: web::Json<CreateServer>) -> Result<HttpResponse> {
    let user = authenticate(&req, &state)?;
    let body = body.into_inner();
    let start = body.start_on_completion;
    let (mut server, slots) = plan_server(&state, &user.id, user.is_admin, body)?;
    let defaults = state.config.default_limits.clone();

    let server = state.store.write(|d| {
        let owner = d.users.get(&server.owner_id).ok_or_else(|| AxisError::not_found("Owner not found"))?;
        check_quota(d, owner, &defaults, server.memory, server.cpu, server.disk)?;
        server.ports = allocate_ports(&used_ports(d, &server.node_id, None), slots)?;
        d.servers.insert(server.id.clone(), server.clone());
        Ok(server)
    })?;

    if let Err(e) = state.client.create_server(&server.id, start).await {
        error!("Node refused server {}: {}", server.id, e);
        state.store.write_logged("server rollback", |d| {
            d.servers.remove(&server.id);
            Ok(())
        });
        return Err(e);
    }
    info!("Server {} ({}) created for {} on {}", server.name, server.id, server.owner_id, server.node_id);
    Ok(accepted(server))
}

async fn delete_one(state: &PanelState, id: &str, force: bool) -> Result<()> {
    match state.client.delete_on_node(id).await {
        Ok(()) | Err(AxisError::NotFound(_)) => {}
        Err(e) if force => warn!("Deleting {} without the node: {}", id, e),
        Err(e) => return Err(e),
    }
    state.databases.delete_all(id).await;
    let schedules: Vec<String> = state.store.read(|d| {
        d.schedules.values().filter(|s| s.server_id == id).map(|s| s.id.clone()).collect()
    });
    for sid in schedules {
        state.scheduler.disarm(&sid);
    }
    state.store.delete_server(id)?;
    info!("Server {} deleted", id);
    Ok(())
}

/// DELETE /api/servers/{id}[?force=true]
pub async fn delete(
    req: HttpRequest,
    state: web::Data<PanelState>,
    path: web::Path<String>,
    query: web::Query<DeleteQuery>,
) -> Result<HttpResponse> {
    let user = require_visible(&req, &state, &path)?;
    let owner = state.store.server(&path)?.owner_id == user.id;
    if !(owner || user.is_admin) {
        return Err(AxisError::forbidden("Only the server owner can delete it"));
    }
    delete_one(&state, &path, query.force && user.is_admin).await?;
    Ok(ok_message("Server deleted"))
}

/// POST /api/servers/bulk-delete: one task per server, all awaited
pub async fn bulk_delete(req: HttpRequest, state: web::Data<PanelState>, body: web::Json<BulkDelete>) -> Result<HttpResponse> {
    require_admin(&req, &state)?;
    if body.ids.len() > MAX_BULK_DELETE {
        return Err(AxisError::invalid(format!("At most {} servers per request", MAX_BULK_DELETE)));
    }
    let tasks = body.ids.iter().map(|id| {
        let state = state.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let outcome = delete_one(&state, &id, false).await;
            BulkResult { id, success: outcome.is_ok(), error: outcome.err().map(|e| e.to_string()) }
        })
    });
    let results: Vec<BulkResult> = futures::future::join_all(tasks).await
        .into_iter()
        .zip(body.ids.iter())
        .map(|(joined, id)| joined.unwrap_or_else(|e| BulkResult {
            id: id.clone(),
            success: false,
            error: Some(format!("Task failed: {}", e)),
        }))
        .collect();
    Ok(ok_data(results))
}

/// POST /api/servers/{id}/power
pub async fn power(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>, body: web::Json<PowerRequest>) -> Result<HttpResponse> {
    let perm = match body.action {
        PowerAction::Start => POWER_START,
        PowerAction::Stop => POWER_STOP,
        PowerAction::Restart => POWER_RESTART,
        PowerAction::Kill => POWER_KILL,
    };
    require_permission(&req, &state, &path, perm)?;
    if state.store.server(&path)?.is_suspended {
        return Err(AxisError::Locked("Server is suspended".to_string()));
    }
    state.client.power(&path, body.action).await?;
    Ok(ok_message("Power action sent"))
}

/// POST /api/servers/{id}/reinstall
pub async fn reinstall(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>) -> Result<HttpResponse> {
    require_permission(&req, &state, &path, REINSTALL)?;
    state.client.reinstall(&path).await?;
    state.store.update_server(&path, |s| s.status = ServerStatus::Installing)?;
    Ok(HttpResponse::Accepted().json(serde_json::json!({ "success": true, "message": "Reinstall started" })))
}

/// POST /api/servers/{id}/command
pub async fn command(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>, body: web::Json<CommandRequest>) -> Result<HttpResponse> {
    require_permission(&req, &state, &path, CONSOLE_WRITE)?;
    state.client.send_command(&path, &body.command).await?;
    Ok(ok_message("Command sent"))
}

/// GET /api/servers/{id}/status: also refreshes the stored status
pub async fn status(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>) -> Result<HttpResponse> {
    require_visible(&req, &state, &path)?;
    let (status, stats) = match state.client.status(&path).await {
        Ok(found) => found,
        Err(AxisError::NodeUnreachable(_)) => (ServerStatus::Offline, None),
        Err(e) => return Err(e),
    };
    if status != ServerStatus::Offline {
        state.store.write_logged("server status", |d| {
            if let Some(s) = d.servers.get_mut(path.as_str()) {
                s.status = status;
            }
            Ok(())
        });
    }
    Ok(ok_data(serde_json::json!({ "status": status, "stats": stats })))
}

/// GET /api/servers/{id}/logs: query string is passed through
pub async fn logs(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>) -> Result<HttpResponse> {
    require_permission(&req, &state, &path, CONSOLE_READ)?;
    let suffix = match req.query_string() {
        "" => "/logs".to_string(),
        q => format!("/logs?{}", q),
    };
    let resp = state.client.proxy(&path, Method::GET, &suffix, None).await?.into_result()?;
    Ok(HttpResponse::Ok().content_type("application/json").body(resp.body))
}

/// POST /api/servers/{id}/transfer
pub async fn transfer(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>, body: web::Json<TransferRequest>) -> Result<HttpResponse> {
    require_admin(&req, &state)?;
    let status = state.transfers.start(&path, &body.node_id)?;
    Ok(accepted(status))
}
