// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Panel REST API
//!
//! Users authenticate with `Authorization: Bearer axp_...`. Nodes reach
//! the panel only through `/api/remote/heartbeat`, with their daemon token.

use actix_web::{web, HttpRequest, HttpResponse};
use tracing::debug;

use super::permissions::{can_see_server, has_server_permission};
use super::store::User;
use super::PanelState;
use crate::auth::{require_token, sha256_hex, USER_TOKEN_PREFIX};
use crate::error::{AxisError, Result};
use crate::monitoring::SystemInfo;

mod admin;
mod access;
mod proxy;
mod servers;

/// Uploads are forwarded whole, so the panel accepts bodies this large
pub const MAX_PANEL_BODY_BYTES: usize = 110 * 1024 * 1024;

// ─── Auth helpers ───

/// Resolve the calling user from a bearer (or `?token=`) API token
pub fn authenticate(req: &HttpRequest, state: &PanelState) -> Result<User> {
    let token = require_token(req)?;
    if !token.starts_with(USER_TOKEN_PREFIX) {
        return Err(AxisError::Unauthorized("Invalid token".to_string()));
    }
    let hash = sha256_hex(&token);
    state.store.read(|d| d.user_by_token_hash(&hash).cloned()).ok_or_else(|| {
        debug!("Unknown user token from {:?}", req.peer_addr());
        AxisError::Unauthorized("Invalid token".to_string())
    })
}

fn require_admin(req: &HttpRequest, state: &PanelState) -> Result<User> {
    let user = authenticate(req, state)?;
    if !user.is_admin {
        return Err(AxisError::forbidden("Administrator access required"));
    }
    Ok(user)
}

/// Servers the user cannot see are reported as missing
fn require_permission(req: &HttpRequest, state: &PanelState, server_id: &str, perm: &str) -> Result<User> {
    let user = authenticate(req, state)?;
    state.store.read(|d| {
        if !can_see_server(d, &user, server_id) {
            return Err(AxisError::not_found("Server not found"));
        }
        if !has_server_permission(d, &user, server_id, perm) {
            return Err(AxisError::forbidden(format!("Missing permission: {}", perm)));
        }
        Ok(())
    })?;
    Ok(user)
}

fn require_visible(req: &HttpRequest, state: &PanelState, server_id: &str) -> Result<User> {
    let user = authenticate(req, state)?;
    if !state.store.read(|d| can_see_server(d, &user, server_id)) {
        return Err(AxisError::not_found("Server not found"));
    }
    Ok(user)
}

/// Owner or admin; sub-user management is not delegable
fn require_owner(req: &HttpRequest, state: &PanelState, server_id: &str) -> Result<User> {
    let user = require_visible(req, state, server_id)?;
    let owner = state.store.read(|d| d.servers.get(server_id).map(|s| s.owner_id == user.id)).unwrap_or(false);
    if !(owner || user.is_admin) {
        return Err(AxisError::forbidden("Only the server owner can do this"));
    }
    Ok(user)
}

fn ok_message(message: &str) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "success": true, "message": message }))
}

fn ok_data<T: serde::Serialize>(data: T) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "success": true, "data": data }))
}

fn accepted<T: serde::Serialize>(data: T) -> HttpResponse {
    HttpResponse::Accepted().json(serde_json::json!({ "success": true, "data": data }))
}

// ─── System ───

/// GET /api/health
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "role": "panel",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /api/remote/heartbeat: bearer is the node's daemon token
async fn heartbeat(req: HttpRequest, state: web::Data<PanelState>, body: web::Json<SystemInfo>) -> Result<HttpResponse> {
    let presented = require_token(&req)?;
    let node_id = state.nodes.validate(&presented)
        .ok_or_else(|| AxisError::Unauthorized("Invalid node token".to_string()))?;
    state.nodes.record_heartbeat(&node_id, body.into_inner())?;
    Ok(ok_message("Heartbeat recorded"))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(MAX_PANEL_BODY_BYTES))
        .route("/api/health", web::get().to(health))
        .route("/api/remote/heartbeat", web::post().to(heartbeat))
        // Nodes
        .route("/api/nodes", web::get().to(admin::list_nodes))
        .route("/api/nodes", web::post().to(admin::create_node))
        .route("/api/nodes/pair", web::post().to(admin::pair_node))
        .route("/api/nodes/refresh", web::post().to(admin::refresh_nodes))
        .route("/api/nodes/{id}/reset-token", web::post().to(admin::reset_node_token))
        .route("/api/nodes/{id}", web::delete().to(admin::delete_node))
        // Packages
        .route("/api/packages", web::get().to(admin::list_packages))
        .route("/api/packages", web::post().to(admin::create_package))
        .route("/api/packages/{id}", web::delete().to(admin::delete_package))
        // Database hosts
        .route("/api/database-hosts", web::get().to(admin::list_db_hosts))
        .route("/api/database-hosts", web::post().to(admin::create_db_host))
        .route("/api/database-hosts/{id}", web::delete().to(admin::delete_db_host))
        // Transfers
        .route("/api/transfers/{id}", web::get().to(admin::transfer_status))
        // Servers
        .route("/api/servers", web::get().to(servers::list))
        .route("/api/servers", web::post().to(servers::create))
        .route("/api/servers/bulk-delete", web::post().to(servers::bulk_delete))
        .route("/api/servers/{id}", web::get().to(servers::get))
        .route("/api/servers/{id}", web::delete().to(servers::delete))
        .route("/api/servers/{id}/power", web::post().to(servers::power))
        .route("/api/servers/{id}/reinstall", web::post().to(servers::reinstall))
        .route("/api/servers/{id}/command", web::post().to(servers::command))
        .route("/api/servers/{id}/status", web::get().to(servers::status))
        .route("/api/servers/{id}/logs", web::get().to(servers::logs))
        .route("/api/servers/{id}/transfer", web::post().to(servers::transfer))
        .route("/api/servers/{id}/ws", web::get().to(super::ws::server_ws))
        // Files and backups live on the node
        .route("/api/servers/{id}/files", web::route().to(proxy::files))
        .route("/api/servers/{id}/files/{op}", web::route().to(proxy::files))
        .route("/api/servers/{id}/backups", web::get().to(proxy::list_backups))
        .route("/api/servers/{id}/backups", web::post().to(proxy::create_backup))
        .route("/api/servers/{id}/backups/{backup}", web::delete().to(proxy::delete_backup))
        .route("/api/servers/{id}/backups/{backup}/download", web::get().to(proxy::download_backup))
        .route("/api/servers/{id}/backups/{backup}/restore", web::post().to(proxy::restore_backup))
        // Sub-users
        .route("/api/servers/{id}/subusers", web::get().to(access::list_subusers))
        .route("/api/servers/{id}/subusers", web::post().to(access::add_subuser))
        .route("/api/servers/{id}/subusers/{user_id}", web::get().to(access::get_subuser))
        .route("/api/servers/{id}/subusers/{user_id}", web::put().to(access::update_subuser))
        .route("/api/servers/{id}/subusers/{user_id}", web::delete().to(access::remove_subuser))
        // Schedules
        .route("/api/servers/{id}/schedules", web::get().to(access::list_schedules))
        .route("/api/servers/{id}/schedules", web::post().to(access::create_schedule))
        .route("/api/servers/{id}/schedules/{sid}", web::get().to(access::get_schedule))
        .route("/api/servers/{id}/schedules/{sid}", web::put().to(access::update_schedule))
        .route("/api/servers/{id}/schedules/{sid}", web::delete().to(access::delete_schedule))
        .route("/api/servers/{id}/schedules/{sid}/run", web::post().to(access::run_schedule))
        // Databases
        .route("/api/servers/{id}/databases", web::get().to(access::list_databases))
        .route("/api/servers/{id}/databases", web::post().to(access::create_database))
        .route("/api/servers/{id}/databases/{db}", web::get().to(access::get_database))
        .route("/api/servers/{id}/databases/{db}", web::delete().to(access::delete_database))
        .route("/api/servers/{id}/databases/{db}/rotate-password", web::post().to(access::rotate_database_password))
        // Addons
        .route("/api/servers/{id}/addons/search", web::get().to(access::search_addons))
        .route("/api/servers/{id}/addons/install", web::post().to(access::install_addon));
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::issue_node_token;
    use crate::config::PanelConfig;
    use crate::panel::databases::tests::FakeSql;
    use crate::panel::store::tests::seeded;
    use crate::panel::store::PanelStore;
    use actix_web::{test, App};
    use std::sync::Arc;

    pub(crate) const ALICE: &str = "axp_alice";
    pub(crate) const BOB: &str = "axp_bob";
    pub(crate) const ROOT: &str = "axp_root";

    /// Seeded panel where alice, bob and root carry known tokens
    pub(crate) fn state() -> web::Data<PanelState> {
        let store = seeded();
        store.write(|d| {
            for (id, token) in [("alice", ALICE), ("bob", BOB), ("root", ROOT)] {
                if let Some(u) = d.users.get_mut(id) {
                    u.token_hash = sha256_hex(token);
                }
            }
            Ok(())
        }).unwrap();
        state_from(store)
    }

    pub(crate) fn state_from(store: PanelStore) -> web::Data<PanelState> {
        let state = PanelState::new(PanelConfig::default(), Arc::new(store), Arc::new(FakeSql::default())).unwrap();
        web::Data::new(state)
    }

    pub(crate) fn bearer(token: &str) -> (&'static str, String) {
        ("Authorization", format!("Bearer {}", token))
    }

    #[actix_web::test]
    async fn health_is_public_and_tokens_are_checked() {
        let app = test::init_service(App::new().app_data(state()).configure(configure)).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/api/health").to_request()).await;
        assert!(resp.status().is_success());

        let req = test::TestRequest::get().uri("/api/servers").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 401);

        let req = test::TestRequest::get().uri("/api/servers").insert_header(bearer("axp_nobody")).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 401);

        let req = test::TestRequest::get().uri("/api/nodes").insert_header(bearer(ALICE)).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 403);

        let req = test::TestRequest::get().uri("/api/nodes").insert_header(bearer(ROOT)).to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"][0]["id"], "n1");
        assert!(body["data"][0].get("daemon_token").is_none());
    }

    #[actix_web::test]
    async fn heartbeat_needs_a_node_token() {
        let state = state();
        let issued = issue_node_token();
        state.store.write(|d| {
            let n = d.nodes.get_mut("n1").unwrap();
            n.token_id = issued.token_id.clone();
            n.token_hash = issued.token_hash();
            Ok(())
        }).unwrap();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

        let req = test::TestRequest::post().uri("/api/remote/heartbeat")
            .insert_header(bearer(&format!("{}.wrong", issued.token_id)))
            .set_json(SystemInfo::default()).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 401);

        let req = test::TestRequest::post().uri("/api/remote/heartbeat")
            .insert_header(bearer(&issued.daemon_token()))
            .set_json(SystemInfo::default()).to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
        assert!(state.nodes.get("n1").unwrap().is_online);
    }
}
