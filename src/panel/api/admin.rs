// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Admin routes: nodes, packages, database hosts, transfer status

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use tracing::info;

use super::{authenticate, ok_data, ok_message, require_admin};
use crate::error::Result;
use crate::panel::databases::NewHost;
use crate::panel::nodes::NewNode;
use crate::panel::store::{new_id, Package};
use crate::panel::PanelState;

#[derive(Deserialize)]
pub struct PairNode {
    #[serde(flatten)]
    pub node: NewNode,
    pub code: String,
}

// ─── Nodes ───

/// GET /api/nodes
pub async fn list_nodes(req: HttpRequest, state: web::Data<PanelState>) -> Result<HttpResponse> {
    require_admin(&req, &state)?;
    Ok(ok_data(state.nodes.list()))
}

/// POST /api/nodes: the daemon token is only ever shown in this response
pub async fn create_node(req: HttpRequest, state: web::Data<PanelState>, body: web::Json<NewNode>) -> Result<HttpResponse> {
    require_admin(&req, &state)?;
    let (node, daemon_token) = state.nodes.create_direct(body.into_inner())?;
    Ok(HttpResponse::Created().json(serde_json::json!({
        "success": true,
        "data": node,
        "daemon_token": daemon_token,
    })))
}

/// POST /api/nodes/pair: blocks until the node's operator answers
pub async fn pair_node(req: HttpRequest, state: web::Data<PanelState>, body: web::Json<PairNode>) -> Result<HttpResponse> {
    require_admin(&req, &state)?;
    let PairNode { node, code } = body.into_inner();
    let view = state.nodes.pair(node, &code, &state.config.public_url).await?;
    Ok(HttpResponse::Created().json(serde_json::json!({ "success": true, "data": view })))
}

/// POST /api/nodes/{id}/reset-token
pub async fn reset_node_token(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>) -> Result<HttpResponse> {
    require_admin(&req, &state)?;
    let daemon_token = state.nodes.reset_token(&path)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "success": true, "daemon_token": daemon_token })))
}

/// POST /api/nodes/refresh
pub async fn refresh_nodes(req: HttpRequest, state: web::Data<PanelState>) -> Result<HttpResponse> {
    require_admin(&req, &state)?;
    state.nodes.refresh_all().await;
    Ok(ok_data(state.nodes.list()))
}

/// DELETE /api/nodes/{id}
pub async fn delete_node(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>) -> Result<HttpResponse> {
    require_admin(&req, &state)?;
    state.nodes.delete(&path)?;
    Ok(ok_message("Node deleted"))
}

// ─── Packages ───

/// GET /api/packages: any signed-in user may browse
pub async fn list_packages(req: HttpRequest, state: web::Data<PanelState>) -> Result<HttpResponse> {
    authenticate(&req, &state)?;
    let packages: Vec<Package> = state.store.read(|d| d.packages.values().cloned().collect());
    Ok(ok_data(packages))
}

/// POST /api/packages: the id is always assigned here
pub async fn create_package(req: HttpRequest, state: web::Data<PanelState>, body: web::Json<serde_json::Value>) -> Result<HttpResponse> {
    require_admin(&req, &state)?;
    let mut raw = body.into_inner();
    raw["id"] = serde_json::Value::String(new_id());
    let pkg: Package = serde_json::from_value(raw)?;
    if pkg.name.trim().is_empty() || pkg.docker_image.trim().is_empty() {
        return Err(crate::error::AxisError::invalid("name and docker_image are required"));
    }
    let pkg = state.store.add_package(pkg)?;
    info!("Package {} {} created", pkg.name, pkg.version);
    Ok(HttpResponse::Created().json(serde_json::json!({ "success": true, "data": pkg })))
}

/// DELETE /api/packages/{id}
pub async fn delete_package(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>) -> Result<HttpResponse> {
    require_admin(&req, &state)?;
    state.store.delete_package(&path)?;
    Ok(ok_message("Package deleted"))
}

// ─── Database hosts ───

pub async fn list_db_hosts(req: HttpRequest, state: web::Data<PanelState>) -> Result<HttpResponse> {
    require_admin(&req, &state)?;
    Ok(ok_data(state.databases.list_hosts()))
}

pub async fn create_db_host(req: HttpRequest, state: web::Data<PanelState>, body: web::Json<NewHost>) -> Result<HttpResponse> {
    require_admin(&req, &state)?;
    let host = state.databases.add_host(body.into_inner())?;
    Ok(HttpResponse::Created().json(serde_json::json!({ "success": true, "data": { "id": host.id, "name": host.name } })))
}

pub async fn delete_db_host(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>) -> Result<HttpResponse> {
    require_admin(&req, &state)?;
    state.databases.delete_host(&path)?;
    Ok(ok_message("Database host deleted"))
}

// ─── Transfers ───

/// GET /api/transfers/{id}
pub async fn transfer_status(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>) -> Result<HttpResponse> {
    require_admin(&req, &state)?;
    Ok(ok_data(state.transfers.get(&path)?))
}

#[cfg(test)]
mod tests {
    use super::super::configure;
    use super::super::tests::{bearer, state, ALICE, ROOT};
    use actix_web::{test, App};
    use serde_json::json;

    #[actix_web::test]
    async fn node_lifecycle() {
        let state = state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

        let req = test::TestRequest::post().uri("/api/nodes").insert_header(bearer(ROOT))
            .set_json(json!({"name": "fra-2", "fqdn": "fra-2.example.com"})).to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        let id = body["data"]["id"].as_str().unwrap().to_string();
        let token = body["daemon_token"].as_str().unwrap().to_string();
        assert_eq!(body["data"]["port"], 8443);
        assert_eq!(state.nodes.validate(&token), Some(id.clone()));

        let req = test::TestRequest::post().uri(&format!("/api/nodes/{}/reset-token", id)).insert_header(bearer(ROOT)).to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_ne!(body["daemon_token"].as_str().unwrap(), token);
        assert_eq!(state.nodes.validate(&token), None);

        // n1 still hosts s1
        let req = test::TestRequest::delete().uri("/api/nodes/n1").insert_header(bearer(ROOT)).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 409);

        let req = test::TestRequest::delete().uri(&format!("/api/nodes/{}", id)).insert_header(bearer(ROOT)).to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
    }

    #[actix_web::test]
    async fn packages_are_admin_managed() {
        let app = test::init_service(App::new().app_data(state()).configure(configure)).await;
        let pkg = json!({
            "name": "Terraria",
            "version": "1.4",
            "docker_image": "ghcr.io/games/terraria:latest",
            "startup": "./TerrariaServer -port {{SERVER_PORT}}",
            "ports": [{"port": 7777}]
        });

        let req = test::TestRequest::post().uri("/api/packages").insert_header(bearer(ALICE)).set_json(&pkg).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 403);

        let req = test::TestRequest::post().uri("/api/packages").insert_header(bearer(ROOT)).set_json(&pkg).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 201);

        let req = test::TestRequest::post().uri("/api/packages").insert_header(bearer(ROOT)).set_json(&pkg).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 409);

        let req = test::TestRequest::delete().uri("/api/packages/p1").insert_header(bearer(ROOT)).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 409);

        let req = test::TestRequest::get().uri("/api/packages").insert_header(bearer(ALICE)).to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
    }
}
