// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! File and backup routes, relayed to the owning node after a per-operation
//! permission check

use actix_web::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use actix_web::http::StatusCode;
use actix_web::web::Bytes;
use actix_web::{web, HttpRequest, HttpResponse};
use reqwest::Method;

use super::require_permission;
use crate::backup::valid_backup_id;
use crate::error::{AxisError, Result};
use crate::panel::client::NodeResponse;
use crate::panel::permissions::*;
use crate::panel::PanelState;

/// Permission needed for a file operation, by method and path tail
fn file_permission(method: &str, op: &str) -> Option<&'static str> {
    Some(match (method, op) {
        ("GET", "") => FILE_LIST,
        ("DELETE", "") => FILE_DELETE,
        ("GET", "download") => FILE_DOWNLOAD,
        ("POST", "folder") => FILE_CREATE,
        ("POST", "write") => FILE_WRITE,
        ("POST", "upload") | ("POST", "download-url") => FILE_UPLOAD,
        ("POST", "move") | ("POST", "bulk-move") => FILE_MOVE,
        ("POST", "copy") | ("POST", "bulk-copy") => FILE_COPY,
        ("POST", "compress") => FILE_COMPRESS,
        ("POST", "decompress") => FILE_DECOMPRESS,
        ("POST", "bulk-delete") => FILE_DELETE,
        _ => return None,
    })
}

/// The caller's query string minus its `token`, which stays on the panel
fn forward_query(raw: &str) -> String {
    let kept: Vec<&str> = raw.split('&').filter(|p| !p.is_empty() && !p.starts_with("token=")).collect();
    if kept.is_empty() { String::new() } else { format!("?{}", kept.join("&")) }
}

/// Node answer passed back as-is
fn relay(resp: NodeResponse) -> HttpResponse {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    HttpResponse::build(status).content_type("application/json").body(resp.body)
}

fn server_param(req: &HttpRequest) -> String {
    req.match_info().get("id").unwrap_or_default().to_string()
}

/// Any method on /api/servers/{id}/files[/{op}]
pub async fn files(req: HttpRequest, state: web::Data<PanelState>, body: Bytes) -> Result<HttpResponse> {
    let id = server_param(&req);
    let op = req.match_info().get("op").unwrap_or_default().to_string();
    let perm = file_permission(req.method().as_str(), &op)
        .ok_or_else(|| AxisError::not_found("Unknown file operation"))?;
    require_permission(&req, &state, &id, perm)?;

    let base = if op.is_empty() { "/files".to_string() } else { format!("/files/{}", op) };
    let suffix = format!("{}{}", base, forward_query(req.query_string()));

    if op == "download" {
        let resp = state.client.stream_download(&id, &suffix).await?;
        let mut out = HttpResponse::Ok();
        for name in [reqwest::header::CONTENT_TYPE, reqwest::header::CONTENT_DISPOSITION] {
            if let Some(v) = resp.headers().get(&name).and_then(|v| v.to_str().ok()) {
                let header = if name == reqwest::header::CONTENT_TYPE { CONTENT_TYPE } else { CONTENT_DISPOSITION };
                out.insert_header((header, v.to_string()));
            }
        }
        return Ok(out.streaming(resp.bytes_stream()));
    }

    let method = Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(|_| AxisError::invalid("Unsupported method"))?;
    let content_type = req.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let resp = state.client.proxy_raw(&id, method, &suffix, content_type, body).await?;

    // Listing a file path returns its contents
    if op.is_empty() && req.method().as_str() == "GET" && resp.is_success() {
        let is_file = serde_json::from_slice::<serde_json::Value>(&resp.body)
            .map(|v| v["data"].get("content").is_some())
            .unwrap_or(false);
        if is_file {
            require_permission(&req, &state, &id, FILE_READ)?;
        }
    }
    Ok(relay(resp))
}

fn backup_suffix(backup: &str, tail: &str) -> Result<String> {
    if !valid_backup_id(backup) {
        return Err(AxisError::invalid("Invalid backup id"));
    }
    Ok(format!("/backups/{}{}", urlencoding::encode(backup), tail))
}

/// GET /api/servers/{id}/backups
pub async fn list_backups(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>) -> Result<HttpResponse> {
    require_permission(&req, &state, &path, BACKUP_LIST)?;
    Ok(relay(state.client.proxy(&path, Method::GET, "/backups", None).await?))
}

/// POST /api/servers/{id}/backups
pub async fn create_backup(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>, body: Bytes) -> Result<HttpResponse> {
    require_permission(&req, &state, &path, BACKUP_CREATE)?;
    let content_type = req.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    Ok(relay(state.client.proxy_raw(&path, Method::POST, "/backups", content_type, body).await?))
}

/// DELETE /api/servers/{id}/backups/{backup}
pub async fn delete_backup(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<(String, String)>) -> Result<HttpResponse> {
    let (id, backup) = path.into_inner();
    require_permission(&req, &state, &id, BACKUP_DELETE)?;
    let suffix = backup_suffix(&backup, "")?;
    Ok(relay(state.client.proxy(&id, Method::DELETE, &suffix, None).await?))
}

/// GET /api/servers/{id}/backups/{backup}/download: redirect to the node
pub async fn download_backup(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<(String, String)>) -> Result<HttpResponse> {
    let (id, backup) = path.into_inner();
    require_permission(&req, &state, &id, BACKUP_DOWNLOAD)?;
    let suffix = backup_suffix(&backup, "/download")?;
    let (_, node) = state.client.locate(&id)?;
    let url = state.client.presigned_url(&node, &format!("/api/servers/{}{}", id, suffix));
    Ok(HttpResponse::Found().insert_header(("Location", url)).finish())
}

/// POST /api/servers/{id}/backups/{backup}/restore
pub async fn restore_backup(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<(String, String)>) -> Result<HttpResponse> {
    let (id, backup) = path.into_inner();
    require_permission(&req, &state, &id, BACKUP_RESTORE)?;
    let suffix = backup_suffix(&backup, "/restore")?;
    Ok(relay(state.client.proxy(&id, Method::POST, &suffix, None).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::configure;
    use super::super::tests::{bearer, state, ALICE, BOB};
    use crate::panel::store::{new_id, SubUser};
    use actix_web::{test, App};

    #[::core::prelude::v1::test]
    fn file_ops_map_to_permissions() {
        assert_eq!(file_permission("GET", ""), Some(FILE_LIST));
        assert_eq!(file_permission("POST", "bulk-move"), Some(FILE_MOVE));
        assert_eq!(file_permission("POST", "download-url"), Some(FILE_UPLOAD));
        assert_eq!(file_permission("PUT", "write"), None);
        assert_eq!(file_permission("POST", "chmod"), None);
    }

    #[::core::prelude::v1::test]
    fn panel_token_is_not_forwarded() {
        assert_eq!(forward_query("path=/world&token=axp_x"), "?path=/world");
        assert_eq!(forward_query("token=axp_x"), "");
        assert_eq!(forward_query(""), "");
    }

    #[::core::prelude::v1::test]
    fn backup_ids_are_checked() {
        assert_eq!(backup_suffix("nightly 1", "/restore").unwrap(), "/backups/nightly%201/restore");
        assert!(backup_suffix("../../x", "").is_err());
        assert!(backup_suffix("a/b", "").is_err());
    }

    #[actix_web::test]
    async fn backup_download_redirects_with_node_token() {
        let state = state();
        state.store.add_subuser(SubUser {
            id: new_id(),
            server_id: "s1".into(),
            user_id: "bob".into(),
            permissions: vec![BACKUP_LIST.into()],
        }).unwrap();
        let app = test::init_service(App::new().app_data(state).configure(configure)).await;

        let req = test::TestRequest::get().uri("/api/servers/s1/backups/b1/download").insert_header(bearer(ALICE)).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 302);
        let location = resp.headers().get("Location").unwrap().to_str().unwrap();
        assert_eq!(location, "https://n1.example.com:8443/api/servers/s1/backups/b1/download?token=abcd1234ef567890.secret");

        let req = test::TestRequest::get().uri("/api/servers/s1/backups/b1/download").insert_header(bearer(BOB)).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 403);

        let req = test::TestRequest::post().uri("/api/servers/s1/files/chmod").insert_header(bearer(ALICE)).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 404);
    }
}
