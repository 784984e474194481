// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Backup and transfer-archive routes

use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::{ok_data, ok_message, require_auth, send_file, server_id, AppState};
use crate::error::{AxisError, Result};
use crate::protocol::ImportRequest;

/// JSON import bodies are tiny; anything larger is a mistake
const MAX_IMPORT_JSON: usize = 64 * 1024;

#[derive(Deserialize, Default)]
pub struct CreateBackup {
    #[serde(default)]
    pub name: Option<String>,
}

pub async fn list(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    Ok(ok_data(state.backups.list(&id)?))
}

/// POST /api/servers/{id}/backups: 202, the tar is written in the background
pub async fn create(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: Option<web::Json<CreateBackup>>,
) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    let name = body.and_then(|b| b.into_inner().name).filter(|n| !n.trim().is_empty());
    let info = state.backups.create(&id, name.as_deref())?;
    Ok(HttpResponse::Accepted().json(serde_json::json!({ "success": true, "data": info })))
}

pub async fn delete(req: HttpRequest, state: web::Data<AppState>, path: web::Path<(String, String)>) -> Result<HttpResponse> {
    let (raw, backup) = path.into_inner();
    let id = server_id(&raw)?;
    require_auth(&req, &state)?;
    state.backups.delete(&id, &backup)?;
    Ok(ok_message("Backup deleted"))
}

pub async fn download(req: HttpRequest, state: web::Data<AppState>, path: web::Path<(String, String)>) -> Result<HttpResponse> {
    let (raw, backup) = path.into_inner();
    let id = server_id(&raw)?;
    require_auth(&req, &state)?;
    let file = state.backups.backup_file(&id, &backup)?;
    send_file(&req, &file).await
}

pub async fn restore(req: HttpRequest, state: web::Data<AppState>, path: web::Path<(String, String)>) -> Result<HttpResponse> {
    let (raw, backup) = path.into_inner();
    let id = server_id(&raw)?;
    require_auth(&req, &state)?;
    state.backups.restore(&id, &backup).await?;
    Ok(ok_message("Backup restored"))
}

// ─── Transfer ───

pub async fn archive(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    let info = state.backups.archive_server(&id).await?;
    Ok(ok_data(serde_json::json!({ "size": info.size })))
}

pub async fn archive_download(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    let file = state.backups.archive_file(&id)?;
    send_file(&req, &file).await
}

pub async fn archive_delete(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    state.backups.delete_archive(&id).await?;
    Ok(ok_message("Archive deleted"))
}

/// POST /api/servers/{id}/import: JSON `{url, token}` pulls from another node,
/// multipart streams an uploaded archive to disk first
pub async fn import(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Payload,
) -> Result<HttpResponse> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;

    let is_multipart = req.headers().get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/"))
        .unwrap_or(false);

    if is_multipart {
        let staging = state.backups.upload_staging_path(&id).await?;
        let mut multipart = Multipart::new(req.headers(), payload);
        let written = match stream_first_file(&mut multipart, &staging).await {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e);
            }
        };
        info!("Received archive upload for {} ({} bytes)", id, written);
        state.backups.import_staged(&id, &staging).await?;
    } else {
        let body = read_limited(payload, MAX_IMPORT_JSON).await?;
        let import: ImportRequest = serde_json::from_slice(&body)
            .map_err(|e| AxisError::invalid(format!("Invalid import request: {}", e)))?;
        state.backups.import_from_url(&id, &import.url, &import.token).await?;
    }
    Ok(ok_message("Server imported"))
}

async fn stream_first_file(multipart: &mut Multipart, target: &std::path::Path) -> Result<u64> {
    while let Some(mut field) = multipart.try_next().await.map_err(|e| AxisError::invalid(e.to_string()))? {
        if field.content_disposition().and_then(|cd| cd.get_filename()).is_none() {
            continue;
        }
        let mut file = tokio::fs::File::create(target).await?;
        let mut written = 0u64;
        while let Some(chunk) = field.try_next().await.map_err(|e| AxisError::invalid(e.to_string()))? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        return Ok(written);
    }
    Err(AxisError::invalid("No archive in upload"))
}

async fn read_limited(mut payload: web::Payload, limit: usize) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| AxisError::invalid(e.to_string()))?;
        if body.len() + chunk.len() > limit {
            return Err(AxisError::invalid("Request body too large"));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
