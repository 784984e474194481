// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! File manager routes, all confined to the server's data dir

use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use futures::TryStreamExt;
use serde::Deserialize;

use super::{ok_data, ok_message, require_auth, send_file, server_id, AppState};
use crate::error::{AxisError, Result};
use crate::files::{too_large, ServerFiles, MAX_UPLOAD_BYTES};

#[derive(Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: String,
    /// Include SHA-512 of each file in listings
    #[serde(default)]
    pub hashes: bool,
}

#[derive(Deserialize)]
pub struct PathBody {
    pub path: String,
}

#[derive(Deserialize)]
pub struct WriteBody {
    pub path: String,
    pub content: String,
}

#[derive(Deserialize)]
pub struct MoveBody {
    pub from: String,
    pub to: String,
}

#[derive(Deserialize)]
pub struct CompressBody {
    pub paths: Vec<String>,
    #[serde(default)]
    pub destination: Option<String>,
}

#[derive(Deserialize)]
pub struct DecompressBody {
    pub path: String,
    #[serde(default)]
    pub destination: Option<String>,
}

#[derive(Deserialize)]
pub struct DownloadUrlBody {
    pub url: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Deserialize)]
pub struct BulkBody {
    pub paths: Vec<String>,
    #[serde(default)]
    pub destination: String,
}

fn sandbox(req: &HttpRequest, state: &AppState, raw_id: &str) -> Result<ServerFiles> {
    let id = server_id(raw_id)?;
    require_auth(req, state)?;
    let files = state.engine.files(&id);
    if !files.root().is_dir() {
        return Err(AxisError::not_found("Server data directory not found"));
    }
    Ok(files)
}

/// Run a blocking file operation off the async workers
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    web::block(f).await.map_err(|e| AxisError::internal(e.to_string()))?
}

/// GET /api/servers/{id}/files?path=: directory listing, or file content for a file
pub async fn list_or_read(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<PathQuery>,
) -> Result<HttpResponse> {
    let files = sandbox(&req, &state, &path)?;
    let PathQuery { path: target, hashes } = query.into_inner();
    if files.is_file(&target) {
        let content = files.read(&target)?;
        return Ok(ok_data(serde_json::json!({ "path": target, "content": content })));
    }
    let entries = blocking(move || files.list(&target, hashes)).await?;
    Ok(ok_data(entries))
}

/// GET /api/servers/{id}/files/download?path=
pub async fn download(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<PathQuery>,
) -> Result<HttpResponse> {
    let files = sandbox(&req, &state, &path)?;
    let target = files.path_followed(&query.path)?;
    if !target.is_file() {
        return Err(AxisError::not_found("File not found"));
    }
    send_file(&req, &target).await
}

pub async fn create_folder(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>, body: web::Json<PathBody>) -> Result<HttpResponse> {
    let files = sandbox(&req, &state, &path)?;
    files.create_dir(&body.path)?;
    Ok(ok_message("Folder created"))
}

pub async fn write(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>, body: web::Json<WriteBody>) -> Result<HttpResponse> {
    let files = sandbox(&req, &state, &path)?;
    files.write(&body.path, body.content.as_bytes())?;
    Ok(ok_message("File saved"))
}

/// POST /api/servers/{id}/files/upload: multipart fields `path` (target dir) and `file`
pub async fn upload(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>, mut payload: Multipart) -> Result<HttpResponse> {
    let files = sandbox(&req, &state, &path)?;
    let cap = state.config.max_upload_bytes.min(MAX_UPLOAD_BYTES);
    let mut dir = String::from("/");
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(mut field) = payload.try_next().await.map_err(|e| AxisError::invalid(e.to_string()))? {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.content_disposition().and_then(|cd| cd.get_filename()).map(str::to_string);
        let mut data = Vec::new();
        while let Some(chunk) = field.try_next().await.map_err(|e| AxisError::invalid(e.to_string()))? {
            if (data.len() + chunk.len()) as u64 > cap {
                return Err(too_large());
            }
            data.extend_from_slice(&chunk);
        }
        match (name.as_str(), filename) {
            ("path", _) => dir = String::from_utf8_lossy(&data).to_string(),
            (_, Some(filename)) => upload = Some((filename, data)),
            _ => {}
        }
    }

    let (filename, data) = upload.ok_or_else(|| AxisError::invalid("No file in upload"))?;
    let written = blocking(move || files.upload(&dir, &filename, &data)).await?;
    Ok(ok_data(serde_json::json!({ "path": written })))
}

/// DELETE /api/servers/{id}/files?path=
pub async fn delete(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<PathQuery>,
) -> Result<HttpResponse> {
    let files = sandbox(&req, &state, &path)?;
    let target = query.into_inner().path;
    blocking(move || files.delete(&target)).await?;
    Ok(ok_message("Deleted"))
}

pub async fn rename(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>, body: web::Json<MoveBody>) -> Result<HttpResponse> {
    let files = sandbox(&req, &state, &path)?;
    files.rename(&body.from, &body.to)?;
    Ok(ok_message("Moved"))
}

pub async fn copy(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>, body: web::Json<MoveBody>) -> Result<HttpResponse> {
    let files = sandbox(&req, &state, &path)?;
    let MoveBody { from, to } = body.into_inner();
    blocking(move || files.copy(&from, &to)).await?;
    Ok(ok_message("Copied"))
}

pub async fn compress(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>, body: web::Json<CompressBody>) -> Result<HttpResponse> {
    let files = sandbox(&req, &state, &path)?;
    let CompressBody { paths, destination } = body.into_inner();
    let archive = blocking(move || files.compress(&paths, destination.as_deref())).await?;
    Ok(ok_data(serde_json::json!({ "path": archive })))
}

pub async fn decompress(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>, body: web::Json<DecompressBody>) -> Result<HttpResponse> {
    let files = sandbox(&req, &state, &path)?;
    let DecompressBody { path: archive, destination } = body.into_inner();
    blocking(move || files.decompress(&archive, destination.as_deref())).await?;
    Ok(ok_message("Extracted"))
}

pub async fn download_url(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>, body: web::Json<DownloadUrlBody>) -> Result<HttpResponse> {
    let files = sandbox(&req, &state, &path)?;
    let dir = if body.path.is_empty() { "/" } else { body.path.as_str() };
    let written = files.download_url(&body.url, dir, body.filename.as_deref()).await?;
    Ok(ok_data(serde_json::json!({ "path": written })))
}

pub async fn bulk_delete(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>, body: web::Json<BulkBody>) -> Result<HttpResponse> {
    let files = sandbox(&req, &state, &path)?;
    let paths = body.into_inner().paths;
    Ok(ok_data(blocking(move || files.bulk_delete(&paths)).await?))
}

pub async fn bulk_copy(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>, body: web::Json<BulkBody>) -> Result<HttpResponse> {
    let files = sandbox(&req, &state, &path)?;
    let BulkBody { paths, destination } = body.into_inner();
    Ok(ok_data(blocking(move || files.bulk_copy(&paths, &destination)).await?))
}

pub async fn bulk_move(req: HttpRequest, state: web::Data<AppState>, path: web::Path<String>, body: web::Json<BulkBody>) -> Result<HttpResponse> {
    let files = sandbox(&req, &state, &path)?;
    let BulkBody { paths, destination } = body.into_inner();
    Ok(ok_data(blocking(move || files.bulk_move(&paths, &destination)).await?))
}
