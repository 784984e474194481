// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Modpack installer: Modrinth `.mrpack` and CurseForge manifest packs.
//!
//! The pack is fetched and unpacked in a staging dir outside the server,
//! each listed file is downloaded into the data dir through the path
//! sandbox, then the pack's override folders are copied over the top.
//! Every URL goes through the SSRF guard. Progress lands on the Log Bus.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::containers::validate_server_id;
use crate::error::{AxisError, Result};
use crate::files::{chown_recursive, download_to, extract_archive, ServerFiles};
use crate::lifecycle::Engine;
use crate::ssrf::check_url;

const CURSEFORGE_API: &str = "https://api.curseforge.com/v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PackKind {
    Modrinth,
    Curseforge,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModpackRequest {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: PackKind,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// One file the pack wants in the server dir
#[derive(Debug, Clone, PartialEq)]
pub struct PackFile {
    pub path: String,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CurseforgeRef {
    pub project_id: u64,
    pub file_id: u64,
}

/// Files from `modrinth.index.json`, minus client-only entries
pub fn modrinth_files(index: &Value) -> Result<Vec<PackFile>> {
    let files = index.get("files").and_then(Value::as_array)
        .ok_or_else(|| AxisError::invalid("modrinth.index.json has no files list"))?;
    let mut out = Vec::new();
    for f in files {
        let server_env = f.pointer("/env/server").and_then(Value::as_str).unwrap_or("required");
        if server_env == "unsupported" {
            continue;
        }
        let Some(path) = f.get("path").and_then(Value::as_str) else { continue };
        let urls: Vec<String> = f.get("downloads").and_then(Value::as_array)
            .map(|d| d.iter().filter_map(|u| u.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        if urls.is_empty() {
            continue;
        }
        out.push(PackFile { path: path.to_string(), urls });
    }
    Ok(out)
}

/// `(files, overrides dir name)` from a CurseForge `manifest.json`
pub fn curseforge_files(manifest: &Value) -> Result<(Vec<CurseforgeRef>, String)> {
    let files = manifest.get("files").and_then(Value::as_array)
        .ok_or_else(|| AxisError::invalid("manifest.json has no files list"))?;
    let refs = files.iter()
        .filter(|f| f.get("required").and_then(Value::as_bool).unwrap_or(true))
        .filter_map(|f| Some(CurseforgeRef {
            project_id: f.get("projectID")?.as_u64()?,
            file_id: f.get("fileID")?.as_u64()?,
        }))
        .collect();
    let overrides = manifest.get("overrides").and_then(Value::as_str).unwrap_or("overrides").to_string();
    Ok((refs, overrides))
}

/// Copy every regular file under `src` into the server dir. Links are skipped.
pub fn copy_overrides(src: &Path, files: &ServerFiles) -> Result<usize> {
    if !src.is_dir() {
        return Ok(0);
    }
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(src) else { continue };
        let target = files.path_followed(&rel.to_string_lossy())?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(entry.path(), &target)?;
        copied += 1;
    }
    Ok(copied)
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .map_err(|_| AxisError::invalid(format!("{} not found in pack", path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default())))?;
    Ok(serde_json::from_str(&text)?)
}

pub struct ModpackInstaller {
    engine: Arc<Engine>,
    staging_root: PathBuf,
}

impl ModpackInstaller {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine, staging_root: std::env::temp_dir() }
    }

    /// Validate and start the install in the background
    pub fn install(self: &Arc<Self>, server_id: &str, req: ModpackRequest) -> Result<()> {
        validate_server_id(server_id)?;
        check_url(&req.url)?;
        if req.kind == PackKind::Curseforge && req.api_key.as_deref().map(str::is_empty).unwrap_or(true) {
            return Err(AxisError::invalid("CurseForge packs need an api_key"));
        }
        let this = self.clone();
        let server = server_id.to_string();
        tokio::spawn(async move {
            let bus = this.engine.bus().clone();
            match this.run(&server, &req).await {
                Ok(n) => {
                    bus.system(&server, &format!("Modpack installed ({} files)", n));
                    info!("Modpack installed on {} ({} files)", server, n);
                }
                Err(e) => {
                    bus.system(&server, &format!("Modpack install failed: {}", e));
                    error!("Modpack install on {} failed: {}", server, e);
                }
            }
        });
        Ok(())
    }

    async fn run(&self, server_id: &str, req: &ModpackRequest) -> Result<usize> {
        let staging = self.staging_root.join(format!("axis-modpack-{}-{}", server_id, uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&staging).await?;
        let result = self.run_staged(server_id, req, &staging).await;
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            warn!("Could not remove modpack staging {}: {}", staging.display(), e);
        }
        result
    }

    async fn run_staged(&self, server_id: &str, req: &ModpackRequest, staging: &Path) -> Result<usize> {
        let bus = self.engine.bus().clone();
        let files = self.engine.files(server_id);
        files.ensure_root()?;

        bus.system(server_id, "Downloading modpack...");
        let url = check_url(&req.url)?;
        let pack = staging.join(match req.kind {
            PackKind::Modrinth => "pack.mrpack",
            PackKind::Curseforge => "pack.zip",
        });
        download_to(url.as_str(), &pack).await?;

        bus.system(server_id, "Extracting modpack...");
        let unpacked = staging.join("unpacked");
        std::fs::create_dir_all(&unpacked)?;
        let (src, dst) = (pack.clone(), unpacked.clone());
        tokio::task::spawn_blocking(move || extract_archive(&src, &dst)).await
            .map_err(|e| AxisError::internal(e.to_string()))??;

        let installed = match req.kind {
            PackKind::Modrinth => self.install_modrinth(server_id, &files, &unpacked).await?,
            PackKind::Curseforge => {
                let key = req.api_key.clone().unwrap_or_default();
                self.install_curseforge(server_id, &files, &unpacked, &key).await?
            }
        };

        let root = files.root().to_path_buf();
        tokio::task::spawn_blocking(move || chown_recursive(&root)).await
            .map_err(|e| AxisError::internal(e.to_string()))?;
        Ok(installed)
    }

    async fn install_modrinth(&self, server_id: &str, files: &ServerFiles, unpacked: &Path) -> Result<usize> {
        let bus = self.engine.bus().clone();
        let index = read_json(&unpacked.join("modrinth.index.json"))?;
        let entries = modrinth_files(&index)?;
        if let Some(name) = index.get("name").and_then(Value::as_str) {
            bus.system(server_id, &format!("Installing {}", name));
        }

        let total = entries.len();
        let mut installed = 0;
        for (i, entry) in entries.iter().enumerate() {
            let target = files.path_followed(&entry.path)?;
            if target == files.root() {
                return Err(AxisError::invalid("Invalid path in modpack index"));
            }
            bus.system(server_id, &format!("[{}/{}] {}", i + 1, total, entry.path));
            let mut done = false;
            for url in &entry.urls {
                let Ok(url) = check_url(url) else {
                    warn!("Modpack URL rejected: {}", url);
                    continue;
                };
                match download_to(url.as_str(), &target).await {
                    Ok(_) => {
                        done = true;
                        break;
                    }
                    Err(e) => warn!("Download of {} failed: {}", url, e),
                }
            }
            if !done {
                return Err(AxisError::invalid(format!("Could not download {}", entry.path)));
            }
            installed += 1;
        }

        bus.system(server_id, "Applying overrides...");
        installed += copy_overrides(&unpacked.join("overrides"), files)?;
        installed += copy_overrides(&unpacked.join("server-overrides"), files)?;
        Ok(installed)
    }

    async fn install_curseforge(&self, server_id: &str, files: &ServerFiles, unpacked: &Path, api_key: &str) -> Result<usize> {
        let bus = self.engine.bus().clone();
        let manifest = read_json(&unpacked.join("manifest.json"))?;
        let (refs, overrides) = curseforge_files(&manifest)?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let total = refs.len();
        let mut installed = 0;
        for (i, r) in refs.iter().enumerate() {
            let info: Value = client
                .get(format!("{}/mods/{}/files/{}", CURSEFORGE_API, r.project_id, r.file_id))
                .header("x-api-key", api_key)
                .header("Accept", "application/json")
                .send().await?
                .error_for_status()?
                .json().await?;
            let Some(file_name) = info.pointer("/data/fileName").and_then(Value::as_str) else {
                warn!("CurseForge file {}/{} has no name, skipped", r.project_id, r.file_id);
                continue;
            };
            // Authors can disable third-party distribution
            let Some(url) = info.pointer("/data/downloadUrl").and_then(Value::as_str) else {
                bus.system(server_id, &format!("Skipping {}: download disabled by author", file_name));
                continue;
            };
            let url = check_url(url)?;
            let target = files.path_followed(&format!("mods/{}", file_name))?;
            bus.system(server_id, &format!("[{}/{}] mods/{}", i + 1, total, file_name));
            download_to(url.as_str(), &target).await?;
            installed += 1;
        }

        bus.system(server_id, "Applying overrides...");
        installed += copy_overrides(&unpacked.join(&overrides), files)?;
        Ok(installed)
    }
}
