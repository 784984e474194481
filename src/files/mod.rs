// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Server Data Dir: sandboxed filesystem operations under a server root
//!
//! Every user path is cleaned as if rooted at `/`, joined under the server
//! root and checked to stay there. Symlinks that lead out of the root are
//! refused on any path that would be followed.

pub mod patch;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{AxisError, Result};

pub const MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;
pub const MAX_EDIT_BYTES: u64 = 5 * 1024 * 1024;
pub const HASH_LIMIT_BYTES: u64 = 500 * 1024 * 1024;
pub const MAX_BULK_PATHS: usize = 500;

fn invalid_path() -> AxisError {
    AxisError::invalid("invalid path")
}

pub fn too_large() -> AxisError {
    AxisError::invalid("file too large")
}

/// UID/GID of the node process; all server files end up owned by it
pub fn node_ids() -> (u32, u32) {
    unsafe { (libc::getuid(), libc::getgid()) }
}

/// Best-effort recursive chown to the node process ids (links are not followed)
pub fn chown_recursive(path: &Path) {
    let (uid, gid) = node_ids();
    let mut failures = 0usize;
    for entry in WalkDir::new(path).follow_links(false).into_iter().flatten() {
        if std::os::unix::fs::lchown(entry.path(), Some(uid), Some(gid)).is_err() {
            failures += 1;
        }
    }
    if failures > 0 {
        debug!("chown: {} entries under {} could not be changed", failures, path.display());
    }
}

/// Lexically clean `input` as an absolute path: `..` cannot climb above `/`
pub fn clean_path(input: &str) -> PathBuf {
    let stripped: String = input.chars().filter(|c| *c != '\0').collect();
    let mut parts: Vec<&str> = Vec::new();
    for comp in stripped.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    parts.iter().collect()
}

/// Resolve a user path under `root` without touching the filesystem
pub fn resolve(root: &Path, input: &str) -> Result<PathBuf> {
    let rel = clean_path(input);
    if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(invalid_path());
    }
    let full = root.join(rel);
    if !full.starts_with(root) {
        return Err(invalid_path());
    }
    Ok(full)
}

/// Deepest existing ancestor of `path` (inclusive), canonicalized, must stay under root
fn check_no_escape(root: &Path, path: &Path) -> Result<()> {
    let canon_root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let mut ancestor = Some(path);
    while let Some(p) = ancestor {
        if fs::symlink_metadata(p).is_ok() {
            // A dangling link canonicalizes to an error; treat it as escaping
            let canon = fs::canonicalize(p).map_err(|_| invalid_path())?;
            return if canon.starts_with(&canon_root) { Ok(()) } else { Err(invalid_path()) };
        }
        ancestor = p.parent();
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    /// Relative to the server root, leading `/`
    pub path: String,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub modified: Option<String>,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha512: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkResult {
    pub succeeded: usize,
    pub failed: Vec<BulkFailure>,
}

/// Filesystem view of one server's data dir
#[derive(Debug, Clone)]
pub struct ServerFiles {
    root: PathBuf,
}

impl ServerFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lexical resolve plus a symlink check on the parent chain
    pub fn path(&self, input: &str) -> Result<PathBuf> {
        let full = resolve(&self.root, input)?;
        if let Some(parent) = full.parent() {
            check_no_escape(&self.root, parent)?;
        }
        Ok(full)
    }

    /// Like `path` but the target itself is followed too
    pub fn path_followed(&self, input: &str) -> Result<PathBuf> {
        let full = resolve(&self.root, input)?;
        check_no_escape(&self.root, &full)?;
        Ok(full)
    }

    /// Resolve for destructive operations; the root itself is refused
    pub fn path_not_root(&self, input: &str) -> Result<PathBuf> {
        let full = self.path(input)?;
        if full == self.root {
            return Err(AxisError::invalid("Refusing to operate on the server root"));
        }
        Ok(full)
    }

    fn relative(&self, full: &Path) -> String {
        let rel = full.strip_prefix(&self.root).unwrap_or(full);
        format!("/{}", rel.display())
    }

    /// Create the root with 0777 and hand it to the node user
    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::set_permissions(&self.root, fs::Permissions::from_mode(0o777))?;
        chown_recursive(&self.root);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        match fs::read_dir(&self.root) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }

    /// Total bytes of regular files under the root
    pub fn disk_usage(&self) -> u64 {
        WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }

    /// Delete everything under the root, keeping (or recreating) the root itself
    pub fn clear(&self) -> Result<()> {
        if !self.root.exists() {
            return self.ensure_root();
        }
        for entry in fs::read_dir(&self.root)? {
            let p = entry?.path();
            let meta = fs::symlink_metadata(&p)?;
            if meta.is_dir() {
                fs::remove_dir_all(&p)?;
            } else {
                fs::remove_file(&p)?;
            }
        }
        Ok(())
    }

    // ─── Read ───

    pub fn list(&self, input: &str, with_hashes: bool) -> Result<Vec<FileEntry>> {
        let dir = self.path_followed(input)?;
        if !dir.is_dir() {
            return Err(AxisError::not_found("Directory not found"));
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let p = entry.path();
            let meta = match fs::symlink_metadata(&p) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let is_symlink = meta.file_type().is_symlink();
            let is_dir = meta.is_dir();
            let sha512 = if with_hashes && meta.is_file() && meta.len() < HASH_LIMIT_BYTES {
                hash_file(&p).ok()
            } else {
                None
            };
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                path: self.relative(&p),
                is_dir,
                is_symlink,
                size: if is_dir { 0 } else { meta.len() },
                modified: meta.modified().ok().map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339()),
                mode: format!("{:o}", meta.permissions().mode() & 0o7777),
                sha512,
            });
        }
        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase())));
        Ok(entries)
    }

    /// Text content for the editor, capped at 5 MiB
    pub fn read(&self, input: &str) -> Result<String> {
        let p = self.path_followed(input)?;
        let meta = fs::metadata(&p).map_err(|_| AxisError::not_found("File not found"))?;
        if meta.is_dir() {
            return Err(AxisError::invalid("Path is a directory"));
        }
        if meta.len() > MAX_EDIT_BYTES {
            return Err(too_large());
        }
        let bytes = fs::read(&p)?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    pub fn is_file(&self, input: &str) -> bool {
        self.path_followed(input).map(|p| p.is_file()).unwrap_or(false)
    }

    // ─── Write ───

    pub fn write(&self, input: &str, content: &[u8]) -> Result<()> {
        let p = self.path_not_root(input)?;
        check_no_escape(&self.root, &p)?;
        if p.is_dir() {
            return Err(AxisError::invalid("Path is a directory"));
        }
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&p, content)?;
        chown_recursive(&p);
        Ok(())
    }

    /// Multipart upload into directory `dir`
    pub fn upload(&self, dir: &str, filename: &str, content: &[u8]) -> Result<String> {
        if content.len() as u64 > MAX_UPLOAD_BYTES {
            return Err(too_large());
        }
        let name = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.is_empty() && n != "..")
            .ok_or_else(|| AxisError::invalid("Invalid file name"))?;
        let target = format!("{}/{}", dir.trim_end_matches('/'), name);
        self.write(&target, content)?;
        info!("Uploaded {} ({} bytes) to {}", name, content.len(), self.root.display());
        Ok(target)
    }

    pub fn create_dir(&self, input: &str) -> Result<()> {
        let p = self.path_not_root(input)?;
        check_no_escape(&self.root, &p)?;
        fs::create_dir_all(&p)?;
        chown_recursive(&p);
        Ok(())
    }

    pub fn delete(&self, input: &str) -> Result<()> {
        let p = self.path_not_root(input)?;
        let meta = fs::symlink_metadata(&p).map_err(|_| AxisError::not_found("File not found"))?;
        if meta.is_dir() {
            fs::remove_dir_all(&p)?;
        } else {
            fs::remove_file(&p)?;
        }
        Ok(())
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.path_not_root(from)?;
        let dst = self.path_not_root(to)?;
        check_no_escape(&self.root, &dst)?;
        if fs::symlink_metadata(&src).is_err() {
            return Err(AxisError::not_found("File not found"));
        }
        if dst.starts_with(&src) {
            return Err(AxisError::invalid("Cannot move a directory into itself"));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src, &dst)?;
        Ok(())
    }

    /// Copy a file or directory tree. A failed directory copy leaves what was copied.
    pub fn copy(&self, from: &str, to: &str) -> Result<()> {
        let src = self.path_followed(from)?;
        let dst = self.path_not_root(to)?;
        check_no_escape(&self.root, &dst)?;
        if dst.starts_with(&src) {
            return Err(AxisError::invalid("Cannot copy a directory into itself"));
        }
        let meta = fs::metadata(&src).map_err(|_| AxisError::not_found("File not found"))?;
        if meta.is_dir() {
            if let Err(e) = copy_dir(&src, &dst) {
                warn!("Partial copy of {} left at {}: {}", src.display(), dst.display(), e);
                return Err(e);
            }
        } else {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&src, &dst)?;
        }
        chown_recursive(&dst);
        Ok(())
    }

    // ─── Bulk ───

    fn check_bulk(paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Err(AxisError::invalid("No paths given"));
        }
        if paths.len() > MAX_BULK_PATHS {
            return Err(AxisError::invalid(format!("Too many paths (max {})", MAX_BULK_PATHS)));
        }
        Ok(())
    }

    fn bulk(&self, paths: &[String], op: impl Fn(&str) -> Result<()>) -> Result<BulkResult> {
        Self::check_bulk(paths)?;
        let mut result = BulkResult::default();
        for p in paths {
            match op(p) {
                Ok(()) => result.succeeded += 1,
                Err(e) => result.failed.push(BulkFailure { path: p.clone(), error: e.to_string() }),
            }
        }
        Ok(result)
    }

    pub fn bulk_delete(&self, paths: &[String]) -> Result<BulkResult> {
        self.bulk(paths, |p| self.delete(p))
    }

    pub fn bulk_copy(&self, paths: &[String], destination: &str) -> Result<BulkResult> {
        self.bulk(paths, |p| self.copy(p, &join_dest(destination, p)))
    }

    pub fn bulk_move(&self, paths: &[String], destination: &str) -> Result<BulkResult> {
        self.bulk(paths, |p| self.rename(p, &join_dest(destination, p)))
    }

    // ─── Archives ───

    /// tar.gz the given paths; returns the archive path relative to the root
    pub fn compress(&self, paths: &[String], destination: Option<&str>) -> Result<String> {
        Self::check_bulk(paths)?;
        let mut members = Vec::with_capacity(paths.len());
        for p in paths {
            let full = self.path_not_root(p)?;
            if fs::symlink_metadata(&full).is_err() {
                return Err(AxisError::not_found(format!("{} not found", p)));
            }
            members.push(self.relative(&full).trim_start_matches('/').to_string());
        }

        let dest_rel = match destination.filter(|d| !d.trim().is_empty()) {
            Some(d) => d.to_string(),
            None => {
                let parent = Path::new(&members[0]).parent().map(|p| p.display().to_string()).unwrap_or_default();
                format!("{}/archive-{}.tar.gz", parent, chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S"))
            }
        };
        let dest = self.path_not_root(&dest_rel)?;
        check_no_escape(&self.root, &dest)?;

        let mut cmd = Command::new("tar");
        cmd.arg("-czf").arg(&dest).arg("-C").arg(&self.root).arg("--");
        cmd.args(&members);
        let output = cmd.output().map_err(|e| AxisError::internal(format!("Failed to run tar: {}", e)))?;
        if !output.status.success() {
            let _ = fs::remove_file(&dest);
            return Err(AxisError::internal(format!("Compress failed: {}", String::from_utf8_lossy(&output.stderr).trim())));
        }
        chown_recursive(&dest);
        Ok(self.relative(&dest))
    }

    /// Extract tar, tar.gz, tgz or zip into `destination` (default: the archive's dir)
    pub fn decompress(&self, archive: &str, destination: Option<&str>) -> Result<()> {
        let src = self.path_followed(archive)?;
        if !src.is_file() {
            return Err(AxisError::not_found("Archive not found"));
        }
        let dest = match destination.filter(|d| !d.trim().is_empty()) {
            Some(d) => self.path_followed(d)?,
            None => src.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone()),
        };
        fs::create_dir_all(&dest)?;
        extract_archive(&src, &dest)?;
        chown_recursive(&dest);
        Ok(())
    }

    /// Fetch a URL into `dir`, filename from the URL unless given
    pub async fn download_url(&self, url: &str, dir: &str, filename: Option<&str>) -> Result<String> {
        let parsed = crate::ssrf::check_url(url)?;
        let name = filename
            .map(|s| s.to_string())
            .or_else(|| parsed.path_segments().and_then(|s| s.last().map(|l| l.to_string())))
            .and_then(|n| urlencoding::decode(&n).ok().map(|d| d.to_string()))
            .filter(|n| !n.is_empty() && n != ".." && !n.contains('/'))
            .unwrap_or_else(|| "download".to_string());
        let target_rel = format!("{}/{}", dir.trim_end_matches('/'), name);
        let target = self.path_not_root(&target_rel)?;
        check_no_escape(&self.root, &target)?;

        download_to(parsed.as_str(), &target).await?;
        chown_recursive(&target);
        info!("Downloaded {} into {}", parsed, target.display());
        Ok(target_rel)
    }
}

fn join_dest(destination: &str, source: &str) -> String {
    let name = clean_path(source).file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    format!("{}/{}", destination.trim_end_matches('/'), name)
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| AxisError::internal(format!("Copy failed: {}", e)))?;
        let rel = entry.path().strip_prefix(src).map_err(|_| invalid_path())?;
        let target = dst.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            fs::create_dir_all(&target)?;
        } else if ft.is_symlink() {
            // Links are not carried over; they could point anywhere
            continue;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha512::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Extract by extension using the host tar/unzip
pub fn extract_archive(src: &Path, dest: &Path) -> Result<()> {
    let name = src.file_name().map(|n| n.to_string_lossy().to_lowercase()).unwrap_or_default();
    let output = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Command::new("tar").arg("--no-same-owner").arg("-xzf").arg(src).arg("-C").arg(dest).output()
    } else if name.ends_with(".tar") {
        Command::new("tar").arg("--no-same-owner").arg("-xf").arg(src).arg("-C").arg(dest).output()
    } else if name.ends_with(".zip") || name.ends_with(".mrpack") {
        Command::new("unzip").arg("-o").arg("-q").arg(src).arg("-d").arg(dest).output()
    } else {
        return Err(AxisError::invalid("Unsupported archive type"));
    };
    let output = output.map_err(|e| AxisError::internal(format!("Failed to run extractor: {}", e)))?;
    if !output.status.success() {
        return Err(AxisError::internal(format!(
            "Extract failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Stream a (pre-vetted) URL to a local file
pub async fn download_to(url: &str, target: &Path) -> Result<u64> {
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;

    let resp = reqwest::Client::new()
        .get(url)
        .timeout(std::time::Duration::from_secs(30 * 60))
        .send()
        .await
        .map_err(|e| AxisError::invalid(format!("Download failed: {}", e)))?;
    if !resp.status().is_success() {
        return Err(AxisError::invalid(format!("Download failed: HTTP {}", resp.status())));
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(target).await?;
    let mut stream = resp.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AxisError::invalid(format!("Download interrupted: {}", e)))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}
