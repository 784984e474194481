// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Backup & Archive: per-server tar.gz backups and node-to-node transfer archives
//!
//! Running servers are backed up from inside the container (`tar` over exec,
//! stdout into a host file) so the archive sees what the game process sees.
//! Stopped servers are archived straight from the data dir on the host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::containers::{container_name, validate_server_id, CONTAINER_HOME};
use crate::error::{AxisError, Result};
use crate::files::chown_recursive;
use crate::lifecycle::Engine;
use crate::protocol::ServerStatus;

const TRANSFER_DIR: &str = "transfers";

// ─── Data Types ───

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackupInfo {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    /// False while the tar is still being written
    pub completed: bool,
}

/// `<id>.json` next to each finished tar: what the id alone cannot recover
#[derive(Debug, Serialize, Deserialize)]
struct BackupMeta {
    name: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub size: u64,
}

/// Backup id derived from its display name
pub fn safe_id(name: &str) -> String {
    name.trim().replace([' ', ':'], "-")
}

pub fn valid_backup_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && !id.contains(['/', '\\', '\0'])
}

async fn run_tar(args: &[&OsStr]) -> Result<()> {
    let output = Command::new("tar")
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| AxisError::driver(format!("Failed to run tar: {}", e)))?;
    if !output.status.success() {
        return Err(AxisError::driver(format!(
            "tar failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// `tar -czf <dest> -C <src> .`
async fn tar_dir(src: &Path, dest: &Path) -> Result<()> {
    run_tar(&[OsStr::new("-czf"), dest.as_os_str(), OsStr::new("-C"), src.as_os_str(), OsStr::new(".")]).await
}

async fn untar_into(archive: &Path, dest: &Path) -> Result<()> {
    run_tar(&[OsStr::new("--no-same-owner"), OsStr::new("-xzf"), archive.as_os_str(), OsStr::new("-C"), dest.as_os_str()]).await
}

pub struct BackupEngine {
    engine: Arc<Engine>,
    backup_dir: PathBuf,
    /// (server, backup id) -> entry for tars still being written
    in_progress: Mutex<HashMap<(String, String), BackupInfo>>,
    accept_invalid_certs: bool,
}

impl BackupEngine {
    pub fn new(engine: Arc<Engine>, backup_dir: PathBuf) -> Self {
        Self { engine, backup_dir, in_progress: Mutex::new(HashMap::new()), accept_invalid_certs: false }
    }

    /// Trust self-signed certificates on archive downloads from other nodes
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    fn server_dir(&self, server_id: &str) -> PathBuf {
        self.backup_dir.join(server_id)
    }

    fn backup_path(&self, server_id: &str, backup_id: &str) -> PathBuf {
        self.server_dir(server_id).join(format!("{}.tar.gz", backup_id))
    }

    fn meta_path(&self, server_id: &str, backup_id: &str) -> PathBuf {
        self.server_dir(server_id).join(format!("{}.json", backup_id))
    }

    fn read_meta(&self, server_id: &str, backup_id: &str) -> Option<BackupMeta> {
        let raw = std::fs::read(self.meta_path(server_id, backup_id)).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn write_meta(&self, server_id: &str, info: &BackupInfo) -> Result<()> {
        let meta = BackupMeta { name: info.name.clone(), created_at: info.created_at };
        let raw = serde_json::to_vec(&meta).map_err(|e| AxisError::internal(e.to_string()))?;
        std::fs::write(self.meta_path(server_id, &info.id), raw)?;
        Ok(())
    }

    fn is_in_progress(&self, server_id: &str, backup_id: &str) -> bool {
        self.in_progress.lock()
            .map(|m| m.contains_key(&(server_id.to_string(), backup_id.to_string())))
            .unwrap_or(false)
    }

    /// Path of a completed backup, for download and restore
    pub fn backup_file(&self, server_id: &str, backup_id: &str) -> Result<PathBuf> {
        validate_server_id(server_id)?;
        if !valid_backup_id(backup_id) {
            return Err(AxisError::invalid("Invalid backup id"));
        }
        if self.is_in_progress(server_id, backup_id) {
            return Err(AxisError::conflict("Backup is still in progress"));
        }
        let path = self.backup_path(server_id, backup_id);
        if !path.is_file() {
            return Err(AxisError::not_found("Backup not found"));
        }
        Ok(path)
    }

    // ─── Create ───

    /// Register the backup and write it in the background. Poll `list` for completion.
    pub fn create(self: &Arc<Self>, server_id: &str, name: Option<&str>) -> Result<BackupInfo> {
        validate_server_id(server_id)?;
        let now = Utc::now();
        let name = name.map(str::trim).filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("backup {}", now.format("%Y-%m-%d %H:%M:%S")));
        let id = safe_id(&name);
        if !valid_backup_id(&id) {
            return Err(AxisError::invalid("Invalid backup name"));
        }

        let dest = self.backup_path(server_id, &id);
        let info = BackupInfo { id: id.clone(), name: name.clone(), size: 0, created_at: now, completed: false };
        {
            let mut map = self.in_progress.lock().unwrap_or_else(|e| e.into_inner());
            let key = (server_id.to_string(), id.clone());
            if map.contains_key(&key) || dest.exists() {
                return Err(AxisError::conflict("A backup with this name already exists"));
            }
            map.insert(key, info.clone());
        }

        let this = self.clone();
        let server = server_id.to_string();
        let entry = info.clone();
        tokio::spawn(async move {
            this.write_backup(&server, &entry, &dest).await;
        });
        Ok(info)
    }

    async fn write_backup(&self, server_id: &str, entry: &BackupInfo, dest: &Path) {
        let backup_id = entry.id.as_str();
        let bus = self.engine.bus().clone();
        bus.system(server_id, &format!("Creating backup: {}", entry.name));
        info!("Creating backup {} for {}", backup_id, server_id);

        let result = match self.write_archive(server_id, dest).await {
            Ok(()) => self.write_meta(server_id, entry),
            Err(e) => Err(e),
        };
        match &result {
            Ok(()) => {
                let size = std::fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
                bus.system(server_id, "Backup completed");
                info!("Backup {} for {} complete ({} bytes)", backup_id, server_id, size);
            }
            Err(e) => {
                error!("Backup {} for {} failed: {}", backup_id, server_id, e);
                bus.system(server_id, &format!("Backup failed: {}", e));
                let _ = std::fs::remove_file(dest);
                let _ = std::fs::remove_file(self.meta_path(server_id, backup_id));
            }
        }
        if let Ok(mut map) = self.in_progress.lock() {
            map.remove(&(server_id.to_string(), backup_id.to_string()));
        }
    }

    async fn write_archive(&self, server_id: &str, dest: &Path) -> Result<()> {
        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        if self.engine.status(server_id).await == ServerStatus::Running {
            let file = std::fs::File::create(dest)?;
            let argv: Vec<String> = ["tar", "-czf", "-", "-C", CONTAINER_HOME, "."]
                .iter().map(|s| s.to_string()).collect();
            let outcome = self.engine.runtime().exec(&container_name(server_id), &argv, None, Some(file)).await?;
            match outcome.exit_code {
                0 => Ok(()),
                // GNU tar: some files changed while being read
                1 => {
                    warn!("Backup of {}: files changed during archive", server_id);
                    Ok(())
                }
                code => Err(AxisError::driver(format!("tar exited with code {}", code))),
            }
        } else {
            tar_dir(&self.engine.data_path(server_id), dest).await
        }
    }

    // ─── List / delete ───

    /// On-disk backups merged with in-progress entries, newest first
    pub fn list(&self, server_id: &str) -> Result<Vec<BackupInfo>> {
        validate_server_id(server_id)?;
        let pending: Vec<BackupInfo> = self.in_progress.lock()
            .map(|m| m.iter().filter(|((s, _), _)| s == server_id).map(|(_, b)| b.clone()).collect())
            .unwrap_or_default();

        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(self.server_dir(server_id)) {
            for entry in entries.flatten() {
                let file_name = entry.file_name().to_string_lossy().to_string();
                let Some(id) = file_name.strip_suffix(".tar.gz") else { continue };
                let Ok(meta) = entry.metadata() else { continue };
                if !meta.is_file() {
                    continue;
                }
                if let Some(p) = pending.iter().find(|p| p.id == id) {
                    out.push(BackupInfo { size: meta.len(), ..p.clone() });
                    continue;
                }
                let (name, created_at) = match self.read_meta(server_id, id) {
                    Some(m) => (m.name, m.created_at),
                    None => (
                        id.to_string(),
                        meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
                    ),
                };
                out.push(BackupInfo {
                    id: id.to_string(),
                    name,
                    size: meta.len(),
                    created_at,
                    completed: true,
                });
            }
        }
        for p in pending {
            if !out.iter().any(|b| b.id == p.id) {
                out.push(p);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    pub fn delete(&self, server_id: &str, backup_id: &str) -> Result<()> {
        let path = self.backup_file(server_id, backup_id)?;
        std::fs::remove_file(&path)?;
        if let Err(e) = std::fs::remove_file(self.meta_path(server_id, backup_id)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove metadata for backup {}: {}", backup_id, e);
            }
        }
        info!("Deleted backup {} for {}", backup_id, server_id);
        Ok(())
    }

    // ─── Restore ───

    /// Replace the data dir with the backup's content. The server must be stopped.
    pub async fn restore(&self, server_id: &str, backup_id: &str) -> Result<()> {
        let archive = self.backup_file(server_id, backup_id)?;
        if self.engine.status(server_id).await == ServerStatus::Running {
            return Err(AxisError::Locked("Server must be stopped before restoring a backup".to_string()));
        }
        let bus = self.engine.bus().clone();
        let files = self.engine.files(server_id);

        bus.system(server_id, &format!("Restoring backup: {}", backup_id));
        bus.system(server_id, "Clearing server files...");
        files.clear()?;
        files.ensure_root()?;
        bus.system(server_id, "Extracting backup...");
        if let Err(e) = untar_into(&archive, files.root()).await {
            bus.system(server_id, &format!("Restore failed: {}", e));
            return Err(e);
        }
        let root = files.root().to_path_buf();
        tokio::task::spawn_blocking(move || chown_recursive(&root)).await
            .map_err(|e| AxisError::internal(e.to_string()))?;
        bus.system(server_id, "Backup restored");
        info!("Restored backup {} for {}", backup_id, server_id);
        Ok(())
    }

    // ─── Transfer archives ───

    pub fn archive_path(&self, server_id: &str) -> PathBuf {
        self.backup_dir.join(TRANSFER_DIR).join(format!("{}-transfer.tar.gz", server_id))
    }

    pub async fn archive_server(&self, server_id: &str) -> Result<ArchiveInfo> {
        validate_server_id(server_id)?;
        let data = self.engine.data_path(server_id);
        if !data.is_dir() {
            return Err(AxisError::not_found("Server data directory not found"));
        }
        let path = self.archive_path(server_id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        if let Err(e) = tar_dir(&data, &path).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }
        let size = tokio::fs::metadata(&path).await?.len();
        info!("Transfer archive for {} ready ({} bytes)", server_id, size);
        Ok(ArchiveInfo { path, size })
    }

    /// Path of an existing transfer archive
    pub fn archive_file(&self, server_id: &str) -> Result<PathBuf> {
        validate_server_id(server_id)?;
        let path = self.archive_path(server_id);
        if !path.is_file() {
            return Err(AxisError::not_found("Transfer archive not found"));
        }
        Ok(path)
    }

    pub async fn delete_archive(&self, server_id: &str) -> Result<()> {
        validate_server_id(server_id)?;
        match tokio::fs::remove_file(self.archive_path(server_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Extract a transfer archive into the server's data dir
    pub async fn import_server(&self, server_id: &str, archive: &Path) -> Result<()> {
        validate_server_id(server_id)?;
        let files = self.engine.files(server_id);
        files.ensure_root()?;
        untar_into(archive, files.root()).await?;
        let root = files.root().to_path_buf();
        tokio::task::spawn_blocking(move || chown_recursive(&root)).await
            .map_err(|e| AxisError::internal(e.to_string()))?;
        info!("Imported server {} from {}", server_id, archive.display());
        Ok(())
    }

    /// Pull a transfer archive from another node, then import it
    pub async fn import_from_url(&self, server_id: &str, url: &str, token: &str) -> Result<()> {
        validate_server_id(server_id)?;
        let url = reqwest::Url::parse(url).map_err(|_| AxisError::invalid("Invalid archive URL"))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AxisError::invalid("Invalid archive URL"));
        }
        let staging = self.backup_dir.join(TRANSFER_DIR).join(format!("{}-import.tar.gz", server_id));
        if let Some(dir) = staging.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let result = async {
            let size = fetch_archive(self.accept_invalid_certs, url, token, &staging).await?;
            info!("Downloaded transfer archive for {} ({} bytes)", server_id, size);
            self.import_server(server_id, &staging).await
        }
        .await;
        let _ = tokio::fs::remove_file(&staging).await;
        result
    }

    /// Where a multipart upload is streamed before import
    pub async fn upload_staging_path(&self, server_id: &str) -> Result<PathBuf> {
        validate_server_id(server_id)?;
        let dir = self.backup_dir.join(TRANSFER_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir.join(format!("{}-upload.tar.gz", server_id)))
    }

    /// Import a staged upload; the staging file is removed either way
    pub async fn import_staged(&self, server_id: &str, staging: &Path) -> Result<()> {
        let result = self.import_server(server_id, staging).await;
        let _ = tokio::fs::remove_file(staging).await;
        result
    }
}

/// Stream a node-to-node archive to disk. No overall timeout: archives can be large.
async fn fetch_archive(accept_invalid_certs: bool, url: reqwest::Url, token: &str, target: &Path) -> Result<u64> {
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(accept_invalid_certs)
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()?;
    let resp = client.get(url).bearer_auth(token).send().await?;
    if !resp.status().is_success() {
        return Err(AxisError::NodeUnreachable(format!("Archive download failed: HTTP {}", resp.status())));
    }
    let mut file = tokio::fs::File::create(target).await?;
    let mut stream = resp.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tests::{config, engine};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, TempDir, crate::containers::mock::FakeRuntime, Arc<BackupEngine>) {
        let (data, rt, engine) = engine();
        engine.create(&config("s1")).await.unwrap();
        let backups = TempDir::new().unwrap();
        let be = Arc::new(BackupEngine::new(engine, backups.path().to_path_buf()));
        (data, backups, rt, be)
    }

    async fn wait_completed(be: &BackupEngine, id: &str) -> BackupInfo {
        for _ in 0..500 {
            if let Some(b) = be.list("s1").unwrap().into_iter().find(|b| b.id == id && b.completed) {
                return b;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("backup {} never completed", id);
    }

    #[test]
    fn safe_ids() {
        assert_eq!(safe_id("nightly 2024-01-01 03:00"), "nightly-2024-01-01-03-00");
        assert!(!valid_backup_id("../etc"));
        assert!(!valid_backup_id(""));
        assert!(valid_backup_id("nightly-1"));
    }

    #[tokio::test]
    async fn cold_backup_and_restore() {
        let (_d, _b, _rt, be) = setup().await;
        let files = be.engine.files("s1");
        files.write("world/level.dat", b"original").unwrap();

        let info = be.create("s1", Some("before update")).unwrap();
        assert_eq!(info.id, "before-update");
        assert!(!info.completed);
        let done = wait_completed(&be, "before-update").await;
        assert!(done.size > 0);

        files.write("world/level.dat", b"changed").unwrap();
        files.write("junk.txt", b"x").unwrap();
        be.restore("s1", "before-update").await.unwrap();
        assert_eq!(files.read("world/level.dat").unwrap(), "original");
        assert!(!files.is_file("junk.txt"));
    }

    #[tokio::test]
    async fn hot_backup_uses_exec() {
        let (_d, _b, rt, be) = setup().await;
        be.engine.start("s1").await.unwrap();
        rt.with(|s| s.exec_output = b"tarbytes".to_vec());

        be.create("s1", Some("live")).unwrap();
        let done = wait_completed(&be, "live").await;
        assert_eq!(done.size, 8);
        assert!(rt.calls().contains(&"exec axis-s1 tar -czf - -C /home/container .".to_string()));

        // restore refuses while running
        assert!(matches!(be.restore("s1", "live").await, Err(AxisError::Locked(_))));
    }

    #[tokio::test]
    async fn duplicate_and_missing_backups() {
        let (_d, _b, _rt, be) = setup().await;
        be.create("s1", Some("a")).unwrap();
        assert!(matches!(be.create("s1", Some("a")), Err(AxisError::Conflict(_))));
        wait_completed(&be, "a").await;
        assert!(matches!(be.create("s1", Some("a")), Err(AxisError::Conflict(_))));

        be.delete("s1", "a").unwrap();
        assert!(be.list("s1").unwrap().is_empty());
        assert!(matches!(be.delete("s1", "a"), Err(AxisError::NotFound(_))));
        assert!(matches!(be.backup_file("s1", "../x"), Err(AxisError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn display_name_survives_listing() {
        let (_d, backups, _rt, be) = setup().await;
        let info = be.create("s1", Some("nightly 03:00")).unwrap();
        assert_eq!(info.id, "nightly-03-00");
        let done = wait_completed(&be, "nightly-03-00").await;
        assert_eq!(done.name, "nightly 03:00");
        assert_eq!(done.created_at, info.created_at);

        // A restarted node reads the name back from disk
        let fresh = BackupEngine::new(be.engine.clone(), backups.path().to_path_buf());
        let listed = fresh.list("s1").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "nightly 03:00");

        fresh.delete("s1", "nightly-03-00").unwrap();
        assert!(!backups.path().join("s1/nightly-03-00.json").exists());
        assert!(fresh.list("s1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn unnamed_tar_lists_under_its_id() {
        let (_d, backups, _rt, be) = setup().await;
        std::fs::create_dir_all(backups.path().join("s1")).unwrap();
        std::fs::write(backups.path().join("s1/manual.tar.gz"), b"x").unwrap();
        let listed = be.list("s1").unwrap();
        assert_eq!(listed[0].id, "manual");
        assert_eq!(listed[0].name, "manual");
    }

    fn self_signed() -> openssl::ssl::SslAcceptorBuilder {
        use openssl::asn1::Asn1Time;
        use openssl::bn::BigNum;
        use openssl::hash::MessageDigest;
        use openssl::pkey::PKey;
        use openssl::rsa::Rsa;
        use openssl::ssl::{SslAcceptor, SslMethod};
        use openssl::x509::{X509NameBuilder, X509};

        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "localhost").unwrap();
        let name = name.build();
        let mut cert = X509::builder().unwrap();
        cert.set_version(2).unwrap();
        cert.set_serial_number(&BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap()).unwrap();
        cert.set_subject_name(&name).unwrap();
        cert.set_issuer_name(&name).unwrap();
        cert.set_pubkey(&key).unwrap();
        cert.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        cert.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
        cert.sign(&key, MessageDigest::sha256()).unwrap();
        let cert = cert.build();

        let mut acceptor = SslAcceptor::mozilla_intermediate(SslMethod::tls()).unwrap();
        acceptor.set_private_key(&key).unwrap();
        acceptor.set_certificate(&cert).unwrap();
        acceptor
    }

    #[actix_web::test]
    async fn archive_download_checks_certificates_unless_told_not_to() {
        use actix_web::{web, App, HttpResponse, HttpServer};

        let (_d, backups, _rt, be) = setup().await;
        be.engine.files("s1").write("server.properties", b"motd=moved\n").unwrap();
        let archive = be.archive_server("s1").await.unwrap();
        let body = web::Bytes::from(std::fs::read(&archive.path).unwrap());

        let server = HttpServer::new(move || {
            let body = body.clone();
            App::new().route("/archive", web::get().to(move || {
                let body = body.clone();
                async move { HttpResponse::Ok().body(body) }
            }))
        })
        .workers(1)
        .bind_openssl(("127.0.0.1", 0), self_signed())
        .unwrap();
        let url = format!("https://127.0.0.1:{}/archive", server.addrs()[0].port());
        actix_rt::spawn(server.run());

        let strict = be.import_from_url("s2", &url, "abcd.secret").await;
        assert!(matches!(strict, Err(AxisError::NodeUnreachable(_))), "{:?}", strict);
        assert!(!be.engine.files("s2").is_file("server.properties"));

        let trusting = BackupEngine::new(be.engine.clone(), backups.path().to_path_buf()).accept_invalid_certs(true);
        trusting.import_from_url("s2", &url, "abcd.secret").await.unwrap();
        assert_eq!(be.engine.files("s2").read("server.properties").unwrap(), "motd=moved\n");
    }

    #[tokio::test]
    async fn archive_and_import() {
        let (_d, _b, _rt, be) = setup().await;
        be.engine.files("s1").write("server.properties", b"motd=hi\n").unwrap();

        let archive = be.archive_server("s1").await.unwrap();
        assert!(archive.path.ends_with("transfers/s1-transfer.tar.gz"));
        assert!(archive.size > 0);

        be.import_server("s2", &archive.path).await.unwrap();
        assert_eq!(be.engine.files("s2").read("server.properties").unwrap(), "motd=hi\n");

        be.delete_archive("s1").await.unwrap();
        assert!(matches!(be.archive_file("s1"), Err(AxisError::NotFound(_))));
        be.delete_archive("s1").await.unwrap();
    }
}
