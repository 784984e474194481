// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Node Lifecycle Engine: install, create, start, graceful stop, kill,
//! reinstall and delete of server containers.
//!
//! Container names are derived from the server id (`axis-<id>`), so the name
//! is the only handle ever needed. The last `ServerConfig` seen for each
//! server is cached in memory and mirrored to `<data_dir>/.configs/<id>.json`
//! so graceful stop can find its stop command after a daemon restart.

mod logs;
mod stats;

pub use logs::{parse_since, LogSearch, FOLLOW_TAIL};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::containers::{
    container_name, install_container_name, validate_server_id, ContainerRuntime, ContainerSpec,
    LogOptions, RestartPolicy, StdinWriter, CONTAINER_HOME,
};
use crate::error::{AxisError, Result};
use crate::files::patch::{apply_config_patches, interpolate};
use crate::files::{node_ids, ServerFiles};
use crate::logbus::LogBus;
use crate::protocol::{default_stop_timeout, ServerConfig, ServerStatus, StopOptions};

const INSTALL_TIMEOUT: Duration = Duration::from_secs(600);
/// Grace given to an old container that is about to be replaced
const REPLACE_STOP_TIMEOUT: u64 = 10;
const CONFIG_DIR: &str = ".configs";

pub struct Engine {
    runtime: Arc<dyn ContainerRuntime>,
    bus: Arc<LogBus>,
    data_dir: PathBuf,
    configs: RwLock<HashMap<String, ServerConfig>>,
    stdin: tokio::sync::Mutex<HashMap<String, StdinWriter>>,
    start_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    installing: RwLock<HashSet<String>>,
    /// Last create/reinstall error, kept until the next attempt
    failed: RwLock<HashMap<String, String>>,
    stats: Mutex<HashMap<String, stats::CachedStats>>,
    disk: Mutex<HashMap<String, stats::CachedDisk>>,
    followers: Mutex<HashMap<String, logs::Follower>>,
    follower_generation: AtomicU64,
}

impl Engine {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, bus: Arc<LogBus>, data_dir: PathBuf) -> Self {
        Self {
            runtime,
            bus,
            data_dir,
            configs: RwLock::new(HashMap::new()),
            stdin: tokio::sync::Mutex::new(HashMap::new()),
            start_locks: Mutex::new(HashMap::new()),
            installing: RwLock::new(HashSet::new()),
            failed: RwLock::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            disk: Mutex::new(HashMap::new()),
            followers: Mutex::new(HashMap::new()),
            follower_generation: AtomicU64::new(0),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn bus(&self) -> &Arc<LogBus> {
        &self.bus
    }

    pub fn data_path(&self, id: &str) -> PathBuf {
        self.data_dir.join(id)
    }

    pub fn files(&self, id: &str) -> ServerFiles {
        ServerFiles::new(self.data_path(id))
    }

    // ─── Config cache ───

    fn config_path(&self, id: &str) -> PathBuf {
        self.data_dir.join(CONFIG_DIR).join(format!("{}.json", id))
    }

    fn remember_config(&self, cfg: &ServerConfig) {
        if let Ok(mut configs) = self.configs.write() {
            configs.insert(cfg.id.clone(), cfg.clone());
        }
        let path = self.config_path(&cfg.id);
        let write = || -> std::io::Result<()> {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let json = serde_json::to_string_pretty(cfg).map_err(std::io::Error::other)?;
            std::fs::write(&path, json)
        };
        if let Err(e) = write() {
            warn!("Could not persist config for {}: {}", cfg.id, e);
        }
    }

    pub fn cached_config(&self, id: &str) -> Option<ServerConfig> {
        if let Some(cfg) = self.configs.read().ok().and_then(|c| c.get(id).cloned()) {
            return Some(cfg);
        }
        let text = std::fs::read_to_string(self.config_path(id)).ok()?;
        let cfg: ServerConfig = serde_json::from_str(&text).ok()?;
        if let Ok(mut configs) = self.configs.write() {
            configs.insert(id.to_string(), cfg.clone());
        }
        Some(cfg)
    }

    fn forget_config(&self, id: &str) {
        if let Ok(mut configs) = self.configs.write() {
            configs.remove(id);
        }
        let _ = std::fs::remove_file(self.config_path(id));
    }

    // ─── Installing set ───

    fn set_installing(&self, id: &str, on: bool) {
        if let Ok(mut set) = self.installing.write() {
            if on {
                set.insert(id.to_string());
            } else {
                set.remove(id);
            }
        }
    }

    pub fn is_installing(&self, id: &str) -> bool {
        self.installing.read().map(|s| s.contains(id)).unwrap_or(false)
    }

    /// Why the last create or reinstall of `id` failed, if it did
    pub fn failure(&self, id: &str) -> Option<String> {
        self.failed.read().ok().and_then(|f| f.get(id).cloned())
    }

    fn record_outcome(&self, id: &str, result: &Result<()>) {
        if let Ok(mut failed) = self.failed.write() {
            match result {
                Ok(()) => {
                    failed.remove(id);
                }
                Err(e) => {
                    failed.insert(id.to_string(), e.to_string());
                }
            }
        }
    }

    fn start_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.start_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id.to_string()).or_default().clone()
    }

    // ─── Container specs ───

    fn server_spec(&self, cfg: &ServerConfig) -> ContainerSpec {
        let startup = interpolate(&cfg.startup, &cfg.variables);
        let mut env = cfg.variables.clone();
        env.insert("STARTUP".to_string(), startup.clone());
        env.entry("SERVER_MEMORY".to_string()).or_insert_with(|| cfg.memory.to_string());
        env.insert("HOME".to_string(), CONTAINER_HOME.to_string());
        let (uid, gid) = node_ids();

        ContainerSpec {
            name: container_name(&cfg.id),
            image: cfg.docker_image.clone(),
            cmd: vec!["/bin/sh".to_string(), "-c".to_string(), startup],
            working_dir: CONTAINER_HOME.to_string(),
            user: Some(format!("{}:{}", uid, gid)),
            env,
            ports: cfg.ports.clone(),
            binds: vec![(self.data_path(&cfg.id), CONTAINER_HOME.to_string())],
            memory_bytes: (cfg.memory > 0).then(|| cfg.memory * 1024 * 1024),
            // hundredths of a core -> nano cpus
            nano_cpus: (cfg.cpu > 0).then(|| cfg.cpu * 10_000_000),
            stop_signal: Some(cfg.stop_signal.clone()).filter(|s| !s.is_empty()),
            tty: true,
            open_stdin: true,
            restart_policy: RestartPolicy::UnlessStopped,
        }
    }

    fn install_spec(&self, cfg: &ServerConfig, image: &str, script: &str) -> ContainerSpec {
        let (shell, body) = prepare_install_script(script, image, &cfg.variables);
        ContainerSpec {
            name: install_container_name(&cfg.id),
            image: image.to_string(),
            cmd: vec![shell.to_string(), "-c".to_string(), body],
            working_dir: CONTAINER_HOME.to_string(),
            user: None,
            env: cfg.variables.clone(),
            ports: Vec::new(),
            binds: vec![(self.data_path(&cfg.id), CONTAINER_HOME.to_string())],
            memory_bytes: None,
            nano_cpus: None,
            stop_signal: None,
            tty: true,
            open_stdin: false,
            restart_policy: RestartPolicy::No,
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if !self.runtime.image_present(image).await? {
            self.runtime.pull_image(image).await?;
        }
        Ok(())
    }

    // ─── Create / install ───

    /// Full provisioning: data dir, install script, server container
    pub async fn create(&self, cfg: &ServerConfig) -> Result<()> {
        validate_server_id(&cfg.id)?;
        let result = self.provision(cfg).await;
        self.record_outcome(&cfg.id, &result);
        result
    }

    async fn provision(&self, cfg: &ServerConfig) -> Result<()> {
        self.files(&cfg.id).ensure_root()?;
        self.remember_config(cfg);
        info!("Creating server {} ({})", cfg.id, cfg.docker_image);

        if cfg.has_install_script() {
            self.install(cfg).await?;
        }
        self.create_container(cfg).await
    }

    async fn install(&self, cfg: &ServerConfig) -> Result<()> {
        self.set_installing(&cfg.id, true);
        let result = self.run_install(cfg).await;
        self.set_installing(&cfg.id, false);
        if let Err(e) = &result {
            error!("Install for {} failed: {}", cfg.id, e);
            self.bus.system(&cfg.id, &format!("Install failed: {}", e));
        }
        result
    }

    async fn run_install(&self, cfg: &ServerConfig) -> Result<()> {
        let Some(script) = cfg.install_script.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(());
        };
        let image = cfg.install_image.clone()
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| cfg.docker_image.clone());
        self.bus.system(&cfg.id, &format!("Pulling install image {}", image));
        self.ensure_image(&image).await?;

        let name = install_container_name(&cfg.id);
        if self.runtime.inspect(&name).await?.is_some() {
            let _ = self.runtime.remove(&name, true).await;
        }
        self.bus.system(&cfg.id, "Running install script...");
        self.runtime.create(&self.install_spec(cfg, &image, script)).await?;

        let outcome = async {
            self.runtime.start(&name).await?;
            let pump = match self.runtime.logs(&name, LogOptions { tail: None, follow: true, since: None }).await {
                Ok(stream) => Some(tokio::spawn(logs::pump_lines(stream, self.bus.clone(), cfg.id.clone()))),
                Err(e) => {
                    warn!("Cannot follow install output for {}: {}", cfg.id, e);
                    None
                }
            };
            let code = tokio::time::timeout(INSTALL_TIMEOUT, self.runtime.wait_not_running(&name)).await??;
            if let Some(pump) = pump {
                let abort = pump.abort_handle();
                if tokio::time::timeout(Duration::from_secs(2), pump).await.is_err() {
                    abort.abort();
                }
            }
            Ok::<i64, AxisError>(code)
        }
        .await;

        if let Err(e) = self.runtime.remove(&name, true).await {
            debug!("Removing install container {}: {}", name, e);
        }
        let code = outcome?;
        if code != 0 {
            return Err(AxisError::driver(format!("install script exited with code {}", code)));
        }
        self.files(&cfg.id).ensure_root()?;
        self.bus.system(&cfg.id, "Install completed");
        info!("Install for {} completed", cfg.id);
        Ok(())
    }

    /// (Re)create only the server container, replacing any existing one
    pub async fn create_container(&self, cfg: &ServerConfig) -> Result<()> {
        validate_server_id(&cfg.id)?;
        self.ensure_image(&cfg.docker_image).await?;

        let name = container_name(&cfg.id);
        if self.runtime.inspect(&name).await?.is_some() {
            self.detach(&cfg.id).await;
            if let Err(e) = self.runtime.stop(&name, REPLACE_STOP_TIMEOUT).await {
                debug!("Stopping {} before replace: {}", name, e);
            }
            self.runtime.remove(&name, true).await?;
        }

        match apply_config_patches(&self.files(&cfg.id), &cfg.config_files, &cfg.variables) {
            Ok(n) if n > 0 => debug!("Applied {} config patches for {}", n, cfg.id),
            Ok(_) => {}
            Err(e) => warn!("Config patches for {} failed: {}", cfg.id, e),
        }

        self.runtime.create(&self.server_spec(cfg)).await?;
        self.remember_config(cfg);
        self.bus.system(&cfg.id, "Server container created");
        Ok(())
    }

    // ─── Power ───

    pub async fn start(&self, id: &str) -> Result<()> {
        validate_server_id(id)?;
        let lock = self.start_lock(id);
        let _guard = lock.lock().await;
        self.start_locked(id).await
    }

    /// Start, recreating from `cfg` first. An empty data dir with an install
    /// script gets the full install; otherwise only the container is rebuilt.
    pub async fn start_with_config(&self, cfg: &ServerConfig) -> Result<()> {
        validate_server_id(&cfg.id)?;
        let lock = self.start_lock(&cfg.id);
        let _guard = lock.lock().await;

        if let Some(state) = self.runtime.inspect(&container_name(&cfg.id)).await? {
            if state.running {
                return Ok(());
            }
        }
        let files = self.files(&cfg.id);
        if files.is_empty() && cfg.has_install_script() {
            self.create(cfg).await?;
        } else {
            files.ensure_root()?;
            self.create_container(cfg).await?;
        }
        self.start_locked(&cfg.id).await
    }

    async fn start_locked(&self, id: &str) -> Result<()> {
        if self.is_installing(id) {
            return Err(AxisError::Locked("Server is still installing".to_string()));
        }
        let name = container_name(id);
        let state = self.runtime.inspect(&name).await?
            .ok_or_else(|| AxisError::not_found("Server container does not exist"))?;
        if state.running {
            debug!("Server {} already running", id);
            return Ok(());
        }

        if let Err(e) = self.runtime.set_restart_policy(&name, RestartPolicy::UnlessStopped).await {
            warn!("Could not restore restart policy on {}: {}", name, e);
        }
        self.bus.system(id, "Server marked as starting...");
        self.runtime.start(&name).await?;
        self.invalidate_stats(id);

        self.stdin.lock().await.remove(id);
        if let Err(e) = self.attach(id).await {
            warn!("stdin attach for {} failed: {}", id, e);
        }
        info!("Server {} started", id);
        Ok(())
    }

    /// Graceful stop: restart policy off, stop command on stdin, then signal
    pub async fn stop(&self, id: &str, opts: &StopOptions) -> Result<()> {
        validate_server_id(id)?;
        let name = container_name(id);
        let state = self.runtime.inspect(&name).await?
            .ok_or_else(|| AxisError::not_found("Server container does not exist"))?;

        if let Err(e) = self.runtime.set_restart_policy(&name, RestartPolicy::No).await {
            warn!("Could not disable restart policy on {}: {}", name, e);
        }
        if !state.running && !state.restarting {
            self.after_stop(id).await;
            return Ok(());
        }

        let cached = self.cached_config(id);
        let stop_command = opts.stop_command.clone()
            .filter(|c| !c.trim().is_empty())
            .or_else(|| cached.as_ref().and_then(|c| c.stop_command.clone()).filter(|c| !c.trim().is_empty()));
        let timeout = opts.stop_timeout
            .or_else(|| cached.as_ref().map(|c| c.stop_timeout))
            .unwrap_or_else(default_stop_timeout);
        let signal = opts.stop_signal.clone()
            .filter(|s| !s.is_empty())
            .or_else(|| cached.as_ref().map(|c| c.stop_signal.clone()))
            .unwrap_or_else(|| "SIGTERM".to_string());

        if let Some(cmd) = stop_command {
            self.bus.system(id, &format!("Sending stop command: {}", cmd));
            match self.write_stdin(id, &cmd).await {
                Ok(()) => {
                    if self.wait_stopped(&name, timeout).await {
                        self.after_stop(id).await;
                        self.bus.system(id, "Server stopped gracefully");
                        info!("Server {} stopped gracefully", id);
                        return Ok(());
                    }
                    self.bus.system(id, &format!("Server did not stop within {}s, sending {}", timeout, signal));
                }
                Err(e) => {
                    warn!("Stop command for {} failed: {}", id, e);
                    self.bus.system(id, &format!("Stop command failed, sending {}", signal));
                }
            }
        } else {
            self.bus.system(id, &format!("Sending {}", signal));
        }

        if let Err(e) = self.runtime.stop(&name, timeout).await {
            self.bus.system(id, &format!("Stop failed: {}", e));
            return Err(e);
        }
        if let Some(state) = self.runtime.inspect(&name).await? {
            if state.running {
                return Err(AxisError::driver("Container is still running after stop"));
            }
        }
        self.after_stop(id).await;
        self.bus.system(id, "Server stopped");
        info!("Server {} stopped", id);
        Ok(())
    }

    async fn wait_stopped(&self, name: &str, timeout_secs: u64) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(timeout_secs), self.runtime.wait_not_running(name)).await,
            Ok(Ok(_))
        )
    }

    pub async fn kill(&self, id: &str) -> Result<()> {
        validate_server_id(id)?;
        let name = container_name(id);
        if self.runtime.inspect(&name).await?.is_none() {
            return Err(AxisError::not_found("Server container does not exist"));
        }
        if let Err(e) = self.runtime.set_restart_policy(&name, RestartPolicy::No).await {
            warn!("Could not disable restart policy on {}: {}", name, e);
        }
        self.runtime.kill(&name).await?;
        self.after_stop(id).await;
        self.bus.system(id, "Server killed");
        info!("Server {} killed", id);
        Ok(())
    }

    /// Graceful stop then start; runtime restart if the stop path fails
    pub async fn restart(&self, id: &str, opts: &StopOptions) -> Result<()> {
        match self.stop(id, opts).await {
            Ok(()) => self.start(id).await,
            Err(e @ (AxisError::NotFound(_) | AxisError::InvalidInput(_))) => Err(e),
            Err(e) => {
                warn!("Graceful stop of {} failed ({}), using runtime restart", id, e);
                let name = container_name(id);
                let timeout = opts.stop_timeout
                    .or_else(|| self.cached_config(id).map(|c| c.stop_timeout))
                    .unwrap_or_else(default_stop_timeout);
                if let Err(e) = self.runtime.set_restart_policy(&name, RestartPolicy::UnlessStopped).await {
                    warn!("Could not restore restart policy on {}: {}", name, e);
                }
                self.runtime.restart(&name, timeout).await?;
                self.invalidate_stats(id);
                self.stdin.lock().await.remove(id);
                if let Err(e) = self.attach(id).await {
                    warn!("stdin attach for {} failed: {}", id, e);
                }
                self.bus.system(id, "Server restarted");
                Ok(())
            }
        }
    }

    pub async fn reinstall(&self, cfg: &ServerConfig) -> Result<()> {
        validate_server_id(&cfg.id)?;
        let result = self.rebuild(cfg).await;
        self.record_outcome(&cfg.id, &result);
        result
    }

    async fn rebuild(&self, cfg: &ServerConfig) -> Result<()> {
        let name = container_name(&cfg.id);
        self.bus.system(&cfg.id, "Reinstalling server...");
        if self.runtime.inspect(&name).await?.is_some() {
            self.detach(&cfg.id).await;
            if let Err(e) = self.runtime.stop(&name, REPLACE_STOP_TIMEOUT).await {
                debug!("Stopping {} before reinstall: {}", name, e);
            }
            self.runtime.remove(&name, true).await?;
        }
        self.files(&cfg.id).ensure_root()?;
        self.remember_config(cfg);
        if cfg.has_install_script() {
            self.install(cfg).await?;
        }
        self.create_container(cfg).await?;
        info!("Server {} reinstalled", cfg.id);
        Ok(())
    }

    /// Kill and remove the container now; the data dir goes in the background
    pub async fn delete(&self, id: &str) -> Result<()> {
        validate_server_id(id)?;
        let name = container_name(id);
        self.detach(id).await;
        if self.runtime.inspect(&name).await?.is_some() {
            if let Err(e) = self.runtime.kill(&name).await {
                debug!("Kill before delete of {}: {}", name, e);
            }
            self.runtime.remove(&name, true).await?;
        }
        self.forget_config(id);
        self.forget_stats(id);
        if let Ok(mut failed) = self.failed.write() {
            failed.remove(id);
        }
        if let Ok(mut locks) = self.start_locks.lock() {
            locks.remove(id);
        }

        let dir = self.data_path(id);
        let server = id.to_string();
        tokio::spawn(async move {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => info!("Removed data dir for {}", server),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove data dir {}: {}", dir.display(), e),
            }
        });
        info!("Server {} deleted", id);
        Ok(())
    }

    // ─── Console input ───

    pub async fn send_command(&self, id: &str, command: &str) -> Result<()> {
        validate_server_id(id)?;
        if self.status(id).await != ServerStatus::Running {
            return Err(AxisError::conflict("Server is not running"));
        }
        self.write_stdin(id, command).await
    }

    async fn attach(&self, id: &str) -> Result<()> {
        let writer = self.runtime.attach_stdin(&container_name(id)).await?;
        self.stdin.lock().await.insert(id.to_string(), writer);
        Ok(())
    }

    /// Write `line\n` to the attached stdin, re-attaching once on failure
    async fn write_stdin(&self, id: &str, line: &str) -> Result<()> {
        let data = format!("{}\n", line.trim_end_matches(['\r', '\n']));
        let mut map = self.stdin.lock().await;
        for attempt in 0..2 {
            if !map.contains_key(id) {
                let writer = self.runtime.attach_stdin(&container_name(id)).await?;
                map.insert(id.to_string(), writer);
            }
            let Some(writer) = map.get_mut(id) else { continue };
            let written = async {
                writer.write_all(data.as_bytes()).await?;
                writer.flush().await
            }
            .await;
            match written {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("stdin write to {} failed (attempt {}): {}", id, attempt + 1, e);
                    map.remove(id);
                }
            }
        }
        Err(AxisError::driver("Could not write to server console"))
    }

    /// Drop stdin and the log follower for a container that is going away
    async fn detach(&self, id: &str) {
        self.stop_follower(id);
        self.stdin.lock().await.remove(id);
    }

    async fn after_stop(&self, id: &str) {
        self.stdin.lock().await.remove(id);
        self.stop_follower(id);
        self.invalidate_stats(id);
    }

    // ─── Status ───

    pub async fn status(&self, id: &str) -> ServerStatus {
        if self.is_installing(id) {
            return ServerStatus::Installing;
        }
        match self.runtime.inspect(&container_name(id)).await {
            Ok(None) if self.failure(id).is_some() => ServerStatus::Failed,
            Ok(state) => crate::containers::infer_status(state.as_ref()),
            Err(e) => {
                debug!("inspect {} failed: {}", id, e);
                ServerStatus::Offline
            }
        }
    }
}

/// Interpolate the script; alpine images get the tooling preamble
pub fn prepare_install_script(script: &str, image: &str, vars: &std::collections::BTreeMap<String, String>) -> (&'static str, String) {
    let body = interpolate(script, vars).replace("\r\n", "\n");
    if image.contains("alpine") {
        (
            "/bin/sh",
            format!(
                "apk add --no-cache curl jq bash && cd {home} && {body} && chmod -R 777 {home}",
                home = CONTAINER_HOME,
                body = body
            ),
        )
    } else {
        ("/bin/bash", body)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::containers::mock::FakeRuntime;
    use crate::logbus::{Subscription, SYSTEM_PREFIX};
    use crate::protocol::{PortMapping, PortProtocol};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    pub(crate) fn engine() -> (TempDir, FakeRuntime, Arc<Engine>) {
        let dir = TempDir::new().unwrap();
        let rt = FakeRuntime::new();
        let engine = Arc::new(Engine::new(Arc::new(rt.clone()), Arc::new(LogBus::new()), dir.path().to_path_buf()));
        (dir, rt, engine)
    }

    pub(crate) fn config(id: &str) -> ServerConfig {
        let mut variables = BTreeMap::new();
        variables.insert("SERVER_PORT".to_string(), "25565".to_string());
        variables.insert("VERSION".to_string(), "1.21".to_string());
        ServerConfig {
            id: id.to_string(),
            docker_image: "ghcr.io/games/java:21".into(),
            startup: "java -Dversion={{VERSION}} -jar server.jar".into(),
            memory: 1024,
            cpu: 150,
            disk: 0,
            ports: vec![PortMapping { host_port: 25570, container_port: 25565, protocol: PortProtocol::Tcp }],
            variables,
            install_script: None,
            install_image: None,
            stop_signal: "SIGTERM".into(),
            stop_command: Some("stop".into()),
            stop_timeout: 30,
            config_files: Vec::new(),
        }
    }

    fn lines(sub: &mut Subscription) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(l) = sub.rx.try_recv() {
            out.push(l.trim_start_matches(SYSTEM_PREFIX).to_string());
        }
        out
    }

    #[tokio::test]
    async fn create_builds_server_container() {
        let (_d, rt, engine) = engine();
        engine.create(&config("s1")).await.unwrap();

        assert!(engine.data_path("s1").is_dir());
        assert_eq!(rt.count("pull"), 1);
        rt.with(|s| {
            let c = &s.containers["axis-s1"];
            assert_eq!(c.spec.cmd, vec!["/bin/sh", "-c", "java -Dversion=1.21 -jar server.jar"]);
            assert_eq!(c.spec.memory_bytes, Some(1024 * 1024 * 1024));
            assert_eq!(c.spec.nano_cpus, Some(1_500_000_000));
            assert_eq!(c.spec.env["STARTUP"], "java -Dversion=1.21 -jar server.jar");
            assert_eq!(c.restart_policy, RestartPolicy::UnlessStopped);
            assert!(c.spec.tty && c.spec.open_stdin);
        });
        assert_eq!(engine.cached_config("s1").unwrap().stop_command.as_deref(), Some("stop"));
        assert_eq!(engine.status("s1").await, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn install_runs_in_transient_container() {
        let (_d, rt, engine) = engine();
        let mut cfg = config("s1");
        cfg.install_script = Some("curl -o server.jar https://example.com/{{VERSION}}.jar".into());
        cfg.install_image = Some("ghcr.io/installers/alpine:latest".into());
        rt.with(|s| s.log_lines = vec!["Downloading...".into(), "Done".into()]);

        engine.create(&cfg).await.unwrap();

        let calls = rt.calls();
        let install_create = calls.iter().position(|c| c == "create axis-s1-install").unwrap();
        let install_remove = calls.iter().position(|c| c == "remove axis-s1-install").unwrap();
        let main_create = calls.iter().position(|c| c == "create axis-s1").unwrap();
        assert!(install_create < install_remove && install_remove < main_create);
        assert!(!engine.is_installing("s1"));
    }

    #[tokio::test]
    async fn failed_install_aborts_create() {
        let (_d, rt, engine) = engine();
        let mut cfg = config("s1");
        cfg.install_script = Some("exit 3".into());
        rt.with(|s| s.install_exit_code = 3);

        let err = engine.create(&cfg).await.unwrap_err();
        assert_eq!(err.to_string(), "install script exited with code 3");
        assert!(!rt.with(|s| s.containers.contains_key("axis-s1")));
        // data dir left behind for debugging
        assert!(engine.data_path("s1").is_dir());
        assert_eq!(engine.status("s1").await, ServerStatus::Failed);
        assert_eq!(engine.failure("s1").as_deref(), Some("install script exited with code 3"));

        rt.with(|s| s.install_exit_code = 0);
        engine.create(&cfg).await.unwrap();
        assert!(engine.failure("s1").is_none());
        assert_eq!(engine.status("s1").await, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn failed_reinstall_reports_failed() {
        let (_d, rt, engine) = engine();
        let mut cfg = config("s1");
        engine.create(&cfg).await.unwrap();

        cfg.install_script = Some("exit 3".into());
        rt.with(|s| s.install_exit_code = 3);
        assert!(engine.reinstall(&cfg).await.is_err());
        assert_eq!(engine.status("s1").await, ServerStatus::Failed);

        engine.delete("s1").await.unwrap();
        assert_eq!(engine.status("s1").await, ServerStatus::Offline);
    }

    #[test]
    fn alpine_install_scripts_are_wrapped() {
        let mut vars = BTreeMap::new();
        vars.insert("VERSION".to_string(), "1.21".to_string());
        let (shell, body) = prepare_install_script("get {{VERSION}}", "ghcr.io/x/alpine:3", &vars);
        assert_eq!(shell, "/bin/sh");
        assert_eq!(body, "apk add --no-cache curl jq bash && cd /home/container && get 1.21 && chmod -R 777 /home/container");
        let (shell, body) = prepare_install_script("get {{VERSION}}", "debian:bookworm", &vars);
        assert_eq!((shell, body.as_str()), ("/bin/bash", "get 1.21"));
    }

    #[tokio::test]
    async fn concurrent_starts_issue_one_runtime_start() {
        let (_d, rt, engine) = engine();
        engine.create(&config("s1")).await.unwrap();
        let (a, b) = tokio::join!(engine.start("s1"), engine.start("s1"));
        a.unwrap();
        b.unwrap();
        assert_eq!(rt.count("start"), 1);
        assert_eq!(engine.status("s1").await, ServerStatus::Running);
    }

    #[tokio::test]
    async fn start_without_container_is_not_found() {
        let (_d, _rt, engine) = engine();
        assert!(matches!(engine.start("s1").await, Err(AxisError::NotFound(_))));
        assert!(matches!(engine.start("bad/id").await, Err(AxisError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn start_with_config_recreates_or_installs() {
        let (_d, rt, engine) = engine();
        let mut cfg = config("s1");
        cfg.install_script = Some("echo hi".into());
        engine.start_with_config(&cfg).await.unwrap();
        assert!(rt.calls().contains(&"create axis-s1-install".to_string()));
        assert!(rt.is_running("axis-s1"));

        engine.stop("s1", &StopOptions { stop_command: Some(String::new()), stop_timeout: Some(0), ..Default::default() }).await.unwrap();
        std::fs::write(engine.data_path("s1").join("server.jar"), b"jar").unwrap();
        let installs_before = rt.count("create");
        engine.start_with_config(&cfg).await.unwrap();
        // data dir not empty: only the server container is rebuilt
        assert_eq!(rt.count("create"), installs_before + 1);
        assert!(rt.is_running("axis-s1"));
    }

    #[tokio::test]
    async fn graceful_stop_via_stop_command() {
        let (_d, rt, engine) = engine();
        engine.create(&config("s1")).await.unwrap();
        engine.start("s1").await.unwrap();
        rt.with(|s| s.exits_on = Some("stop".into()));
        let mut sub = engine.bus().subscribe("s1");

        engine.stop("s1", &StopOptions::default()).await.unwrap();

        assert!(!rt.is_running("axis-s1"));
        assert_eq!(rt.count("stop"), 0);
        assert_eq!(rt.with(|s| s.stdin["axis-s1"].clone()), b"stop\n");
        assert_eq!(rt.with(|s| s.containers["axis-s1"].restart_policy), RestartPolicy::No);
        assert!(lines(&mut sub).contains(&"Server stopped gracefully".to_string()));
    }

    #[tokio::test]
    async fn stop_falls_back_to_signal() {
        let (_d, rt, engine) = engine();
        engine.create(&config("s1")).await.unwrap();
        engine.start("s1").await.unwrap();
        let mut sub = engine.bus().subscribe("s1");

        engine.stop("s1", &StopOptions { stop_timeout: Some(0), ..Default::default() }).await.unwrap();

        assert_eq!(rt.count("stop"), 1);
        assert!(!rt.is_running("axis-s1"));
        let msgs = lines(&mut sub);
        assert!(msgs.iter().any(|m| m.starts_with("Server did not stop within 0s")));
        assert!(msgs.contains(&"Server stopped".to_string()));
    }

    #[tokio::test]
    async fn restart_uses_runtime_restart_when_stop_fails() {
        let (_d, rt, engine) = engine();
        let mut cfg = config("s1");
        cfg.stop_command = None;
        engine.create(&cfg).await.unwrap();
        engine.start("s1").await.unwrap();
        rt.with(|s| s.stop_fails = true);

        engine.restart("s1", &StopOptions::default()).await.unwrap();
        assert_eq!(rt.count("restart"), 1);
        assert!(rt.is_running("axis-s1"));
    }

    #[tokio::test]
    async fn kill_and_command_guard() {
        let (_d, rt, engine) = engine();
        engine.create(&config("s1")).await.unwrap();
        assert!(matches!(engine.send_command("s1", "say hi").await, Err(AxisError::Conflict(_))));

        engine.start("s1").await.unwrap();
        engine.send_command("s1", "say hi").await.unwrap();
        assert_eq!(rt.with(|s| s.stdin["axis-s1"].clone()), b"say hi\n");

        engine.kill("s1").await.unwrap();
        assert!(!rt.is_running("axis-s1"));
        assert_eq!(rt.with(|s| s.containers["axis-s1"].state.exit_code), 137);
    }

    #[tokio::test]
    async fn reinstall_replaces_container() {
        let (_d, rt, engine) = engine();
        let mut cfg = config("s1");
        engine.create(&cfg).await.unwrap();
        engine.start("s1").await.unwrap();

        cfg.install_script = Some("echo reinstall".into());
        engine.reinstall(&cfg).await.unwrap();
        assert_eq!(rt.count("remove"), 2); // old server container + install container
        assert!(rt.with(|s| s.containers.contains_key("axis-s1")));
        assert!(!rt.is_running("axis-s1"));
    }

    #[tokio::test]
    async fn delete_removes_container_and_data() {
        let (_d, rt, engine) = engine();
        engine.create(&config("s1")).await.unwrap();
        engine.start("s1").await.unwrap();
        std::fs::write(engine.data_path("s1").join("world.dat"), b"x").unwrap();

        engine.delete("s1").await.unwrap();
        assert!(rt.with(|s| s.containers.is_empty()));
        assert!(engine.cached_config("s1").is_none());
        for _ in 0..100 {
            if !engine.data_path("s1").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!engine.data_path("s1").exists());
        assert_eq!(engine.status("s1").await, ServerStatus::Offline);
    }

    #[tokio::test]
    async fn config_survives_engine_restart() {
        let (dir, rt, engine) = engine();
        engine.create(&config("s1")).await.unwrap();
        drop(engine);
        let fresh = Engine::new(Arc::new(rt), Arc::new(LogBus::new()), dir.path().to_path_buf());
        assert_eq!(fresh.cached_config("s1").unwrap().stop_timeout, 30);
    }
}
