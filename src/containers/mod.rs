// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Container Driver: one capability set over the local container engine
//!
//! The lifecycle engine only ever talks to `dyn ContainerRuntime`. The docker
//! implementation shells out to the docker CLI and, where the CLI has no
//! equivalent (raw stats, stdin attach, multiplexed log stream), talks HTTP
//! over the engine's unix socket.

pub mod docker;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{AxisError, Result};
use crate::protocol::{PortMapping, ServerStatus};

/// Mount point of the server data dir inside every container
pub const CONTAINER_HOME: &str = "/home/container";

/// Byte stream of container output; dropping it ends the follow
pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;
/// Writer bound to a container's attached stdin
pub type StdinWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    No,
    UnlessStopped,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::No => "no",
            Self::UnlessStopped => "unless-stopped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: String,
    /// `uid:gid`; None runs as the image default
    pub user: Option<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    /// host path -> container path
    pub binds: Vec<(PathBuf, String)>,
    pub memory_bytes: Option<u64>,
    pub nano_cpus: Option<u64>,
    pub stop_signal: Option<String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub restart_policy: RestartPolicy,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ContainerState {
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Running", default)]
    pub running: bool,
    #[serde(rename = "Restarting", default)]
    pub restarting: bool,
    #[serde(rename = "ExitCode", default)]
    pub exit_code: i64,
}

/// One CPU accounting sample
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuSample {
    pub cpu_total: u64,
    pub system_total: u64,
    pub online_cpus: u64,
}

/// Raw runtime counters. Disk usage is not the driver's concern.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStats {
    pub cpu: CpuSample,
    pub precpu: CpuSample,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub net_rx: u64,
    pub net_tx: u64,
}

impl RawStats {
    pub fn cpu_percent(&self) -> f64 {
        cpu_percent(&self.precpu, &self.cpu)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    /// Lines from the end; `None` means everything
    pub tail: Option<usize>,
    pub follow: bool,
    /// Unix seconds
    pub since: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub exit_code: i64,
    /// Captured stdout when no sink file was given
    pub output: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_present(&self, image: &str) -> Result<bool>;
    async fn pull_image(&self, image: &str) -> Result<()>;
    /// Returns the runtime's container id
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start(&self, name: &str) -> Result<()>;
    /// Sends the configured stop signal, then SIGKILL after `timeout_secs`
    async fn stop(&self, name: &str, timeout_secs: u64) -> Result<()>;
    async fn kill(&self, name: &str) -> Result<()>;
    async fn remove(&self, name: &str, force: bool) -> Result<()>;
    /// `Ok(None)` when no such container exists
    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>>;
    async fn stats(&self, name: &str) -> Result<RawStats>;
    async fn logs(&self, name: &str, opts: LogOptions) -> Result<LogStream>;
    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        stdin: Option<Vec<u8>>,
        stdout: Option<std::fs::File>,
    ) -> Result<ExecOutcome>;
    async fn attach_stdin(&self, name: &str) -> Result<StdinWriter>;
    /// Blocks until the container stops and returns its exit code
    async fn wait_not_running(&self, name: &str) -> Result<i64>;
    async fn set_restart_policy(&self, name: &str, policy: RestartPolicy) -> Result<()>;
    /// Runtime-native restart, used when the graceful path fails
    async fn restart(&self, name: &str, timeout_secs: u64) -> Result<()>;
}

/// `Δcpu / Δsys · online_cpus · 100`, zero for spurious samples
pub fn cpu_percent(prev: &CpuSample, cur: &CpuSample) -> f64 {
    let cpu_delta = cur.cpu_total as f64 - prev.cpu_total as f64;
    let sys_delta = cur.system_total as f64 - prev.system_total as f64;
    if cpu_delta <= 0.0 || sys_delta <= 0.0 {
        return 0.0;
    }
    let online = if cur.online_cpus == 0 { 1 } else { cur.online_cpus } as f64;
    let pct = cpu_delta / sys_delta * online * 100.0;
    if pct > 10_000.0 { 0.0 } else { pct }
}

/// Container absent -> offline, running or restarting -> running, else stopped
pub fn infer_status(state: Option<&ContainerState>) -> ServerStatus {
    match state {
        None => ServerStatus::Offline,
        Some(s) if s.running || s.restarting => ServerStatus::Running,
        Some(_) => ServerStatus::Stopped,
    }
}

/// `^[A-Za-z0-9_-]{1,64}$`
pub fn is_valid_server_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

pub fn validate_server_id(id: &str) -> Result<()> {
    if is_valid_server_id(id) {
        Ok(())
    } else {
        Err(AxisError::invalid("Invalid server id"))
    }
}

/// Derived container name for a server
pub fn container_name(server_id: &str) -> String {
    format!("axis-{}", server_id)
}

pub fn install_container_name(server_id: &str) -> String {
    format!("axis-{}-install", server_id)
}

/// Strip the 8-byte multiplexed stream header (`[stream,0,0,0,len;4]`) if present
pub fn strip_stream_header(line: &[u8]) -> &[u8] {
    if line.len() >= 8 && line[0] <= 2 && line[1] == 0 && line[2] == 0 && line[3] == 0 {
        &line[8..]
    } else {
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: u64, sys: u64) -> CpuSample {
        CpuSample { cpu_total: cpu, system_total: sys, online_cpus: 4 }
    }

    #[test]
    fn cpu_percent_from_deltas() {
        let pct = cpu_percent(&sample(1_000, 10_000), &sample(2_000, 20_000));
        assert!((pct - 40.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_percent_spurious_samples_are_zero() {
        assert_eq!(cpu_percent(&sample(0, 0), &sample(1_000, 0)), 0.0);
        assert_eq!(cpu_percent(&sample(2_000, 10), &sample(1_000, 20)), 0.0);
        // 1000 / 1 * 4 * 100 = 400000 %
        assert_eq!(cpu_percent(&sample(0, 0), &sample(1_000, 1)), 0.0);
    }

    #[test]
    fn status_inference() {
        assert_eq!(infer_status(None), ServerStatus::Offline);
        let mut s = ContainerState { running: true, ..Default::default() };
        assert_eq!(infer_status(Some(&s)), ServerStatus::Running);
        s.running = false;
        s.restarting = true;
        assert_eq!(infer_status(Some(&s)), ServerStatus::Running);
        s.restarting = false;
        assert_eq!(infer_status(Some(&s)), ServerStatus::Stopped);
    }

    #[test]
    fn server_id_shape() {
        assert!(is_valid_server_id("abc-DEF_123"));
        assert!(is_valid_server_id(&"a".repeat(64)));
        assert!(!is_valid_server_id(&"a".repeat(65)));
        assert!(!is_valid_server_id(""));
        for bad in ["a/b", "a.b", "a b", "../x"] {
            assert!(!is_valid_server_id(bad), "{bad}");
        }
    }

    #[test]
    fn header_only_stripped_when_present() {
        let mut framed = vec![1u8, 0, 0, 0, 0, 0, 0, 5];
        framed.extend_from_slice(b"hello");
        assert_eq!(strip_stream_header(&framed), b"hello");
        assert_eq!(strip_stream_header(b"[12:00] Done (3.2s)!"), b"[12:00] Done (3.2s)!");
    }

    #[test]
    fn inspect_state_parses_docker_json() {
        let s: ContainerState = serde_json::from_str(
            r#"{"Status":"exited","Running":false,"Paused":false,"Restarting":false,"ExitCode":137}"#,
        ).unwrap();
        assert_eq!(s.exit_code, 137);
        assert_eq!(infer_status(Some(&s)), ServerStatus::Stopped);
    }
}
