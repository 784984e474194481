// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Docker implementation of `ContainerRuntime`
//!
//! Most calls go through the docker CLI. Raw stats and the followed log
//! stream come from the engine API via `curl --unix-socket`; stdin attach is
//! a hijacked HTTP connection on the same socket.

use async_trait::async_trait;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::UnixStream;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::{
    ContainerRuntime, ContainerSpec, ContainerState, CpuSample, ExecOutcome, LogOptions,
    LogStream, RawStats, RestartPolicy, StdinWriter,
};
use crate::error::{AxisError, Result};

const INSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const CREATE_TIMEOUT: Duration = Duration::from_secs(600);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DockerRuntime {
    bin: String,
    socket: String,
}

impl DockerRuntime {
    pub fn new(bin: &str, socket: &str) -> Self {
        Self { bin: bin.to_string(), socket: socket.to_string() }
    }

    /// Engine version string, for system info
    pub async fn version(&self) -> Option<String> {
        self.run(&["version", "--format", "{{.Server.Version}}"], INSPECT_TIMEOUT)
            .await
            .ok()
            .filter(|v| !v.is_empty())
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<String> {
        let fut = Command::new(&self.bin).args(args).kill_on_drop(true).output();
        let output = tokio::time::timeout(timeout, fut)
            .await?
            .map_err(|e| AxisError::driver(format!("Failed to run docker: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(AxisError::driver(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }

    async fn run_owned(&self, args: &[String], timeout: Duration) -> Result<String> {
        let refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.run(&refs, timeout).await
    }

    /// GET a JSON document from the engine API over the unix socket
    async fn engine_get(&self, path: &str) -> Result<serde_json::Value> {
        let url = format!("http://localhost{}", path);
        let fut = Command::new("curl")
            .args(["-s", "-f", "--unix-socket", &self.socket, &url])
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(INSPECT_TIMEOUT, fut)
            .await?
            .map_err(|e| AxisError::driver(format!("Failed to run curl: {}", e)))?;
        if !output.status.success() {
            return Err(AxisError::driver(format!("Engine API {} failed", path)));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_present(&self, image: &str) -> Result<bool> {
        Ok(self.run(&["image", "inspect", "--format", "{{.Id}}", image], INSPECT_TIMEOUT).await.is_ok())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling Docker image: {}", image);
        self.run(&["pull", image], CREATE_TIMEOUT)
            .await
            .map_err(|e| AxisError::driver(format!("Pull failed: {}", e)))?;
        info!("Docker image {} pulled", image);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        info!("Creating Docker container {} from image {}", spec.name, spec.image);
        let id = self.run_owned(&create_args(spec), CREATE_TIMEOUT)
            .await
            .map_err(|e| AxisError::driver(format!("Create failed: {}", e)))?;
        info!("Docker container {} created ({})", spec.name, &id[..12.min(id.len())]);
        Ok(id)
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.run(&["start", name], CONTROL_TIMEOUT).await.map(|_| ())
    }

    async fn stop(&self, name: &str, timeout_secs: u64) -> Result<()> {
        let t = timeout_secs.to_string();
        self.run(&["stop", "-t", &t, name], Duration::from_secs(10 + timeout_secs)).await.map(|_| ())
    }

    async fn kill(&self, name: &str) -> Result<()> {
        self.run(&["kill", name], CONTROL_TIMEOUT).await.map(|_| ())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let args: &[&str] = if force { &["rm", "-f", name] } else { &["rm", name] };
        self.run(args, CONTROL_TIMEOUT).await.map(|_| ())
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>> {
        match self.run(&["inspect", "--type", "container", "--format", "{{json .State}}", name], INSPECT_TIMEOUT).await {
            Ok(out) => Ok(Some(serde_json::from_str(&out)?)),
            Err(AxisError::Driver(msg)) if msg.contains("No such") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn stats(&self, name: &str) -> Result<RawStats> {
        let v = self.engine_get(&format!("/containers/{}/stats?stream=false", name)).await?;
        Ok(parse_raw_stats(&v))
    }

    async fn logs(&self, name: &str, opts: LogOptions) -> Result<LogStream> {
        let url = logs_url(name, &opts);
        let mut child = Command::new("curl")
            .args(["-s", "-N", "--unix-socket", &self.socket, &url])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AxisError::driver(format!("Failed to follow logs: {}", e)))?;
        let stdout = child.stdout.take()
            .ok_or_else(|| AxisError::driver("Log stream has no stdout"))?;
        Ok(Box::new(ChildReader { _child: child, stdout }))
    }

    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        stdin: Option<Vec<u8>>,
        stdout: Option<std::fs::File>,
    ) -> Result<ExecOutcome> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("exec");
        if stdin.is_some() {
            cmd.arg("-i");
        }
        cmd.arg(name).args(argv).kill_on_drop(true);
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        cmd.stderr(Stdio::piped());
        let capture = stdout.is_none();
        match stdout {
            Some(file) => cmd.stdout(Stdio::from(file)),
            None => cmd.stdout(Stdio::piped()),
        };

        let mut child = cmd.spawn()
            .map_err(|e| AxisError::driver(format!("Failed to exec in {}: {}", name, e)))?;
        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&data).await?;
            pipe.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        let exit_code = output.status.code().unwrap_or(-1) as i64;
        if exit_code != 0 {
            debug!("exec in {} exited {}: {}", name, exit_code, String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(ExecOutcome {
            exit_code,
            output: if capture { String::from_utf8_lossy(&output.stdout).to_string() } else { String::new() },
        })
    }

    async fn attach_stdin(&self, name: &str) -> Result<StdinWriter> {
        let mut stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|e| AxisError::driver(format!("Cannot reach docker socket: {}", e)))?;
        let request = format!(
            "POST /containers/{}/attach?stream=1&stdin=1&stdout=0&stderr=0 HTTP/1.1\r\n\
             Host: docker\r\nConnection: Upgrade\r\nUpgrade: tcp\r\nContent-Length: 0\r\n\r\n",
            name
        );
        stream.write_all(request.as_bytes()).await?;

        // Consume the response head; the rest of the connection is raw stdin
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if stream.read(&mut byte).await? == 0 || head.len() > 8192 {
                return Err(AxisError::driver("Attach handshake failed"));
            }
            head.push(byte[0]);
        }
        let status_line = String::from_utf8_lossy(&head);
        if !(status_line.starts_with("HTTP/1.1 101") || status_line.starts_with("HTTP/1.1 200")) {
            let first = status_line.lines().next().unwrap_or("").to_string();
            warn!("Attach to {} refused: {}", name, first);
            return Err(AxisError::driver(format!("Attach refused: {}", first)));
        }
        Ok(Box::new(stream))
    }

    async fn wait_not_running(&self, name: &str) -> Result<i64> {
        let out = self.run(&["wait", name], Duration::from_secs(24 * 3600)).await?;
        out.lines()
            .last()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| AxisError::driver(format!("Unexpected wait output: {}", out)))
    }

    async fn set_restart_policy(&self, name: &str, policy: RestartPolicy) -> Result<()> {
        let flag = format!("--restart={}", policy.as_str());
        self.run(&["update", &flag, name], CONTROL_TIMEOUT).await.map(|_| ())
    }

    async fn restart(&self, name: &str, timeout_secs: u64) -> Result<()> {
        let t = timeout_secs.to_string();
        self.run(&["restart", "-t", &t, name], Duration::from_secs(10 + timeout_secs)).await.map(|_| ())
    }
}

/// Keeps the curl child alive (and killed on drop) while its stdout is read
struct ChildReader {
    _child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for ChildReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

fn logs_url(name: &str, opts: &LogOptions) -> String {
    let tail = opts.tail.map(|t| t.to_string()).unwrap_or_else(|| "all".to_string());
    let mut url = format!(
        "http://localhost/containers/{}/logs?stdout=1&stderr=1&tail={}&follow={}",
        name, tail, if opts.follow { 1 } else { 0 }
    );
    if let Some(since) = opts.since {
        url.push_str(&format!("&since={}", since));
    }
    url
}

pub(crate) fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
    if spec.tty {
        args.push("--tty".into());
    }
    if spec.open_stdin {
        args.push("--interactive".into());
    }
    args.push("--workdir".into());
    args.push(spec.working_dir.clone());
    if let Some(user) = &spec.user {
        args.push("--user".into());
        args.push(user.clone());
    }
    for (k, v) in &spec.env {
        args.push("-e".into());
        args.push(format!("{}={}", k, v));
    }
    for p in &spec.ports {
        for proto in p.protocol.docker_suffixes() {
            args.push("-p".into());
            args.push(format!("{}:{}/{}", p.host_port, p.container_port, proto));
        }
    }
    for (host, container) in &spec.binds {
        args.push("-v".into());
        args.push(format!("{}:{}", host.display(), container));
    }
    if let Some(mem) = spec.memory_bytes.filter(|m| *m > 0) {
        args.push("--memory".into());
        args.push(format!("{}b", mem));
    }
    if let Some(cpus) = spec.nano_cpus.filter(|c| *c > 0) {
        // --cpus takes a decimal; nano cpus / 1e9
        args.push("--cpus".into());
        args.push(format!("{:.2}", cpus as f64 / 1_000_000_000.0));
    }
    if let Some(sig) = spec.stop_signal.as_deref().filter(|s| !s.is_empty()) {
        args.push("--stop-signal".into());
        args.push(sig.to_string());
    }
    args.push(format!("--restart={}", spec.restart_policy.as_str()));
    args.push(spec.image.clone());
    args.extend(spec.cmd.iter().cloned());
    args
}

pub(crate) fn parse_raw_stats(v: &serde_json::Value) -> RawStats {
    fn sample(v: &serde_json::Value) -> CpuSample {
        let online = v["online_cpus"].as_u64()
            .filter(|n| *n > 0)
            .or_else(|| v["cpu_usage"]["percpu_usage"].as_array().map(|a| a.len() as u64))
            .unwrap_or(1);
        CpuSample {
            cpu_total: v["cpu_usage"]["total_usage"].as_u64().unwrap_or(0),
            system_total: v["system_cpu_usage"].as_u64().unwrap_or(0),
            online_cpus: online,
        }
    }

    let (mut rx, mut tx) = (0u64, 0u64);
    if let Some(nets) = v["networks"].as_object() {
        for iface in nets.values() {
            rx += iface["rx_bytes"].as_u64().unwrap_or(0);
            tx += iface["tx_bytes"].as_u64().unwrap_or(0);
        }
    }

    RawStats {
        cpu: sample(&v["cpu_stats"]),
        precpu: sample(&v["precpu_stats"]),
        memory_usage: v["memory_stats"]["usage"].as_u64().unwrap_or(0),
        memory_limit: v["memory_stats"]["limit"].as_u64().unwrap_or(0),
        net_rx: rx,
        net_tx: tx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PortMapping, PortProtocol};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn spec() -> ContainerSpec {
        let mut env = BTreeMap::new();
        env.insert("SERVER_PORT".to_string(), "25565".to_string());
        ContainerSpec {
            name: "axis-s1".into(),
            image: "ghcr.io/games/java:21".into(),
            cmd: vec!["/bin/sh".into(), "-c".into(), "java -jar server.jar".into()],
            working_dir: "/home/container".into(),
            user: Some("1000:1000".into()),
            env,
            ports: vec![PortMapping { host_port: 25570, container_port: 25565, protocol: PortProtocol::Both }],
            binds: vec![(PathBuf::from("/var/lib/axis/volumes/s1"), "/home/container".into())],
            memory_bytes: Some(1024 * 1024 * 1024),
            nano_cpus: Some(1_500_000_000),
            stop_signal: Some("SIGINT".into()),
            tty: true,
            open_stdin: true,
            restart_policy: RestartPolicy::UnlessStopped,
        }
    }

    #[test]
    fn create_args_carry_full_spec() {
        let args = create_args(&spec());
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name axis-s1 --tty --interactive"));
        assert!(joined.contains("-p 25570:25565/tcp -p 25570:25565/udp"));
        assert!(joined.contains("-v /var/lib/axis/volumes/s1:/home/container"));
        assert!(joined.contains("--user 1000:1000"));
        assert!(joined.contains("--cpus 1.50"));
        assert!(joined.contains("--stop-signal SIGINT"));
        assert!(joined.contains("--restart=unless-stopped"));
        // image comes right before the command
        let img = args.iter().position(|a| a == "ghcr.io/games/java:21").unwrap();
        assert_eq!(&args[img + 1..], &["/bin/sh", "-c", "java -jar server.jar"]);
    }

    #[test]
    fn logs_url_options() {
        let url = logs_url("axis-s1", &LogOptions { tail: Some(50), follow: true, since: None });
        assert!(url.ends_with("/containers/axis-s1/logs?stdout=1&stderr=1&tail=50&follow=1"));
        let url = logs_url("axis-s1", &LogOptions { tail: None, follow: false, since: Some(1700000000) });
        assert!(url.ends_with("tail=all&follow=0&since=1700000000"));
    }

    #[test]
    fn raw_stats_from_engine_json() {
        let v = serde_json::json!({
            "cpu_stats": {"cpu_usage": {"total_usage": 2000}, "system_cpu_usage": 20000, "online_cpus": 2},
            "precpu_stats": {"cpu_usage": {"total_usage": 1000}, "system_cpu_usage": 10000},
            "memory_stats": {"usage": 512, "limit": 1024},
            "networks": {"eth0": {"rx_bytes": 10, "tx_bytes": 20}, "eth1": {"rx_bytes": 1, "tx_bytes": 2}}
        });
        let raw = parse_raw_stats(&v);
        assert_eq!(raw.memory_usage, 512);
        assert_eq!(raw.net_rx, 11);
        assert_eq!(raw.net_tx, 22);
        assert!((raw.cpu_percent() - 20.0).abs() < 1e-9);
    }
}
