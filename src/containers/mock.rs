// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! In-memory `ContainerRuntime` for engine tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;

use super::{
    ContainerRuntime, ContainerSpec, ContainerState, ExecOutcome, LogOptions, LogStream,
    RawStats, RestartPolicy, StdinWriter,
};
use crate::error::{AxisError, Result};

pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub state: ContainerState,
    pub restart_policy: RestartPolicy,
}

#[derive(Default)]
pub struct FakeState {
    pub images: HashSet<String>,
    pub containers: HashMap<String, FakeContainer>,
    /// `"<op> <name>"` in call order
    pub calls: Vec<String>,
    pub stdin: HashMap<String, Vec<u8>>,
    pub install_exit_code: i64,
    /// A stdin line that makes the receiving container exit
    pub exits_on: Option<String>,
    /// When set, `stop` fails without stopping
    pub stop_fails: bool,
    pub log_lines: Vec<String>,
    pub exec_output: Vec<u8>,
    pub stats: RawStats,
}

#[derive(Clone, Default)]
pub struct FakeRuntime {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut s = self.state.lock().unwrap();
        f(&mut s)
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    pub fn count(&self, op: &str) -> usize {
        self.with(|s| s.calls.iter().filter(|c| c.split(' ').next() == Some(op)).count())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.with(|s| s.containers.get(name).map(|c| c.state.running).unwrap_or(false))
    }

    fn record(&self, op: &str, name: &str) {
        self.with(|s| s.calls.push(format!("{} {}", op, name)));
    }
}

fn missing(name: &str) -> AxisError {
    AxisError::driver(format!("No such container: {}", name))
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_present(&self, image: &str) -> Result<bool> {
        Ok(self.with(|s| s.images.contains(image)))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.record("pull", image);
        self.with(|s| s.images.insert(image.to_string()));
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.record("create", &spec.name);
        self.with(|s| {
            if s.containers.contains_key(&spec.name) {
                return Err(AxisError::driver(format!("Conflict. The container name {} is already in use", spec.name)));
            }
            s.containers.insert(spec.name.clone(), FakeContainer {
                spec: spec.clone(),
                state: ContainerState { status: "created".into(), ..Default::default() },
                restart_policy: spec.restart_policy,
            });
            Ok(format!("id-{}", spec.name))
        })
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.record("start", name);
        self.with(|s| {
            let c = s.containers.get_mut(name).ok_or_else(|| missing(name))?;
            c.state.running = true;
            c.state.status = "running".into();
            Ok(())
        })
    }

    async fn stop(&self, name: &str, _timeout_secs: u64) -> Result<()> {
        self.record("stop", name);
        self.with(|s| {
            if s.stop_fails {
                return Err(AxisError::driver("stop failed"));
            }
            let c = s.containers.get_mut(name).ok_or_else(|| missing(name))?;
            c.state.running = false;
            c.state.status = "exited".into();
            Ok(())
        })
    }

    async fn kill(&self, name: &str) -> Result<()> {
        self.record("kill", name);
        self.with(|s| {
            let c = s.containers.get_mut(name).ok_or_else(|| missing(name))?;
            c.state.running = false;
            c.state.exit_code = 137;
            c.state.status = "exited".into();
            Ok(())
        })
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        self.record("remove", name);
        self.with(|s| {
            match s.containers.get(name).map(|c| c.state.running) {
                None => Err(missing(name)),
                Some(true) if !force => Err(AxisError::driver("container is running")),
                Some(_) => {
                    s.containers.remove(name);
                    Ok(())
                }
            }
        })
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>> {
        Ok(self.with(|s| s.containers.get(name).map(|c| c.state.clone())))
    }

    async fn stats(&self, name: &str) -> Result<RawStats> {
        self.record("stats", name);
        self.with(|s| match s.containers.get(name) {
            Some(c) if c.state.running => Ok(s.stats.clone()),
            Some(_) => Err(AxisError::driver("container is not running")),
            None => Err(missing(name)),
        })
    }

    async fn logs(&self, name: &str, opts: LogOptions) -> Result<LogStream> {
        self.record("logs", name);
        let lines = self.with(|s| s.log_lines.clone());
        let start = opts.tail.map(|t| lines.len().saturating_sub(t)).unwrap_or(0);
        let mut text = lines[start..].join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        Ok(Box::new(std::io::Cursor::new(text.into_bytes())))
    }

    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        _stdin: Option<Vec<u8>>,
        stdout: Option<std::fs::File>,
    ) -> Result<ExecOutcome> {
        self.with(|s| s.calls.push(format!("exec {} {}", name, argv.join(" "))));
        let data = self.with(|s| s.exec_output.clone());
        match stdout {
            Some(mut f) => {
                f.write_all(&data)?;
                Ok(ExecOutcome { exit_code: 0, output: String::new() })
            }
            None => Ok(ExecOutcome { exit_code: 0, output: String::from_utf8_lossy(&data).to_string() }),
        }
    }

    async fn attach_stdin(&self, name: &str) -> Result<StdinWriter> {
        self.record("attach", name);
        Ok(Box::new(FakeStdin { name: name.to_string(), state: self.state.clone() }))
    }

    async fn wait_not_running(&self, name: &str) -> Result<i64> {
        // Install containers finish as soon as they are waited on
        if name.ends_with("-install") {
            return self.with(|s| {
                let code = s.install_exit_code;
                let c = s.containers.get_mut(name).ok_or_else(|| missing(name))?;
                c.state.running = false;
                c.state.exit_code = code;
                Ok(code)
            });
        }
        loop {
            let state = self.with(|s| s.containers.get(name).map(|c| c.state.clone()));
            match state {
                None => return Err(missing(name)),
                Some(st) if !st.running => return Ok(st.exit_code),
                Some(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    }

    async fn set_restart_policy(&self, name: &str, policy: RestartPolicy) -> Result<()> {
        self.with(|s| {
            s.calls.push(format!("policy {} {}", name, policy.as_str()));
            let c = s.containers.get_mut(name).ok_or_else(|| missing(name))?;
            c.restart_policy = policy;
            Ok(())
        })
    }

    async fn restart(&self, name: &str, _timeout_secs: u64) -> Result<()> {
        self.record("restart", name);
        self.with(|s| {
            let c = s.containers.get_mut(name).ok_or_else(|| missing(name))?;
            c.state.running = true;
            Ok(())
        })
    }
}

struct FakeStdin {
    name: String,
    state: Arc<Mutex<FakeState>>,
}

impl AsyncWrite for FakeStdin {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let mut s = self.state.lock().unwrap();
        let written = s.stdin.entry(self.name.clone()).or_default();
        written.extend_from_slice(buf);
        let text = String::from_utf8_lossy(written).to_string();
        let exits = s.exits_on.as_ref().map(|cmd| text.lines().any(|l| l == cmd)).unwrap_or(false);
        if exits {
            if let Some(c) = s.containers.get_mut(&self.name) {
                c.state.running = false;
                c.state.status = "exited".into();
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
