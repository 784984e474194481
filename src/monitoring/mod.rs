// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Host information for /api/system and the heartbeat push

use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{Disks, System};

/// Snapshot of the node host
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub kernel: String,
    pub arch: String,
    pub cpu_count: usize,
    pub cpu_model: String,
    pub cpu_usage_percent: f32,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    /// Filesystem holding the server data dir
    pub disk_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub uptime_secs: u64,
    pub load_avg: [f64; 3],
    pub daemon_version: String,
    #[serde(default)]
    pub docker_version: Option<String>,
}

/// Mount with the longest prefix of `path`: `(total, available)`
pub fn disk_for_path<'a>(path: &Path, mounts: impl IntoIterator<Item = (&'a Path, u64, u64)>) -> Option<(u64, u64)> {
    mounts.into_iter()
        .filter(|(mount, total, _)| *total > 0 && path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.components().count())
        .map(|(_, total, avail)| (total, avail))
}

/// Keeps sysinfo state between polls so CPU usage has a baseline
pub struct SystemMonitor {
    sys: System,
    disks: Disks,
}

impl SystemMonitor {
    pub fn new() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        Self { sys, disks: Disks::new_with_refreshed_list() }
    }

    pub fn collect(&mut self, data_dir: &Path) -> SystemInfo {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        self.disks.refresh();

        let cpus = self.sys.cpus();
        let cpu_usage = cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len().max(1) as f32;
        let cpu_model = cpus.first()
            .map(|c| c.brand().trim().to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let data_dir = std::fs::canonicalize(data_dir).unwrap_or_else(|_| data_dir.to_path_buf());
        let (disk_total, disk_avail) = disk_for_path(
            &data_dir,
            self.disks.iter().map(|d| (d.mount_point(), d.total_space(), d.available_space())),
        ).unwrap_or((0, 0));

        let load = System::load_average();
        SystemInfo {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            os: System::long_os_version().unwrap_or_else(|| "Linux".to_string()),
            kernel: System::kernel_version().unwrap_or_default(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_count: cpus.len(),
            cpu_model,
            cpu_usage_percent: cpu_usage,
            memory_total_bytes: self.sys.total_memory(),
            memory_used_bytes: self.sys.used_memory(),
            disk_total_bytes: disk_total,
            disk_used_bytes: disk_total.saturating_sub(disk_avail),
            uptime_secs: System::uptime(),
            load_avg: [load.one, load.five, load.fifteen],
            daemon_version: env!("CARGO_PKG_VERSION").to_string(),
            docker_version: None,
        }
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_deepest_mount() {
        let mounts = [
            (Path::new("/"), 100, 40),
            (Path::new("/var"), 50, 10),
            (Path::new("/var/lib/axis"), 0, 0),
            (Path::new("/home"), 70, 70),
        ];
        assert_eq!(disk_for_path(Path::new("/var/lib/axis/volumes"), mounts), Some((50, 10)));
        assert_eq!(disk_for_path(Path::new("/srv"), mounts), Some((100, 40)));
        assert_eq!(disk_for_path(Path::new("/srv"), []), None);
    }

    #[test]
    fn collects_host_snapshot() {
        let mut monitor = SystemMonitor::new();
        let info = monitor.collect(Path::new("/"));
        assert!(info.cpu_count > 0);
        assert!(info.memory_total_bytes > 0);
        assert_eq!(info.daemon_version, env!("CARGO_PKG_VERSION"));
    }
}
