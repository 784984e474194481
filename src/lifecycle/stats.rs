// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Cached resource usage. Readers get a sample at most 2 s old; a
//! background refresher keeps every watched server warm.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::Engine;
use crate::containers::container_name;
use crate::protocol::ServerStats;

pub const STATS_TTL: Duration = Duration::from_secs(2);
pub const STATS_REFRESH: Duration = Duration::from_secs(1);
/// Walking a large data dir is expensive; refresh it less often
const DISK_TTL: Duration = Duration::from_secs(10);

pub(super) struct CachedStats {
    stats: Option<ServerStats>,
    updated_at: Instant,
}

pub(super) struct CachedDisk {
    bytes: u64,
    updated_at: Instant,
}

impl Engine {
    /// `None` when the container is absent or not running
    pub async fn stats(&self, id: &str) -> Option<ServerStats> {
        {
            let cache = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(c) = cache.get(id) {
                if c.updated_at.elapsed() < STATS_TTL {
                    return c.stats.clone();
                }
            }
        }
        self.refresh_stats(id).await
    }

    async fn refresh_stats(&self, id: &str) -> Option<ServerStats> {
        let stats = match self.runtime.stats(&container_name(id)).await {
            Ok(raw) => Some(ServerStats {
                memory_usage: raw.memory_usage,
                memory_limit: raw.memory_limit,
                cpu_percent: raw.cpu_percent(),
                disk_usage: self.disk_usage(id).await,
                net_rx: raw.net_rx,
                net_tx: raw.net_tx,
            }),
            Err(e) => {
                debug!("stats for {} unavailable: {}", id, e);
                None
            }
        };
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id.to_string(),
            CachedStats { stats: stats.clone(), updated_at: Instant::now() },
        );
        stats
    }

    pub async fn disk_usage(&self, id: &str) -> u64 {
        {
            let cache = self.disk.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(c) = cache.get(id) {
                if c.updated_at.elapsed() < DISK_TTL {
                    return c.bytes;
                }
            }
        }
        let files = self.files(id);
        let bytes = tokio::task::spawn_blocking(move || files.disk_usage()).await.unwrap_or(0);
        self.disk.lock().unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), CachedDisk { bytes, updated_at: Instant::now() });
        bytes
    }

    pub(super) fn invalidate_stats(&self, id: &str) {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
    }

    pub(super) fn forget_stats(&self, id: &str) {
        self.invalidate_stats(id);
        self.disk.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
    }

    /// Refresh every server that has been asked about at least once
    pub fn spawn_stats_refresher(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(STATS_REFRESH);
            loop {
                tick.tick().await;
                let ids: Vec<String> = engine.stats.lock()
                    .map(|c| c.keys().cloned().collect())
                    .unwrap_or_default();
                futures::future::join_all(ids.iter().map(|id| engine.refresh_stats(id))).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::containers::RawStats;
    use crate::lifecycle::tests::{config, engine};

    #[tokio::test]
    async fn stats_are_cached_between_reads() {
        let (_d, rt, engine) = engine();
        engine.create(&config("s1")).await.unwrap();
        engine.start("s1").await.unwrap();
        rt.with(|s| s.stats = RawStats { memory_usage: 512, memory_limit: 1024, ..Default::default() });
        std::fs::write(engine.data_path("s1").join("world.dat"), vec![0u8; 2048]).unwrap();

        let first = engine.stats("s1").await.unwrap();
        let second = engine.stats("s1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.memory_usage, 512);
        assert_eq!(first.disk_usage, 2048);
        assert_eq!(rt.count("stats"), 1);
    }

    #[tokio::test]
    async fn stopped_server_has_no_stats() {
        let (_d, _rt, engine) = engine();
        engine.create(&config("s1")).await.unwrap();
        assert!(engine.stats("s1").await.is_none());
    }
}
