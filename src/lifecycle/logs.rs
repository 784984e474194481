// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Console output: one follower per server feeding the log bus, plus
//! history and search over the runtime's log store.

use regex::RegexBuilder;
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::debug;

use super::Engine;
use crate::containers::{container_name, strip_stream_header, LogOptions, LogStream};
use crate::error::{AxisError, Result};
use crate::logbus::{strip_ansi, LogBus, LogSource};

/// Lines replayed when a follower attaches to a server that just came up
pub const FOLLOW_TAIL: usize = 50;
pub const SEARCH_DEFAULT_LIMIT: usize = 100;
pub const SEARCH_MAX_LIMIT: usize = 5000;

pub(super) struct Follower {
    generation: u64,
    cancel: oneshot::Sender<()>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogSearch {
    #[serde(default, alias = "q")]
    pub pattern: String,
    #[serde(default)]
    pub regex: bool,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Unix seconds or relative (`30s`, `10m`, `2h`, `1d`)
    #[serde(default)]
    pub since: Option<String>,
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    match reader.read_until(b'\n', &mut buf).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(buf),
    }
}

fn decode(raw: &[u8]) -> String {
    String::from_utf8_lossy(strip_stream_header(raw))
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

/// Copy a stream into the bus until it ends
pub(super) async fn pump_lines(stream: LogStream, bus: Arc<LogBus>, server_id: String) {
    let mut reader = BufReader::new(stream);
    while let Some(raw) = read_line(&mut reader).await {
        bus.publish(&server_id, &decode(&raw), LogSource::Container);
    }
}

impl Engine {
    /// Start following the container's output unless a follower already runs.
    /// Returns whether a new follower was spawned.
    pub fn ensure_follower(self: &Arc<Self>, id: &str, tail: usize) -> bool {
        let (tx, rx) = oneshot::channel();
        let generation = self.follower_generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut followers = self.followers.lock().unwrap_or_else(|e| e.into_inner());
            if followers.contains_key(id) {
                return false;
            }
            followers.insert(id.to_string(), Follower { generation, cancel: tx });
        }

        let engine = self.clone();
        let server = id.to_string();
        tokio::spawn(async move {
            engine.follow(&server, tail, rx).await;
            engine.clear_follower(&server, generation);
            debug!("Log follower for {} ended", server);
        });
        true
    }

    async fn follow(&self, id: &str, tail: usize, mut cancel: oneshot::Receiver<()>) {
        let opts = LogOptions { tail: Some(tail), follow: true, since: None };
        let stream = match self.runtime.logs(&container_name(id), opts).await {
            Ok(s) => s,
            Err(e) => {
                debug!("Cannot follow logs for {}: {}", id, e);
                return;
            }
        };
        let mut reader = BufReader::new(stream);
        loop {
            tokio::select! {
                _ = &mut cancel => break,
                line = read_line(&mut reader) => match line {
                    Some(raw) => { self.bus.publish(id, &decode(&raw), LogSource::Container); }
                    None => break,
                },
            }
        }
    }

    /// A follower only removes its own entry, never a newer one
    fn clear_follower(&self, id: &str, generation: u64) {
        let mut followers = self.followers.lock().unwrap_or_else(|e| e.into_inner());
        if followers.get(id).map(|f| f.generation) == Some(generation) {
            followers.remove(id);
        }
    }

    pub fn stop_follower(&self, id: &str) {
        let removed = self.followers.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
        if let Some(f) = removed {
            let _ = f.cancel.send(());
        }
    }

    pub fn has_follower(&self, id: &str) -> bool {
        self.followers.lock().map(|f| f.contains_key(id)).unwrap_or(false)
    }

    /// Last `lines` lines of output, ANSI stripped
    pub async fn recent_logs(&self, id: &str, lines: usize) -> Result<Vec<String>> {
        crate::containers::validate_server_id(id)?;
        let opts = LogOptions { tail: Some(lines), follow: false, since: None };
        self.read_all(id, opts).await
    }

    /// Everything the runtime still holds for this server
    pub async fn full_logs(&self, id: &str) -> Result<Vec<String>> {
        crate::containers::validate_server_id(id)?;
        self.read_all(id, LogOptions { tail: None, follow: false, since: None }).await
    }

    pub async fn search_logs(&self, id: &str, query: &LogSearch) -> Result<Vec<String>> {
        crate::containers::validate_server_id(id)?;
        if query.pattern.is_empty() {
            return Err(AxisError::invalid("Search pattern is required"));
        }
        let limit = query.limit.unwrap_or(SEARCH_DEFAULT_LIMIT).clamp(1, SEARCH_MAX_LIMIT);
        let since = match query.since.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => Some(parse_since(s, chrono::Utc::now().timestamp())
                .ok_or_else(|| AxisError::invalid("Invalid since value"))?),
            None => None,
        };

        let matcher: Box<dyn Fn(&str) -> bool + Send> = if query.regex {
            let re = RegexBuilder::new(&query.pattern)
                .case_insensitive(true)
                .size_limit(1 << 20)
                .build()
                .map_err(|e| AxisError::invalid(format!("Invalid regex: {}", e)))?;
            Box::new(move |l| re.is_match(l))
        } else {
            let needle = query.pattern.to_lowercase();
            Box::new(move |l| l.to_lowercase().contains(&needle))
        };

        let lines = self.read_all(id, LogOptions { tail: None, follow: false, since }).await?;
        let mut hits: Vec<String> = lines.into_iter().filter(|l| matcher(l)).collect();
        if hits.len() > limit {
            hits.drain(..hits.len() - limit);
        }
        Ok(hits)
    }

    async fn read_all(&self, id: &str, opts: LogOptions) -> Result<Vec<String>> {
        let mut stream = self.runtime.logs(&container_name(id), opts).await?;
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        Ok(raw
            .split(|b| *b == b'\n')
            .map(|l| strip_ansi(&decode(l)))
            .filter(|l| !l.trim().is_empty())
            .collect())
    }
}

/// Unix seconds, or a duration before `now` such as `30s`, `10m`, `2h`, `1d`
pub fn parse_since(value: &str, now: i64) -> Option<i64> {
    let value = value.trim();
    if let Ok(ts) = value.parse::<i64>() {
        return (ts >= 0).then_some(ts);
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp());
    }
    let (idx, _) = value.char_indices().last()?;
    let (num, unit) = value.split_at(idx);
    let n: i64 = num.parse().ok().filter(|n| *n >= 0)?;
    let scale = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return None,
    };
    now.checked_sub(n.checked_mul(scale)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tests::{config, engine};

    #[test]
    fn since_forms() {
        let now = 1_700_000_000;
        assert_eq!(parse_since("1690000000", now), Some(1_690_000_000));
        assert_eq!(parse_since("30s", now), Some(now - 30));
        assert_eq!(parse_since("10m", now), Some(now - 600));
        assert_eq!(parse_since("2h", now), Some(now - 7200));
        assert_eq!(parse_since("1d", now), Some(now - 86_400));
        assert_eq!(parse_since("2023-11-14T22:13:20Z", now), Some(1_700_000_000));
        assert_eq!(parse_since("soon", now), None);
        assert_eq!(parse_since("5w", now), None);
        assert_eq!(parse_since("", now), None);
    }

    #[test]
    fn since_out_of_range_is_rejected() {
        let now = 1_700_000_000;
        assert_eq!(parse_since("999999999999999999d", now), None);
        assert_eq!(parse_since(&format!("{}m", i64::MAX), now), None);
        assert_eq!(parse_since(&format!("{}s", i64::MAX), -2), None);
    }

    #[tokio::test]
    async fn one_follower_per_server() {
        let (_d, rt, engine) = engine();
        engine.create(&config("s1")).await.unwrap();
        assert!(engine.ensure_follower("s1", FOLLOW_TAIL));
        assert!(!engine.ensure_follower("s1", FOLLOW_TAIL));
        assert!(engine.has_follower("s1"));
        engine.stop_follower("s1");
        assert!(!engine.has_follower("s1"));
        // Only the first call ever reached the runtime
        tokio::task::yield_now().await;
        assert!(rt.count("logs") <= 1);
    }

    #[tokio::test]
    async fn follower_publishes_and_clears_itself() {
        let (_d, rt, engine) = engine();
        engine.create(&config("s1")).await.unwrap();
        rt.with(|s| s.log_lines = vec!["\x1b[32m[Server] Done\x1b[0m".into(), "".into()]);
        let mut sub = engine.bus().subscribe("s1");

        engine.ensure_follower("s1", FOLLOW_TAIL);
        let line = tokio::time::timeout(std::time::Duration::from_secs(1), sub.rx.recv()).await.unwrap();
        assert_eq!(line.as_deref(), Some("[Server] Done"));
        for _ in 0..100 {
            if !engine.has_follower("s1") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!engine.has_follower("s1"));
    }

    #[tokio::test]
    async fn history_and_search() {
        let (_d, rt, engine) = engine();
        engine.create(&config("s1")).await.unwrap();
        rt.with(|s| {
            s.log_lines = vec![
                "[INFO] Starting".into(),
                "[WARN] Can't keep up!".into(),
                "[INFO] Player joined".into(),
                "[WARN] Can't keep up again".into(),
            ]
        });

        let recent = engine.recent_logs("s1", 2).await.unwrap();
        assert_eq!(recent, vec!["[INFO] Player joined", "[WARN] Can't keep up again"]);

        let q = LogSearch { pattern: "can't KEEP".into(), ..Default::default() };
        assert_eq!(engine.search_logs("s1", &q).await.unwrap().len(), 2);

        let q = LogSearch { pattern: r"^\[WARN\]".into(), regex: true, limit: Some(1), since: None };
        assert_eq!(engine.search_logs("s1", &q).await.unwrap(), vec!["[WARN] Can't keep up again"]);

        let q = LogSearch { pattern: "(".into(), regex: true, ..Default::default() };
        assert!(matches!(engine.search_logs("s1", &q).await, Err(AxisError::InvalidInput(_))));
    }
}
