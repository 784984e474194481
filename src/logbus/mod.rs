// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Log Bus: per-server pub/sub of console lines
//!
//! Container output and daemon-injected messages share one stream per
//! server. Identical lines within a 1 s window are delivered once; a full
//! subscriber channel drops the line for that subscriber only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

pub const SUBSCRIBER_BUFFER: usize = 100;
pub const DEDUP_WINDOW: Duration = Duration::from_secs(1);
pub const JANITOR_PERIOD: Duration = Duration::from_secs(30);
pub const JANITOR_MAX_AGE: Duration = Duration::from_secs(5);

/// Tag in front of injected lines so they stand out from game output
pub const SYSTEM_PREFIX: &str = "\x1b[1;33m[Axis Daemon]\x1b[0m ";

/// Remove CSI, OSC and two-byte escape sequences
pub fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        match chars.next() {
            // CSI: parameters and intermediates, then one final byte in @..~
            Some('[') => {
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            // OSC: terminated by BEL or ESC \
            Some(']') => {
                while let Some(c) = chars.next() {
                    if c == '\x07' {
                        break;
                    }
                    if c == '\x1b' {
                        if chars.peek() == Some(&'\\') {
                            chars.next();
                        }
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Container,
    /// Lifecycle and panel-originated notices
    System,
}

pub struct Subscription {
    pub id: u64,
    pub server_id: String,
    pub rx: mpsc::Receiver<String>,
}

#[derive(Default)]
struct BusState {
    subscribers: HashMap<String, Vec<(u64, mpsc::Sender<String>)>>,
    recent: HashMap<String, HashMap<String, Instant>>,
    next_id: u64,
}

#[derive(Default)]
pub struct LogBus {
    state: Mutex<BusState>,
}

impl LogBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, server_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.subscribers.entry(server_id.to_string()).or_default().push((id, tx));
        Subscription { id, server_id: server_id.to_string(), rx }
    }

    /// Drops the sender under the lock; the receiver sees the channel close once
    pub fn unsubscribe(&self, sub: &Subscription) {
        let mut state = self.lock();
        if let Some(list) = state.subscribers.get_mut(&sub.server_id) {
            list.retain(|(id, _)| *id != sub.id);
            if list.is_empty() {
                state.subscribers.remove(&sub.server_id);
            }
        }
    }

    pub fn subscriber_count(&self, server_id: &str) -> usize {
        self.lock().subscribers.get(server_id).map(|l| l.len()).unwrap_or(0)
    }

    pub fn publish(&self, server_id: &str, message: &str, source: LogSource) -> bool {
        self.publish_at(server_id, message, source, Instant::now())
    }

    /// Convenience for lifecycle notices
    pub fn system(&self, server_id: &str, message: &str) {
        self.publish(server_id, message, LogSource::System);
    }

    /// Returns whether the line passed the filters and was offered to subscribers
    pub fn publish_at(&self, server_id: &str, message: &str, source: LogSource, now: Instant) -> bool {
        let clean = strip_ansi(message);
        let clean = clean.trim_end_matches(['\r', '\n']);
        if clean.trim().is_empty() {
            return false;
        }

        let mut state = self.lock();
        let recent = state.recent.entry(server_id.to_string()).or_default();
        if let Some(seen) = recent.get(clean) {
            if now.saturating_duration_since(*seen) < DEDUP_WINDOW {
                return false;
            }
        }
        recent.insert(clean.to_string(), now);

        let line = match source {
            LogSource::Container => clean.to_string(),
            LogSource::System => format!("{}{}", SYSTEM_PREFIX, clean),
        };
        if let Some(subs) = state.subscribers.get(server_id) {
            for (id, tx) in subs {
                if tx.try_send(line.clone()).is_err() {
                    debug!("log subscriber {} for {} is full, line dropped", id, server_id);
                }
            }
        }
        true
    }

    /// Evict dedup entries older than `max_age`
    pub fn sweep(&self, now: Instant, max_age: Duration) {
        let mut state = self.lock();
        state.recent.retain(|_, msgs| {
            msgs.retain(|_, t| now.saturating_duration_since(*t) <= max_age);
            !msgs.is_empty()
        });
    }

    pub fn spawn_janitor(self: &Arc<Self>) {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(JANITOR_PERIOD);
            loop {
                tick.tick().await;
                bus.sweep(Instant::now(), JANITOR_MAX_AGE);
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn recent_len(&self, server_id: &str) -> usize {
        self.lock().recent.get(server_id).map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(sub: &mut Subscription) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = sub.rx.try_recv() {
            out.push(line);
        }
        out
    }

    #[test]
    fn strips_ansi_and_discards_blank() {
        let bus = LogBus::new();
        let mut sub = bus.subscribe("s1");
        assert!(bus.publish("s1", "\x1b[32m[INFO]\x1b[0m Done", LogSource::Container));
        assert!(!bus.publish("s1", "   \x1b[0m  ", LogSource::Container));
        assert_eq!(drain(&mut sub), vec!["[INFO] Done"]);
    }

    #[test]
    fn strip_ansi_sequences() {
        assert_eq!(strip_ansi("\x1b[1;31mred\x1b[0m plain"), "red plain");
        assert_eq!(strip_ansi("\x1b]0;title\x07after"), "after");
        assert_eq!(strip_ansi("\x1b[?25lhidden cursor"), "hidden cursor");
        assert_eq!(strip_ansi("no escapes"), "no escapes");
    }

    #[test]
    fn dedups_within_window() {
        let bus = LogBus::new();
        let mut sub = bus.subscribe("s1");
        let t0 = Instant::now();
        for i in 0..250 {
            bus.publish_at("s1", "same line", LogSource::Container, t0 + Duration::from_millis(i * 2));
        }
        assert_eq!(drain(&mut sub).len(), 1);

        // Window measured from the last accepted occurrence
        assert!(bus.publish_at("s1", "same line", LogSource::Container, t0 + Duration::from_millis(1000)));
        assert_eq!(drain(&mut sub).len(), 1);
    }

    #[test]
    fn system_lines_are_tagged() {
        let bus = LogBus::new();
        let mut sub = bus.subscribe("s1");
        bus.system("s1", "Server stopped gracefully");
        assert_eq!(drain(&mut sub), vec![format!("{}Server stopped gracefully", SYSTEM_PREFIX)]);
    }

    #[test]
    fn full_subscriber_drops_without_blocking_others() {
        let bus = LogBus::new();
        let mut slow = bus.subscribe("s1");
        let t0 = Instant::now();
        for i in 0..(SUBSCRIBER_BUFFER + 20) {
            bus.publish_at("s1", &format!("line {}", i), LogSource::Container, t0);
        }
        let mut fast = bus.subscribe("s1");
        bus.publish_at("s1", "after", LogSource::Container, t0);
        assert_eq!(drain(&mut slow).len(), SUBSCRIBER_BUFFER);
        assert_eq!(drain(&mut fast), vec!["after"]);
    }

    #[test]
    fn unsubscribe_closes_channel_once() {
        let bus = LogBus::new();
        let mut sub = bus.subscribe("s1");
        let other = bus.subscribe("s2");
        bus.unsubscribe(&sub);
        bus.unsubscribe(&sub);
        assert_eq!(bus.subscriber_count("s1"), 0);
        assert_eq!(bus.subscriber_count("s2"), 1);
        assert!(matches!(sub.rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
        bus.unsubscribe(&other);
    }

    #[test]
    fn janitor_evicts_old_entries() {
        let bus = LogBus::new();
        let t0 = Instant::now();
        bus.publish_at("s1", "a", LogSource::Container, t0);
        bus.publish_at("s1", "b", LogSource::Container, t0 + Duration::from_secs(4));
        bus.sweep(t0 + Duration::from_secs(6), JANITOR_MAX_AGE);
        assert_eq!(bus.recent_len("s1"), 1);
        bus.sweep(t0 + Duration::from_secs(20), JANITOR_MAX_AGE);
        assert_eq!(bus.recent_len("s1"), 0);
    }
}
