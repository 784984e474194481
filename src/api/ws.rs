// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Per-server console WebSocket: live log lines, status changes, stats,
//! and console commands from the client.

use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_ws::{Message, MessageStream, Session};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{require_auth, server_id, AppState};
use crate::lifecycle::{Engine, FOLLOW_TAIL};
use crate::protocol::{ServerStatus, WsMessage};

const HISTORY_LINES: usize = 100;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_DEADLINE: Duration = Duration::from_secs(60);
/// A frame that cannot be handed to a stalled client in time closes the console
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Log lines forwarded per client per window before throttling
const THROTTLE_LINES: u32 = 200;
const THROTTLE_WINDOW: Duration = Duration::from_secs(1);
const THROTTLE_NOTICE: &str = "... output throttled, some lines were not shown ...";

#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    ping: Duration,
    deadline: Duration,
}

const HEARTBEAT: Heartbeat = Heartbeat { ping: PING_INTERVAL, deadline: PONG_DEADLINE };

#[derive(Debug, PartialEq)]
enum Throttle {
    Send,
    Notice,
    Drop,
}

/// Fixed-window line limiter; one notice per throttled window
struct LogThrottle {
    limit: u32,
    window: Duration,
    started: Instant,
    count: u32,
}

impl LogThrottle {
    fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window, started: Instant::now(), count: 0 }
    }

    fn check(&mut self, now: Instant) -> Throttle {
        if now.duration_since(self.started) >= self.window {
            self.started = now;
            self.count = 0;
        }
        self.count += 1;
        if self.count <= self.limit {
            Throttle::Send
        } else if self.count == self.limit + 1 {
            Throttle::Notice
        } else {
            Throttle::Drop
        }
    }
}

/// GET /api/servers/{id}/ws?token=
pub async fn server_ws(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, Error> {
    let id = server_id(&path)?;
    require_auth(&req, &state)?;
    let (res, session, msg_stream) = actix_ws::handle(&req, stream)?;

    info!("Console opened for {}", id);
    let engine = state.engine.clone();
    actix_rt::spawn(async move {
        run_session(engine, id, session, msg_stream, HEARTBEAT).await;
    });
    Ok(res)
}

/// Keep a follower attached for as long as the server runs. A follower
/// whose stream ended while the server stayed up is replaced without
/// replaying the tail again.
fn sync_follower(engine: &Arc<Engine>, id: &str, previous: ServerStatus, current: ServerStatus) {
    if current == ServerStatus::Running {
        let tail = if previous == ServerStatus::Running { 0 } else { FOLLOW_TAIL };
        engine.ensure_follower(id, tail);
    } else if previous == ServerStatus::Running {
        engine.stop_follower(id);
    }
}

async fn write_within<E>(deadline: Duration, write: impl Future<Output = std::result::Result<(), E>>) -> bool {
    match tokio::time::timeout(deadline, write).await {
        Ok(res) => res.is_ok(),
        Err(_) => {
            debug!("Console write timed out after {:?}", deadline);
            false
        }
    }
}

async fn send(session: &mut Session, msg: &WsMessage) -> bool {
    write_within(WRITE_TIMEOUT, session.text(msg.to_json())).await
}

async fn run_session(
    engine: Arc<Engine>,
    id: String,
    mut session: Session,
    mut msg_stream: MessageStream,
    heartbeat: Heartbeat,
) {
    // Replay history before subscribing so old lines come first
    if let Ok(lines) = engine.recent_logs(&id, HISTORY_LINES).await {
        for line in lines {
            if !send(&mut session, &WsMessage::log(line)).await {
                return;
            }
        }
    }

    let mut last_status = engine.status(&id).await;
    if !send(&mut session, &WsMessage::Status { status: last_status }).await {
        return;
    }
    if last_status == ServerStatus::Running {
        if let Some(stats) = engine.stats(&id).await {
            let _ = send(&mut session, &WsMessage::Stats { stats }).await;
        }
    }

    let mut sub = engine.bus().subscribe(&id);
    if last_status == ServerStatus::Running {
        // History already covered the backlog
        engine.ensure_follower(&id, 0);
    }

    let mut throttle = LogThrottle::new(THROTTLE_LINES, THROTTLE_WINDOW);
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    let mut ping = tokio::time::interval(heartbeat.ping);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            line = sub.rx.recv() => {
                let Some(line) = line else { break };
                let frame = match throttle.check(Instant::now()) {
                    Throttle::Send => WsMessage::log(line),
                    Throttle::Notice => WsMessage::log(THROTTLE_NOTICE),
                    Throttle::Drop => continue,
                };
                if !send(&mut session, &frame).await { break; }
            }

            _ = poll.tick() => {
                let status = engine.status(&id).await;
                sync_follower(&engine, &id, last_status, status);
                if status != last_status {
                    last_status = status;
                    if !send(&mut session, &WsMessage::Status { status }).await { break; }
                }
                if status == ServerStatus::Running {
                    if let Some(stats) = engine.stats(&id).await {
                        if !send(&mut session, &WsMessage::Stats { stats }).await { break; }
                    }
                }
            }

            _ = ping.tick() => {
                if last_pong.elapsed() > heartbeat.deadline {
                    debug!("Console for {} missed pongs, closing", id);
                    break;
                }
                if !write_within(WRITE_TIMEOUT, session.ping(b"")).await { break; }
            }

            msg = msg_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(WsMessage::Command { command }) = serde_json::from_str::<WsMessage>(&text) {
                            if let Err(e) = engine.send_command(&id, &command).await {
                                if !send(&mut session, &WsMessage::log(format!("Command failed: {}", e))).await { break; }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(bytes))) => {
                        if !write_within(WRITE_TIMEOUT, session.pong(&bytes)).await { break; }
                    }
                    Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    engine.bus().unsubscribe(&sub);
    if engine.bus().subscriber_count(&id) == 0 {
        engine.stop_follower(&id);
    }
    let _ = session.close(None).await;
    info!("Console closed for {}", id);
}
