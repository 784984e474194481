// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Chained console WebSocket: browser ↔ panel ↔ node
//!
//! The panel opens its own socket to the node with the daemon token and
//! relays frames both ways. Console commands from the browser are only
//! relayed when the user holds `console.write`; others are dropped quietly.

use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_ws::Message;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::api::authenticate;
use super::permissions::{has_server_permission, CONSOLE_READ, CONSOLE_WRITE};
use super::store::{Node, PanelStore, User};
use super::PanelState;
use crate::error::{AxisError, Result};
use crate::protocol::WsMessage;

pub type NodeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_DEADLINE: Duration = Duration::from_secs(60);

/// Open the node leg for a server's console
pub async fn connect_node_ws(node: &Node, server_id: &str, accept_invalid_certs: bool) -> Result<NodeSocket> {
    let secure = node.scheme == "https";
    let url = format!(
        "{}://{}:{}/api/servers/{}/ws?token={}",
        if secure { "wss" } else { "ws" },
        node.fqdn,
        node.port,
        server_id,
        urlencoding::encode(&node.daemon_token)
    );

    let connector = if secure {
        let mut builder = native_tls::TlsConnector::builder();
        if accept_invalid_certs {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        let tls = builder.build().map_err(|e| AxisError::internal(format!("TLS connector error: {}", e)))?;
        Some(tokio_tungstenite::Connector::NativeTls(tls))
    } else {
        None
    };

    let (stream, _) = tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector)
        .await
        .map_err(|e| AxisError::NodeUnreachable(format!("Node console connection failed: {}", e)))?;
    Ok(stream)
}

/// Whether a browser frame may be relayed to the node
fn allow_client_frame(store: &PanelStore, user: &User, server_id: &str, text: &str) -> bool {
    match serde_json::from_str::<WsMessage>(text) {
        Ok(WsMessage::Command { .. }) => store.read(|d| has_server_permission(d, user, server_id, CONSOLE_WRITE)),
        _ => false,
    }
}

/// GET /api/servers/{id}/ws?token=
pub async fn server_ws(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<PanelState>,
    path: web::Path<String>,
) -> std::result::Result<HttpResponse, Error> {
    let server_id = path.into_inner();
    let user = authenticate(&req, &state)?;
    let allowed = state.store.read(|d| has_server_permission(d, &user, &server_id, CONSOLE_READ));
    if !allowed {
        return Err(AxisError::forbidden("Missing permission: console.read").into());
    }
    let (_, node) = state.client.locate(&server_id)?;
    let node_leg = connect_node_ws(&node, &server_id, state.client.accepts_invalid_certs()).await?;

    let (res, session, msg_stream) = actix_ws::handle(&req, stream)?;
    info!("Console relay opened for {} by {}", server_id, user.username);
    actix_rt::spawn(bridge(session, msg_stream, node_leg, state.store.clone(), user, server_id));
    Ok(res)
}

async fn bridge(
    mut session: actix_ws::Session,
    mut msg_stream: actix_ws::MessageStream,
    node_leg: NodeSocket,
    store: Arc<PanelStore>,
    user: User,
    server_id: String,
) {
    let (mut node_sink, mut node_rx) = node_leg.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    let mut client_pong = Instant::now();
    let mut node_pong = Instant::now();

    loop {
        tokio::select! {
            // Node → browser
            msg = node_rx.next() => {
                match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if session.text(text).await.is_err() { break; }
                    }
                    Some(Ok(tungstenite::Message::Ping(data))) => {
                        if node_sink.send(tungstenite::Message::Pong(data)).await.is_err() { break; }
                    }
                    Some(Ok(tungstenite::Message::Pong(_))) => node_pong = Instant::now(),
                    Some(Ok(tungstenite::Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }

            // Browser → node
            msg = msg_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if allow_client_frame(&store, &user, &server_id, &text) {
                            if node_sink.send(tungstenite::Message::Text(text.to_string())).await.is_err() { break; }
                        } else {
                            debug!("Dropped console frame from {} for {}", user.username, server_id);
                        }
                    }
                    Some(Ok(Message::Ping(bytes))) => {
                        if session.pong(&bytes).await.is_err() { break; }
                    }
                    Some(Ok(Message::Pong(_))) => client_pong = Instant::now(),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }

            // Keepalive on both legs
            _ = ping.tick() => {
                if client_pong.elapsed() > PONG_DEADLINE || node_pong.elapsed() > PONG_DEADLINE {
                    warn!("Console relay for {} timed out", server_id);
                    break;
                }
                if session.ping(b"").await.is_err() { break; }
                if node_sink.send(tungstenite::Message::Ping(Vec::new())).await.is_err() { break; }
            }
        }
    }

    let _ = node_sink.close().await;
    let _ = session.close(None).await;
    info!("Console relay closed for {}", server_id);
}
