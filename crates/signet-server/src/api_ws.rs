//! Live connection endpoint: `GET /ws/{entity_id}`.
//!
//! The upgrade is always accepted; authentication happens on the socket so a
//! rejected client receives an explicit close frame (1008) with the reason.
//! An authenticated connection is registered for exactly one entity and gets
//! two tasks: a reader that answers client frames and enforces the idle
//! timeout, and a writer that drains the connection's bounded queue with a
//! per-frame send timeout and emits periodic pings.

use crate::api::parse_id;
use crate::auth::{AuthError, Identity};
use crate::config::ConnectionSettings;
use crate::registry::{CloseReason, ConnectionHandle};
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        ConnectInfo, Extension, Path, Query,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

/// Query parameters accepted on connect.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    #[serde(default)]
    pub token: Option<String>,
}

/// Frames a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Ping {
        #[serde(default)]
        timestamp: Value,
    },
    Subscribe {
        #[serde(default, alias = "document_id")]
        entity_id: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize)]
struct EstablishedData<'a> {
    entity_id: Uuid,
    user_id: &'a str,
    email: Option<&'a str>,
    message: String,
}

/// Frames the server sends outside of change notifications.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ServerMessage<'a> {
    #[serde(rename = "connection.established")]
    Established { data: EstablishedData<'a> },
    #[serde(rename = "pong")]
    Pong { timestamp: Value },
    #[serde(rename = "error")]
    Error { message: &'a str },
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
}

/// Serializes and enqueues a control frame on the connection's queue.
fn send_control(handle: &ConnectionHandle, message: &ServerMessage<'_>) {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("failed to serialize websocket control frame: {}", e);
            return;
        }
    };
    if let Err(e) = handle.try_send(json) {
        tracing::warn!(
            connection_id = %handle.id(),
            "dropping connection, control frame not enqueued: {}",
            e
        );
        handle.begin_close(CloseReason::SLOW_CONSUMER);
    }
}

/// WebSocket handler: `GET /ws/{entity_id}?token=...`, or with an
/// `Authorization: Bearer` header.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(entity_id): Path<String>,
    Query(params): Query<WsConnectParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let entity_id = match parse_id(&entity_id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    let token = params.token.or_else(|| bearer_token(&headers));
    ws.on_upgrade(move |socket| handle_socket(socket, state, entity_id, token, addr))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    entity_id: Uuid,
    token: Option<String>,
    addr: SocketAddr,
) {
    let settings = state.connection;
    let (tx, rx) = mpsc::channel::<String>(settings.queue_capacity);
    let handle = Arc::new(ConnectionHandle::new(entity_id, tx));
    handle.begin_authentication();

    let claims = match state.auth.validate(token.as_deref()) {
        Ok(claims) => claims,
        Err(e) => {
            reject(socket, &handle, &e, addr).await;
            state.registry.deregister(&handle);
            return;
        }
    };
    let identity = Identity::from(&claims);

    if let Err(e) = state.registry.subscribe(Arc::clone(&handle), identity.clone()) {
        tracing::warn!(remote_addr = %addr, "websocket subscribe failed: {}", e);
        state.registry.deregister(&handle);
        return;
    }
    tracing::info!(
        remote_addr = %addr,
        entity_id = %entity_id,
        user_id = %identity.user_id,
        "websocket auth success"
    );

    send_control(
        &handle,
        &ServerMessage::Established {
            data: EstablishedData {
                entity_id,
                user_id: &identity.user_id,
                email: identity.email.as_deref(),
                message: format!("Connected to entity {}", entity_id),
            },
        },
    );

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, rx, Arc::clone(&handle), settings));

    read_loop(stream, &handle, settings).await;

    state.registry.deregister(&handle);
    if let Err(e) = writer.await {
        tracing::error!(connection_id = %handle.id(), "websocket writer join error: {}", e);
    }
    tracing::info!(
        connection_id = %handle.id(),
        entity_id = %entity_id,
        reason = handle.close_reason().reason,
        "websocket closed"
    );
}

/// `Authenticating → Closing`: sends the policy-violation close frame.
async fn reject(mut socket: WebSocket, handle: &ConnectionHandle, error: &AuthError, addr: SocketAddr) {
    tracing::warn!(
        remote_addr = %addr,
        entity_id = %handle.entity_id(),
        "websocket auth failed: {}",
        error
    );
    let reason = error.close_reason();
    handle.begin_close(CloseReason {
        code: close_code::POLICY,
        reason,
    });
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: Utf8Bytes::from_static(reason),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        tracing::debug!(remote_addr = %addr, "failed to send close frame: {}", e);
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    handle: &ConnectionHandle,
    settings: ConnectionSettings,
) {
    loop {
        let next = tokio::select! {
            _ = handle.closed() => return,
            next = tokio::time::timeout(settings.idle_timeout, stream.next()) => next,
        };

        match next {
            Err(_) => {
                tracing::info!(connection_id = %handle.id(), "websocket idle timeout");
                handle.begin_close(CloseReason::IDLE);
                return;
            }
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => {
                handle.begin_close(CloseReason::CLIENT_GONE);
                return;
            }
            Ok(Some(Ok(Message::Text(text)))) => handle_client_text(handle, text.as_str()),
            Ok(Some(Ok(_))) => {}
        }
    }
}

fn handle_client_text(handle: &ConnectionHandle, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(connection_id = %handle.id(), "received invalid JSON from client");
            send_control(handle, &ServerMessage::Error {
                message: "Invalid JSON",
            });
            return;
        }
    };

    match serde_json::from_value::<ClientMessage>(value) {
        Ok(ClientMessage::Ping { timestamp }) => {
            send_control(handle, &ServerMessage::Pong { timestamp });
        }
        Ok(ClientMessage::Subscribe { entity_id }) => {
            // One entity per connection; the request is only recorded.
            tracing::info!(
                connection_id = %handle.id(),
                subscribed = %handle.entity_id(),
                requested = entity_id.as_deref().unwrap_or(""),
                "client requested subscription change"
            );
        }
        Ok(ClientMessage::Other) | Err(_) => {
            tracing::debug!(connection_id = %handle.id(), "ignoring client frame: {}", text);
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
    handle: Arc<ConnectionHandle>,
    settings: ConnectionSettings,
) {
    let mut ping = tokio::time::interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let outgoing = tokio::select! {
            _ = handle.closed() => break,
            msg = rx.recv() => match msg {
                Some(text) => Message::Text(text.into()),
                None => break,
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match tokio::time::timeout(settings.send_timeout, sink.send(outgoing)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(connection_id = %handle.id(), "websocket send failed: {}", e);
                handle.begin_close(CloseReason::SEND_FAILED);
                break;
            }
            Err(_) => {
                tracing::warn!(connection_id = %handle.id(), "websocket send timed out");
                handle.begin_close(CloseReason::SEND_FAILED);
                break;
            }
        }
    }

    let reason = handle.close_reason();
    let frame = CloseFrame {
        code: reason.code,
        reason: Utf8Bytes::from_static(reason.reason),
    };
    let _ = tokio::time::timeout(settings.send_timeout, sink.send(Message::Close(Some(frame)))).await;
}
