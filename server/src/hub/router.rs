// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Negotiate + WebSocket entry points for the hubs.

use super::{Hub, HubClient};
use crate::auth::tokens::authenticate_bearer;
use crate::context::Context;
use crate::error::ApiError;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, post};
use axum::{Json, Router};
use cadence_common::protocol::{
    handshake_response, parse_handshake, CodecKind, Packet, WireIn,
};
use bytes::Bytes;
use cadence_common::UserId;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn router() -> Router<Arc<Context>> {
    // Bare aliases serve clients that negotiate without the prefix;
    // unknown hub names fall out as 404 either way.
    Router::new()
        .route("/signalr/{hub}/negotiate", post(negotiate))
        .route("/signalr/{hub}", any(hub_socket))
        .route("/{hub}/negotiate", post(negotiate))
        .route("/{hub}", any(hub_socket))
}

#[derive(Debug, Deserialize)]
struct NegotiateQuery {
    #[serde(rename = "negotiateVersion", default = "default_negotiate_version")]
    negotiate_version: u32,
}

fn default_negotiate_version() -> u32 {
    1
}

async fn negotiate(
    State(ctx): State<Arc<Context>>,
    Path(hub): Path<String>,
    Query(query): Query<NegotiateQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let hub = ctx
        .hubs
        .by_name(&hub)
        .ok_or_else(|| ApiError::NotFound(format!("no such hub: {hub}")))?;
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let (user, _token) = authenticate_bearer(&ctx.app, authorization).await?;

    let connection_id = user.id.to_string();
    let connection_token = format!("{connection_id}:{}", Uuid::new_v4());
    hub.core().add_waited(connection_token.clone());

    Ok(Json(json!({
        "connectionId": connection_id,
        "connectionToken": connection_token,
        "negotiateVersion": query.negotiate_version,
        "availableTransports": [{
            "transport": "WebSockets",
            "transferFormats": ["Binary", "Text"],
        }],
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct SocketQuery {
    id: String,
}

async fn hub_socket(
    State(ctx): State<Arc<Context>>,
    Path(hub): Path<String>,
    Query(query): Query<SocketQuery>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let hub = ctx
        .hubs
        .by_name(&hub)
        .ok_or_else(|| ApiError::NotFound(format!("no such hub: {hub}")))?;
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let (user, _token) = authenticate_bearer(&ctx.app, authorization).await?;

    // The token is minted at negotiate time as "{user_id}:{uuid}".
    let expected_user: Option<i64> = query.id.split(':').next().and_then(|s| s.parse().ok());
    if expected_user != Some(user.id) || !hub.core().is_waited(&query.id) {
        return Err(ApiError::Unauthorized);
    }

    let ping_interval = ctx.app.options.ping_interval();
    Ok(upgrade.on_upgrade(move |socket| {
        serve_socket(hub, UserId(user.id), query.id, socket, ping_interval)
    }))
}

async fn serve_socket(
    hub: Arc<dyn Hub>,
    user_id: UserId,
    connection_token: String,
    mut socket: WebSocket,
    ping_interval: Duration,
) {
    // Handshake: one record-separator-terminated JSON frame selecting the
    // codec, answered with `{}` or an error.
    let raw = match tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(message))) => message_bytes(&message),
        _ => return,
    };
    let Some(raw) = raw else {
        return;
    };
    let codec = parse_handshake(&raw)
        .ok()
        .and_then(|request| CodecKind::from_name(&request.protocol));
    let Some(codec) = codec else {
        let _ = socket
            .send(Message::Binary(Bytes::from(handshake_response(Some(
                "Requested protocol is not supported",
            )))))
            .await;
        return;
    };
    if let Err(error) = hub.core().take_waited(&connection_token) {
        let _ = socket
            .send(Message::Binary(Bytes::from(handshake_response(Some(error)))))
            .await;
        return;
    }
    if socket
        .send(Message::Binary(Bytes::from(handshake_response(None))))
        .await
        .is_err()
    {
        return;
    }

    let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
    let client = Arc::new(HubClient::new(
        user_id,
        connection_token.clone(),
        codec,
        sender,
    ));

    // A fresh socket for a user whose predecessor is still around kicks
    // the predecessor and resets per-hub state.
    if let Some(predecessor) = hub.core().insert_client(client.clone()) {
        predecessor.kick(None);
        hub.clean_state(user_id).await;
    }

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, receiver, codec));
    let pinger = tokio::spawn(ping_loop(client.clone(), ping_interval));
    {
        let hub = hub.clone();
        let client = client.clone();
        tokio::spawn(async move {
            hub.on_connect(&client).await;
        });
    }

    read_loop(&hub, &client, stream).await;

    // Teardown: if this token is still the registered one, the user is
    // actually gone (not merely replaced by a reconnect).
    if hub.core().remove_client(user_id, &connection_token).is_some() {
        hub.clean_state(user_id).await;
    }
    client.kick(None);
    pinger.abort();
    let _ = writer.await;
    log::info!("[{}] client {user_id} disconnected", hub.core().name);
}

fn message_bytes(message: &Message) -> Option<Vec<u8>> {
    match message {
        Message::Binary(data) => Some(data.to_vec()),
        Message::Text(text) => Some(text.as_bytes().to_vec()),
        _ => None,
    }
}

async fn read_loop(
    hub: &Arc<dyn Hub>,
    client: &Arc<HubClient>,
    mut stream: SplitStream<WebSocket>,
) {
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                log::info!(
                    "[{}] client {} socket error: {e}",
                    hub.core().name,
                    client.user_id
                );
                break;
            }
        };
        if matches!(message, Message::Close(_)) {
            break;
        }
        let Some(raw) = message_bytes(&message) else {
            continue;
        };
        let packets = match Packet::decode(&raw, client.codec) {
            Ok(packets) => packets,
            Err(e) => {
                log::warn!(
                    "[{}] client {} sent an undecodable frame: {e}",
                    hub.core().name,
                    client.user_id
                );
                continue;
            }
        };
        for packet in packets {
            match packet {
                Packet::Ping => {}
                Packet::Close { .. } => return,
                Packet::Completion {
                    invocation_id,
                    error,
                    result,
                } => {
                    client.complete(&invocation_id, result, error);
                }
                Packet::Invocation {
                    invocation_id,
                    target,
                    arguments,
                    ..
                } => {
                    // Each invocation runs on its own task so one slow
                    // handler cannot starve this client's ping or other
                    // calls.
                    let hub = hub.clone();
                    let client = client.clone();
                    tokio::spawn(async move {
                        handle_invocation(&hub, &client, invocation_id, &target, &arguments).await;
                    });
                }
            }
        }
    }
}

async fn handle_invocation(
    hub: &Arc<dyn Hub>,
    client: &Arc<HubClient>,
    invocation_id: Option<String>,
    target: &str,
    arguments: &[WireIn],
) {
    let result = hub.dispatch(client, target, arguments).await;
    let Some(invocation_id) = invocation_id else {
        if let Err(e) = result {
            log::info!(
                "[{}] unacknowledged invocation {target} failed: {e}",
                hub.core().name
            );
        }
        return;
    };
    let packet = match result {
        Ok(result) => Packet::completion(invocation_id, None, result),
        Err(e) => Packet::completion(invocation_id, Some(e.to_string()), None),
    };
    client.send_packet(packet);
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut receiver: tokio::sync::mpsc::UnboundedReceiver<super::ClientEvent>,
    codec: CodecKind,
) {
    while let Some(event) = receiver.recv().await {
        match event {
            super::ClientEvent::Packet(packet) => {
                let data = packet.encode(codec);
                if sink.send(Message::Binary(Bytes::from(data))).await.is_err() {
                    break;
                }
            }
            super::ClientEvent::Kick { error } => {
                let close = Packet::Close {
                    error,
                    allow_reconnect: false,
                };
                let _ = sink.send(Message::Binary(Bytes::from(close.encode(codec)))).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

async fn ping_loop(client: Arc<HubClient>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !client.send_packet(Packet::Ping) {
            break;
        }
    }
}
