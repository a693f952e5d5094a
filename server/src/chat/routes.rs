// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Chat REST surface plus the notification WebSocket.

use super::bot::Bot;
use super::server::{channel_message_receivers, require_user, ChatEvent, ChatServer, DEFAULT_CHANNEL_ID};
use crate::auth::tokens::{authenticate_bearer, authenticate_bearer_with_scope};
use crate::context::Context;
use crate::db::chat::{self, ChannelType};
use crate::db::users::{self, RelationshipKind};
use crate::error::ApiError;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post, put};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router() -> Router<Arc<Context>> {
    Router::new()
        .route("/api/v2/chat/channels", get(list_channels))
        .route(
            "/api/v2/chat/channels/{channel}/users/{user}",
            put(join_channel).delete(leave_channel),
        )
        .route(
            "/api/v2/chat/channels/{channel}/messages",
            get(get_messages).post(send_message),
        )
        .route(
            "/api/v2/chat/channels/{channel}/mark-as-read/{message}",
            put(mark_as_read),
        )
        .route("/api/v2/chat/new", post(new_pm))
        .route("/notification-server", any(notification_socket))
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

async fn list_channels(
    State(ctx): State<Arc<Context>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let app = &ctx.app;
    authenticate_bearer(app, bearer(&headers)).await?;
    let channels = chat::public_channels(&app.db).await?;
    let body: Vec<serde_json::Value> = channels
        .iter()
        .map(|c| {
            json!({
                "channel_id": c.channel_id,
                "name": c.name,
                "description": c.description,
                "type": c.channel_type,
            })
        })
        .collect();
    Ok(Json(body).into_response())
}

async fn join_channel(
    State(ctx): State<Arc<Context>>,
    Path((channel_id, user_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let app = &ctx.app;
    let (user, _) = authenticate_bearer(app, bearer(&headers)).await?;
    if user.id != user_id {
        return Err(ApiError::Forbidden("cannot join other users to channels".to_owned()));
    }
    let channel = chat::channel(&app.db, channel_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("channel not found".to_owned()))?;
    if !matches!(channel.kind(), ChannelType::Public) {
        return Err(ApiError::Forbidden("channel is not open for joining".to_owned()));
    }
    let resp = ctx.chat.join_channel(user.id, &channel).await?;
    Ok(Json(resp).into_response())
}

async fn leave_channel(
    State(ctx): State<Arc<Context>>,
    Path((channel_id, user_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let app = &ctx.app;
    let (user, _) = authenticate_bearer(app, bearer(&headers)).await?;
    if user.id != user_id {
        return Err(ApiError::Forbidden("cannot part other users from channels".to_owned()));
    }
    let channel = chat::channel(&app.db, channel_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("channel not found".to_owned()))?;
    ctx.chat.leave_channel(user.id, &channel).await?;
    Ok(axum::http::StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Deserialize)]
struct GetMessagesQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    since: Option<i64>,
    #[serde(default)]
    until: Option<i64>,
}

fn default_limit() -> usize {
    50
}

async fn get_messages(
    State(ctx): State<Arc<Context>>,
    Path(channel_id): Path<i64>,
    Query(query): Query<GetMessagesQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let app = &ctx.app;
    authenticate_bearer(app, bearer(&headers)).await?;
    let channel = chat::channel(&app.db, channel_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("channel not found".to_owned()))?;
    let messages = ctx
        .messages
        .get_messages(
            channel_id,
            query.limit,
            query.since,
            query.until,
            channel.kind() == ChannelType::Multiplayer,
        )
        .await?;
    let mut body = Vec::with_capacity(messages.len());
    for message in &messages {
        let sender = require_user(app, message.sender_id).await?;
        body.push(ChatServer::message_resp(message, &sender));
    }
    Ok(Json(body).into_response())
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    message: String,
    #[serde(default)]
    is_action: bool,
    #[serde(default)]
    uuid: Option<String>,
}

async fn send_message(
    State(ctx): State<Arc<Context>>,
    Path(channel_id): Path<i64>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> Result<Response, ApiError> {
    let app = &ctx.app;
    let (sender, _) = authenticate_bearer_with_scope(app, bearer(&headers), "chat.write").await?;
    if sender.is_restricted {
        return Err(ApiError::Forbidden("restricted users cannot send messages".to_owned()));
    }
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message is empty".to_owned()));
    }
    let channel = chat::channel(&app.db, channel_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("channel not found".to_owned()))?;

    // PM channels enforce block and friends-only rules on every send.
    if channel.kind() == ChannelType::Pm {
        if let Some(other) = pm_counterpart(&channel.name, sender.id) {
            ensure_can_message(app, &sender, other).await?;
        }
    }

    let is_multiplayer = channel.kind() == ChannelType::Multiplayer;
    let message = ctx
        .messages
        .send_message(
            channel_id,
            sender.id,
            request.message.trim(),
            request.is_action,
            request.uuid.as_deref(),
            is_multiplayer,
        )
        .await?;
    ctx.chat.deliver_message(&message, &sender);

    let receivers = channel_message_receivers(&ctx.chat, channel_id, sender.id);
    if !receivers.is_empty() && !is_multiplayer {
        ctx.chat
            .deliver_notification(
                "channel_message",
                "channel",
                "channel",
                channel_id,
                Some(sender.id),
                json!({
                    "title": request.message.trim(),
                    "type": channel.channel_type,
                    "cover_url": "",
                }),
                &receivers,
            )
            .await?;
    }

    // Bot commands ride on normal messages.
    if request.message.starts_with('!') {
        let bot = Bot::default();
        if let Err(e) = bot
            .try_handle(&ctx.chat, &sender, &channel, request.message.trim())
            .await
        {
            log::warn!("bot command failed: {e}");
        }
    }

    Ok(Json(ChatServer::message_resp(&message, &sender)).into_response())
}

async fn mark_as_read(
    State(ctx): State<Arc<Context>>,
    Path((channel_id, message_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let app = &ctx.app;
    let (user, _) = authenticate_bearer(app, bearer(&headers)).await?;
    ctx.messages
        .mark_channel_read(channel_id, user.id, message_id)
        .await?;
    Ok(axum::http::StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Deserialize)]
struct NewPmRequest {
    target_id: i64,
    message: String,
    #[serde(default)]
    is_action: bool,
    #[serde(default)]
    uuid: Option<String>,
}

async fn new_pm(
    State(ctx): State<Arc<Context>>,
    headers: HeaderMap,
    Json(request): Json<NewPmRequest>,
) -> Result<Response, ApiError> {
    let app = &ctx.app;
    let (sender, _) = authenticate_bearer_with_scope(app, bearer(&headers), "chat.write").await?;
    if sender.is_restricted {
        return Err(ApiError::Forbidden("restricted users cannot send messages".to_owned()));
    }
    if request.target_id == sender.id {
        return Err(ApiError::BadRequest("cannot message yourself".to_owned()));
    }
    ensure_can_message(app, &sender, request.target_id).await?;

    let channel = chat::get_or_create_pm_channel(&app.db, sender.id, request.target_id).await?;
    ctx.chat.join_channel(sender.id, &channel).await?;
    ctx.chat.join_channel(request.target_id, &channel).await?;
    let message = ctx
        .messages
        .send_message(
            channel.channel_id,
            sender.id,
            request.message.trim(),
            request.is_action,
            request.uuid.as_deref(),
            false,
        )
        .await?;
    ctx.chat.deliver_message(&message, &sender);
    Ok(Json(json!({
        "channel_id": channel.channel_id,
        "message": ChatServer::message_resp(&message, &sender),
    }))
    .into_response())
}

/// PM channel names are `pm_{minId}_{maxId}`; given one side, recover the
/// other.
fn pm_counterpart(name: &str, user_id: i64) -> Option<i64> {
    let mut parts = name.strip_prefix("pm_")?.splitn(2, '_');
    let a: i64 = parts.next()?.parse().ok()?;
    let b: i64 = parts.next()?.parse().ok()?;
    if a == user_id {
        Some(b)
    } else if b == user_id {
        Some(a)
    } else {
        None
    }
}

async fn ensure_can_message(
    app: &crate::app::App,
    sender: &users::UserRow,
    target_id: i64,
) -> Result<(), ApiError> {
    let target = require_user(app, target_id).await?;
    if target.is_restricted {
        return Err(ApiError::Forbidden("user is restricted".to_owned()));
    }
    if users::blocked_either_way(&app.db, sender.id, target_id).await? {
        return Err(ApiError::Forbidden(
            "cannot perform action due to user being blocked".to_owned(),
        ));
    }
    if target.pm_friends_only {
        let followed = users::relationship(&app.db, target_id, sender.id).await?
            == Some(RelationshipKind::Follow);
        if !followed {
            return Err(ApiError::Forbidden(
                "cannot perform action because user has disabled non-friend communications"
                    .to_owned(),
            ));
        }
    }
    Ok(())
}

async fn notification_socket(
    State(ctx): State<Arc<Context>>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let (user, _) =
        authenticate_bearer_with_scope(&ctx.app, bearer(&headers), "chat.read").await?;
    Ok(upgrade.on_upgrade(move |socket| serve_notification_socket(ctx, user.id, socket)))
}

async fn serve_notification_socket(ctx: Arc<Context>, user_id: i64, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    // The client opens with a `chat.start` frame.
    let started = matches!(
        stream.next().await,
        Some(Ok(Message::Text(text)))
            if serde_json::from_str::<serde_json::Value>(text.as_str())
                .ok()
                .and_then(|v| v.get("event").and_then(|e| e.as_str().map(str::to_owned)))
                .as_deref()
                == Some("chat.start")
    );
    if !started {
        return;
    }

    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<ChatEvent>();
    ctx.chat.connect(user_id, sender);
    if let Ok(Some(channel)) = chat::channel(&ctx.app.db, DEFAULT_CHANNEL_ID).await {
        let _ = ctx.chat.join_channel(user_id, &channel).await;
    }

    let writer = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            let Ok(body) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(body.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                let event = serde_json::from_str::<serde_json::Value>(text.as_str())
                    .ok()
                    .and_then(|v| v.get("event").and_then(|e| e.as_str().map(str::to_owned)));
                if event.as_deref() == Some("chat.end") {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    ctx.chat.disconnect(user_id);
    writer.abort();
    log::info!("[chat] client {user_id} disconnected");
}
