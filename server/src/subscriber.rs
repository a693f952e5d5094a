// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Redis pub/sub bridge. All cross-process coordination arrives here:
//! room channel membership, notification relay, and score-processed
//! events.

use crate::context::Context;
use cadence_common::ScoreId;
use deadpool_redis::redis;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

const ROOM_JOINED: &str = "chat:room:joined";
const ROOM_LEFT: &str = "chat:room:left";
const NOTIFICATION: &str = "chat:notification";
const SCORE_PROCESSED: &str = "osu-channel:score:processed";

pub fn spawn(ctx: Arc<Context>) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = run(&ctx).await {
                log::error!("pub/sub subscriber died: {e}; reconnecting");
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    });
}

async fn run(ctx: &Arc<Context>) -> Result<(), redis::RedisError> {
    let client = redis::Client::open(ctx.app.options.redis_url.as_str())?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub
        .subscribe(&[ROOM_JOINED, ROOM_LEFT, NOTIFICATION, SCORE_PROCESSED])
        .await?;
    log::info!("subscribed to pub/sub channels");

    let mut stream = pubsub.on_message();
    while let Some(message) = stream.next().await {
        let channel = message.get_channel_name().to_owned();
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("undecodable pub/sub payload on {channel}: {e}");
                continue;
            }
        };
        dispatch(ctx, &channel, &payload).await;
    }
    Ok(())
}

async fn dispatch(ctx: &Arc<Context>, channel: &str, payload: &str) {
    match channel {
        ROOM_JOINED | ROOM_LEFT => {
            // Payload is "{channel_id}:{user_id}".
            let Some((channel_id, user_id)) = payload
                .split_once(':')
                .and_then(|(c, u)| Some((c.parse::<i64>().ok()?, u.parse::<i64>().ok()?)))
            else {
                log::warn!("malformed {channel} payload: {payload}");
                return;
            };
            if channel == ROOM_JOINED {
                ctx.chat.join_room_channel(channel_id, user_id).await;
            } else {
                ctx.chat.leave_room_channel(channel_id, user_id).await;
            }
        }
        NOTIFICATION => {
            ctx.chat.relay_notification(payload).await;
        }
        SCORE_PROCESSED => {
            // Payload is {"ScoreId": n}.
            let score_id = serde_json::from_str::<serde_json::Value>(payload)
                .ok()
                .and_then(|v| v.get("ScoreId").and_then(|id| id.as_i64()));
            let Some(score_id) = score_id else {
                log::warn!("malformed score:processed payload: {payload}");
                return;
            };
            ctx.hubs.metadata.on_score_processed(ScoreId(score_id)).await;
        }
        _ => {}
    }
}
