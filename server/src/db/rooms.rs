// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use cadence_common::mods::ApiMod;
use cadence_common::multiplayer::{MultiplayerRoomSettings, PlaylistItem};
use cadence_common::protocol::WireValue;
use cadence_common::{ChannelId, PlaylistItemId, RoomId, UserId};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, MySqlPool};

fn mods_json(mods: &[ApiMod]) -> serde_json::Value {
    serde_json::Value::Array(mods.iter().map(WireValue::to_json).collect())
}

pub async fn insert_room(
    pool: &MySqlPool,
    settings: &MultiplayerRoomSettings,
    host_id: UserId,
    channel_id: ChannelId,
) -> Result<RoomId, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO rooms \
         (name, category, type, queue_mode, auto_skip, auto_start_duration, host_id, channel_id, \
          status, participant_count, starts_at) \
         VALUES (?, 'realtime', ?, ?, ?, ?, ?, ?, 'idle', 0, ?)",
    )
    .bind(&settings.name)
    .bind(settings.match_type.as_str())
    .bind(settings.queue_mode.as_str())
    .bind(settings.auto_skip)
    .bind(settings.auto_start_duration.0.as_secs() as i64)
    .bind(host_id.0)
    .bind(channel_id.0)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(RoomId(result.last_insert_id() as i64))
}

pub async fn update_room_settings(
    pool: &MySqlPool,
    room_id: RoomId,
    settings: &MultiplayerRoomSettings,
    host_id: Option<UserId>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE rooms SET name = ?, type = ?, queue_mode = ?, auto_skip = ?, \
         auto_start_duration = ?, host_id = ? WHERE id = ?",
    )
    .bind(&settings.name)
    .bind(settings.match_type.as_str())
    .bind(settings.queue_mode.as_str())
    .bind(settings.auto_skip)
    .bind(settings.auto_start_duration.0.as_secs() as i64)
    .bind(host_id.map(|id| id.0))
    .bind(room_id.0)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_room_channel(
    pool: &MySqlPool,
    room_id: RoomId,
    channel_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE rooms SET channel_id = ? WHERE id = ?")
        .bind(channel_id)
        .bind(room_id.0)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_room_status(
    pool: &MySqlPool,
    room_id: RoomId,
    status: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE rooms SET status = ? WHERE id = ?")
        .bind(status)
        .bind(room_id.0)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn close_room(pool: &MySqlPool, room_id: RoomId) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE rooms SET ends_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(room_id.0)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn adjust_participant_count(
    pool: &MySqlPool,
    room_id: RoomId,
    delta: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE rooms SET participant_count = GREATEST(0, participant_count + ?) WHERE id = ?",
    )
    .bind(delta)
    .bind(room_id.0)
    .execute(pool)
    .await?;
    Ok(())
}

/// Records (or re-opens) a user's participation window in a room.
pub async fn upsert_participation(
    pool: &MySqlPool,
    room_id: RoomId,
    user_id: UserId,
) -> Result<(), sqlx::Error> {
    let now = Utc::now();
    let existing: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM room_participated_users WHERE room_id = ? AND user_id = ?",
    )
    .bind(room_id.0)
    .bind(user_id.0)
    .fetch_optional(pool)
    .await?;
    if let Some(id) = existing {
        sqlx::query("UPDATE room_participated_users SET joined_at = ?, left_at = NULL WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(pool)
            .await?;
    } else {
        sqlx::query(
            "INSERT INTO room_participated_users (room_id, user_id, joined_at) VALUES (?, ?, ?)",
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .bind(now)
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub async fn mark_participation_left(
    pool: &MySqlPool,
    room_id: RoomId,
    user_id: UserId,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE room_participated_users SET left_at = ? WHERE room_id = ? AND user_id = ?")
        .bind(Utc::now())
        .bind(room_id.0)
        .bind(user_id.0)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn insert_playlist_item(
    pool: &MySqlPool,
    room_id: RoomId,
    item: &PlaylistItem,
) -> Result<PlaylistItemId, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO playlist_items \
         (room_id, owner_id, beatmap_id, checksum, ruleset_id, required_mods, allowed_mods, \
          expired, playlist_order, star_rating, freestyle) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(room_id.0)
    .bind(item.owner_id.0)
    .bind(item.beatmap_id.0)
    .bind(&item.checksum)
    .bind(item.ruleset_id.0)
    .bind(Json(mods_json(&item.required_mods)))
    .bind(Json(mods_json(&item.allowed_mods)))
    .bind(item.expired)
    .bind(item.order)
    .bind(item.star)
    .bind(item.freestyle)
    .execute(pool)
    .await?;
    Ok(PlaylistItemId(result.last_insert_id() as i64))
}

pub async fn update_playlist_item(pool: &MySqlPool, item: &PlaylistItem) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE playlist_items SET beatmap_id = ?, checksum = ?, ruleset_id = ?, \
         required_mods = ?, allowed_mods = ?, playlist_order = ?, star_rating = ?, freestyle = ? \
         WHERE id = ?",
    )
    .bind(item.beatmap_id.0)
    .bind(&item.checksum)
    .bind(item.ruleset_id.0)
    .bind(Json(mods_json(&item.required_mods)))
    .bind(Json(mods_json(&item.allowed_mods)))
    .bind(item.order)
    .bind(item.star)
    .bind(item.freestyle)
    .bind(item.id.0)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn expire_playlist_item(
    pool: &MySqlPool,
    item_id: PlaylistItemId,
    played_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE playlist_items SET expired = TRUE, played_at = ? WHERE id = ?")
        .bind(played_at)
        .bind(item_id.0)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_playlist_item(
    pool: &MySqlPool,
    item_id: PlaylistItemId,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM playlist_items WHERE id = ?")
        .bind(item_id.0)
        .execute(pool)
        .await?;
    Ok(())
}

/// Append-only log of notable room transitions.
pub async fn insert_room_event(
    pool: &MySqlPool,
    room_id: RoomId,
    user_id: Option<UserId>,
    playlist_item_id: Option<PlaylistItemId>,
    event_type: &str,
    detail: Option<serde_json::Value>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO multiplayer_events \
         (room_id, user_id, playlist_item_id, event_type, event_detail, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(room_id.0)
    .bind(user_id.map(|id| id.0))
    .bind(playlist_item_id.map(|id| id.0))
    .bind(event_type)
    .bind(detail.map(Json))
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, FromRow)]
pub struct BeatmapRow {
    pub id: i64,
    pub beatmapset_id: i64,
    pub mode: i32,
    pub checksum: String,
    pub beatmap_status: i32,
}

pub async fn beatmap(pool: &MySqlPool, beatmap_id: i64) -> Result<Option<BeatmapRow>, sqlx::Error> {
    sqlx::query_as::<_, BeatmapRow>(
        "SELECT id, beatmapset_id, mode, checksum, beatmap_status FROM beatmaps WHERE id = ?",
    )
    .bind(beatmap_id)
    .fetch_optional(pool)
    .await
}

pub async fn beatmaps_of_set(
    pool: &MySqlPool,
    beatmapset_id: i64,
) -> Result<Vec<(i64, i32)>, sqlx::Error> {
    let rows: Vec<(i64, i32)> =
        sqlx::query_as("SELECT id, mode FROM beatmaps WHERE beatmapset_id = ?")
            .bind(beatmapset_id)
            .fetch_all(pool)
            .await?;
    Ok(rows)
}
