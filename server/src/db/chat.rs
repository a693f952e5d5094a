// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use sqlx::{FromRow, MySqlPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Public,
    Private,
    Multiplayer,
    Pm,
    Team,
    Announce,
    Group,
    System,
    Spectator,
    Temporary,
}

impl ChannelType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Multiplayer => "multiplayer",
            Self::Pm => "pm",
            Self::Team => "team",
            Self::Announce => "announce",
            Self::Group => "group",
            Self::System => "system",
            Self::Spectator => "spectator",
            Self::Temporary => "temporary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Self::Public),
            "private" => Some(Self::Private),
            "multiplayer" => Some(Self::Multiplayer),
            "pm" => Some(Self::Pm),
            "team" => Some(Self::Team),
            "announce" => Some(Self::Announce),
            "group" => Some(Self::Group),
            "system" => Some(Self::System),
            "spectator" => Some(Self::Spectator),
            "temporary" => Some(Self::Temporary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ChannelRow {
    pub channel_id: i64,
    pub name: String,
    pub description: String,
    #[sqlx(rename = "type")]
    pub channel_type: String,
}

impl ChannelRow {
    pub fn kind(&self) -> ChannelType {
        ChannelType::parse(&self.channel_type).unwrap_or(ChannelType::Temporary)
    }
}

const CHANNEL_COLUMNS: &str = "channel_id, name, description, type";

pub async fn channel(pool: &MySqlPool, channel_id: i64) -> Result<Option<ChannelRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {CHANNEL_COLUMNS} FROM chat_channels WHERE channel_id = ?"
    ))
    .bind(channel_id)
    .fetch_optional(pool)
    .await
}

pub async fn public_channels(pool: &MySqlPool) -> Result<Vec<ChannelRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {CHANNEL_COLUMNS} FROM chat_channels WHERE type = 'public'"
    ))
    .fetch_all(pool)
    .await
}

pub async fn create_channel(
    pool: &MySqlPool,
    name: &str,
    description: &str,
    channel_type: ChannelType,
) -> Result<i64, sqlx::Error> {
    let result =
        sqlx::query("INSERT INTO chat_channels (name, description, type) VALUES (?, ?, ?)")
            .bind(name)
            .bind(description)
            .bind(channel_type.as_str())
            .execute(pool)
            .await?;
    Ok(result.last_insert_id() as i64)
}

/// PM channels are canonicalized on the ordered pair so the same two users
/// always share one channel.
pub fn pm_channel_name(a: i64, b: i64) -> String {
    format!("pm_{}_{}", a.min(b), a.max(b))
}

pub async fn get_or_create_pm_channel(
    pool: &MySqlPool,
    a: i64,
    b: i64,
) -> Result<ChannelRow, sqlx::Error> {
    let name = pm_channel_name(a, b);
    if let Some(existing) = sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {CHANNEL_COLUMNS} FROM chat_channels WHERE name = ? AND type = 'pm'"
    ))
    .bind(&name)
    .fetch_optional(pool)
    .await?
    {
        return Ok(existing);
    }
    let id = create_channel(pool, &name, "Private message channel", ChannelType::Pm).await?;
    Ok(ChannelRow {
        channel_id: id,
        name,
        description: "Private message channel".to_owned(),
        channel_type: "pm".to_owned(),
    })
}

#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub message_id: i64,
    pub channel_id: i64,
    pub sender_id: i64,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[sqlx(rename = "type")]
    pub message_type: String,
    pub uuid: Option<String>,
}

pub async fn message_exists(pool: &MySqlPool, message_id: i64) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_messages WHERE message_id = ?")
        .bind(message_id)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

pub async fn max_message_id(pool: &MySqlPool) -> Result<i64, sqlx::Error> {
    let max: Option<i64> = sqlx::query_scalar("SELECT MAX(message_id) FROM chat_messages")
        .fetch_one(pool)
        .await?;
    Ok(max.unwrap_or(0))
}

const MESSAGE_COLUMNS: &str = "message_id, channel_id, sender_id, content, timestamp, type, uuid";

/// Messages older than `before`, newest first.
pub async fn messages_before(
    pool: &MySqlPool,
    channel_id: i64,
    before: Option<i64>,
    limit: i64,
) -> Result<Vec<MessageRow>, sqlx::Error> {
    match before {
        Some(before) => {
            sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM chat_messages \
                 WHERE channel_id = ? AND message_id < ? ORDER BY message_id DESC LIMIT ?"
            ))
            .bind(channel_id)
            .bind(before)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM chat_messages \
                 WHERE channel_id = ? ORDER BY message_id DESC LIMIT ?"
            ))
            .bind(channel_id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
}

/// Messages newer than `since`, oldest first.
pub async fn messages_since(
    pool: &MySqlPool,
    channel_id: i64,
    since: i64,
    limit: i64,
) -> Result<Vec<MessageRow>, sqlx::Error> {
    sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM chat_messages \
         WHERE channel_id = ? AND message_id > ? ORDER BY message_id ASC LIMIT ?"
    ))
    .bind(channel_id)
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_notification(
    pool: &MySqlPool,
    name: &str,
    category: &str,
    object_type: &str,
    object_id: i64,
    source_user_id: Option<i64>,
    details: &serde_json::Value,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO notifications \
         (name, category, object_type, object_id, source_user_id, details, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(name)
    .bind(category)
    .bind(object_type)
    .bind(object_id)
    .bind(source_user_id)
    .bind(sqlx::types::Json(details))
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.last_insert_id() as i64)
}

pub async fn insert_user_notification(
    pool: &MySqlPool,
    notification_id: i64,
    user_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO user_notifications (notification_id, user_id, is_read) VALUES (?, ?, FALSE)")
        .bind(notification_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{pm_channel_name, ChannelType};

    #[test]
    fn pm_channels_are_canonical() {
        assert_eq!(pm_channel_name(7, 3), "pm_3_7");
        assert_eq!(pm_channel_name(3, 7), "pm_3_7");
    }

    #[test]
    fn channel_types_round_trip() {
        for kind in [
            ChannelType::Public,
            ChannelType::Private,
            ChannelType::Multiplayer,
            ChannelType::Pm,
            ChannelType::Team,
            ChannelType::Announce,
            ChannelType::Group,
            ChannelType::System,
            ChannelType::Spectator,
            ChannelType::Temporary,
        ] {
            assert_eq!(ChannelType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ChannelType::parse("irc"), None);
    }
}
