// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Write-first read-latest message storage: messages become visible
//! instantly via Redis, persist to the database in batches, and reads
//! transparently merge both sources.

use crate::app::App;
use crate::db::chat::{self, MessageRow};
use crate::error::ApiError;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::{self, AsyncCommands};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const MESSAGE_TTL_SECS: i64 = 7 * 24 * 3600;
const CHANNEL_RING_SIZE: isize = 1000;
const BATCH_SIZE: usize = 100;
const BATCH_IDLE: Duration = Duration::from_secs(5);

const COUNTER_KEY: &str = "global_message_id_counter";
const PENDING_KEY: &str = "pending_messages";

fn message_key(channel_id: i64, message_id: i64) -> String {
    format!("msg:{channel_id}:{message_id}")
}

fn ring_key(channel_id: i64) -> String {
    format!("channel:{channel_id}:messages")
}

fn last_msg_key(channel_id: i64) -> String {
    format!("chat:{channel_id}:last_msg")
}

pub struct MessageStore {
    app: Arc<App>,
}

impl MessageStore {
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }

    /// Seeds the id counter past anything durable storage has handed out
    /// and drops ring keys that have rotted into the wrong type.
    pub async fn startup(&self) -> Result<(), ApiError> {
        let db_max = chat::max_message_id(&self.app.db).await?;
        let mut conn = self.app.redis().await?;
        let counter: Option<i64> = conn.get(COUNTER_KEY).await?;
        let seed = db_max.max(counter.unwrap_or(0));
        conn.set::<_, _, ()>(COUNTER_KEY, seed).await?;
        log::info!("message id counter seeded to {seed}");

        let keys: Vec<String> = conn.keys("channel:*:messages").await?;
        for key in keys {
            let key_type: String = redis::cmd("TYPE")
                .arg(&key)
                .query_async(&mut *conn)
                .await?;
            if key_type != "zset" && key_type != "none" {
                log::warn!("dropping ring key {key} with wrong type {key_type}");
                conn.del::<_, ()>(&key).await?;
            }
        }
        Ok(())
    }

    /// Assigns the next globally monotonic message id.
    async fn next_message_id(
        &self,
        conn: &mut deadpool_redis::Connection,
        channel_id: i64,
    ) -> Result<i64, ApiError> {
        let id: i64 = conn.incr(COUNTER_KEY, 1).await?;
        conn.set::<_, _, ()>(last_msg_key(channel_id), id).await?;
        Ok(id)
    }

    /// Stores the message in Redis and, for persistable channels, queues
    /// it for the batch persister. Returns the stored row.
    pub async fn send_message(
        &self,
        channel_id: i64,
        sender_id: i64,
        content: &str,
        is_action: bool,
        uuid: Option<&str>,
        is_multiplayer: bool,
    ) -> Result<MessageRow, ApiError> {
        let mut conn = self.app.redis().await?;
        let message_id = self.next_message_id(&mut conn, channel_id).await?;
        let message = MessageRow {
            message_id,
            channel_id,
            sender_id,
            content: content.to_owned(),
            timestamp: Utc::now(),
            message_type: if is_action { "action" } else { "plain" }.to_owned(),
            uuid: uuid.map(str::to_owned),
        };

        let key = message_key(channel_id, message_id);
        let fields = [
            ("message_id", message_id.to_string()),
            ("channel_id", channel_id.to_string()),
            ("sender_id", sender_id.to_string()),
            ("content", message.content.clone()),
            ("timestamp", message.timestamp.to_rfc3339()),
            ("type", message.message_type.clone()),
            ("uuid", message.uuid.clone().unwrap_or_default()),
            ("status", "cached".to_owned()),
            ("is_multiplayer", if is_multiplayer { "1" } else { "0" }.to_owned()),
        ];
        conn.hset_multiple::<_, _, _, ()>(&key, &fields).await?;
        conn.expire::<_, ()>(&key, MESSAGE_TTL_SECS).await?;

        let ring = ring_key(channel_id);
        let ring_type: String = redis::cmd("TYPE").arg(&ring).query_async(&mut *conn).await?;
        if ring_type != "zset" && ring_type != "none" {
            log::warn!("dropping ring key {ring} with wrong type {ring_type}");
            conn.del::<_, ()>(&ring).await?;
        }
        conn.zadd::<_, _, _, ()>(&ring, &key, message_id).await?;
        conn.zremrangebyrank::<_, ()>(&ring, 0, -(CHANNEL_RING_SIZE + 1))
            .await?;

        // Multiplayer messages are ephemeral: never queued, never copied
        // to durable storage.
        if !is_multiplayer {
            conn.lpush::<_, _, ()>(PENDING_KEY, format!("{channel_id}:{message_id}"))
                .await?;
        }
        Ok(message)
    }

    async fn fetch_hashes(
        &self,
        conn: &mut deadpool_redis::Connection,
        keys: Vec<String>,
    ) -> Result<Vec<MessageRow>, ApiError> {
        let mut messages = Vec::with_capacity(keys.len());
        for key in keys {
            let hash: HashMap<String, String> = conn.hgetall(&key).await?;
            if let Some(message) = parse_hash(&hash) {
                messages.push(message);
            }
        }
        messages.sort_by_key(|m| m.message_id);
        Ok(messages)
    }

    /// Reads a channel's messages, ascending by id. Redis serves the hot
    /// tail; durable storage fills in whatever has already rotated out.
    pub async fn get_messages(
        &self,
        channel_id: i64,
        limit: usize,
        since: Option<i64>,
        until: Option<i64>,
        is_multiplayer: bool,
    ) -> Result<Vec<MessageRow>, ApiError> {
        let mut conn = self.app.redis().await?;
        let ring = ring_key(channel_id);
        let limit = limit.clamp(1, 200);

        let mut messages = match (since, until) {
            (Some(since), _) if since > 0 => {
                let keys: Vec<String> = conn
                    .zrangebyscore_limit(&ring, since + 1, "+inf", 0, limit as isize)
                    .await?;
                self.fetch_hashes(&mut conn, keys).await?
            }
            (_, Some(until)) => {
                let keys: Vec<String> = conn
                    .zrevrangebyscore_limit(&ring, until - 1, "-inf", 0, limit as isize)
                    .await?;
                self.fetch_hashes(&mut conn, keys).await?
            }
            _ => {
                let keys: Vec<String> = conn.zrevrange(&ring, 0, limit as isize - 1).await?;
                self.fetch_hashes(&mut conn, keys).await?
            }
        };

        // Multiplayer channels live only in Redis; a durable fallback
        // would always come back empty.
        if is_multiplayer || messages.len() >= limit {
            return Ok(truncate_window(messages, limit, since));
        }

        let needed = (limit - messages.len()) as i64;
        match (since, until) {
            (Some(since), _) if since > 0 => {
                if messages.is_empty() {
                    let from_db = chat::messages_since(&self.app.db, channel_id, since, needed).await?;
                    messages = merge(from_db, messages);
                }
            }
            (_, Some(until)) => {
                let before = messages.first().map(|m| m.message_id).unwrap_or(until);
                let from_db =
                    chat::messages_before(&self.app.db, channel_id, Some(before), needed).await?;
                messages = merge(from_db, messages);
            }
            _ => {
                let before = messages.first().map(|m| m.message_id);
                let from_db = chat::messages_before(&self.app.db, channel_id, before, needed).await?;
                messages = merge(from_db, messages);
            }
        }
        Ok(truncate_window(messages, limit, since))
    }

    /// The background persister: pops pending keys, writes each batch in
    /// one transaction, and stamps the Redis hashes as persisted.
    pub async fn run_persister(self: Arc<Self>) {
        log::info!("message persister started");
        loop {
            match self.persist_batch().await {
                Ok(0) => tokio::time::sleep(BATCH_IDLE).await,
                Ok(n) => log::debug!("persisted {n} messages"),
                Err(e) => {
                    log::error!("message persistence failed: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn persist_batch(&self) -> Result<usize, ApiError> {
        let mut conn = self.app.redis().await?;
        let mut keys = Vec::new();
        while keys.len() < BATCH_SIZE {
            let popped: Option<(String, String)> = conn.brpop(PENDING_KEY, 1.0).await?;
            match popped {
                Some((_, value)) => keys.push(value),
                None => break,
            }
        }
        if keys.is_empty() {
            return Ok(0);
        }

        let mut tx = self.app.db.begin().await.map_err(ApiError::from)?;
        let mut persisted = Vec::new();
        for key in &keys {
            let Some((channel_id, message_id)) = key
                .split_once(':')
                .and_then(|(c, m)| Some((c.parse::<i64>().ok()?, m.parse::<i64>().ok()?)))
            else {
                log::warn!("malformed pending message key {key}");
                continue;
            };
            let hash: HashMap<String, String> =
                conn.hgetall(message_key(channel_id, message_id)).await?;
            let Some(message) = parse_hash(&hash) else {
                // Expired before persistence caught up.
                continue;
            };
            if hash.get("is_multiplayer").map(String::as_str) == Some("1") {
                continue;
            }
            if chat::message_exists(&self.app.db, message_id).await? {
                continue;
            }
            sqlx::query(
                "INSERT INTO chat_messages \
                 (message_id, channel_id, sender_id, content, timestamp, type, uuid) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(message.message_id)
            .bind(message.channel_id)
            .bind(message.sender_id)
            .bind(&message.content)
            .bind(message.timestamp)
            .bind(&message.message_type)
            .bind(&message.uuid)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::from)?;
            persisted.push((channel_id, message_id));
        }
        tx.commit().await.map_err(ApiError::from)?;

        for (channel_id, message_id) in &persisted {
            conn.hset::<_, _, _, ()>(message_key(*channel_id, *message_id), "status", "persisted")
                .await?;
        }
        Ok(persisted.len())
    }

    /// Drains the pending queue; used during shutdown.
    pub async fn flush(&self) -> Result<(), ApiError> {
        loop {
            let pending: i64 = {
                let mut conn = self.app.redis().await?;
                conn.llen(PENDING_KEY).await?
            };
            if pending == 0 {
                return Ok(());
            }
            self.persist_batch().await?;
        }
    }

    pub async fn mark_channel_read(
        &self,
        channel_id: i64,
        user_id: i64,
        message_id: i64,
    ) -> Result<(), ApiError> {
        let mut conn = self.app.redis().await?;
        conn.set::<_, _, ()>(format!("chat:{channel_id}:last_read:{user_id}"), message_id)
            .await?;
        Ok(())
    }

    pub async fn last_read(&self, channel_id: i64, user_id: i64) -> Result<i64, ApiError> {
        let mut conn = self.app.redis().await?;
        let id: Option<i64> = conn
            .get(format!("chat:{channel_id}:last_read:{user_id}"))
            .await?;
        Ok(id.unwrap_or(0))
    }

    pub async fn last_message_id(&self, channel_id: i64) -> Result<i64, ApiError> {
        let mut conn = self.app.redis().await?;
        let id: Option<i64> = conn.get(last_msg_key(channel_id)).await?;
        Ok(id.unwrap_or(0))
    }
}

fn parse_hash(hash: &HashMap<String, String>) -> Option<MessageRow> {
    Some(MessageRow {
        message_id: hash.get("message_id")?.parse().ok()?,
        channel_id: hash.get("channel_id")?.parse().ok()?,
        sender_id: hash.get("sender_id")?.parse().ok()?,
        content: hash.get("content")?.clone(),
        timestamp: hash
            .get("timestamp")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))?,
        message_type: hash.get("type")?.clone(),
        uuid: hash.get("uuid").filter(|u| !u.is_empty()).cloned(),
    })
}

/// Merges DB history below the Redis window, deduplicating on id and
/// keeping ascending order.
fn merge(mut from_db: Vec<MessageRow>, from_redis: Vec<MessageRow>) -> Vec<MessageRow> {
    from_db.sort_by_key(|m| m.message_id);
    let mut merged = from_db;
    for message in from_redis {
        if merged.last().map_or(true, |m| m.message_id < message.message_id) {
            merged.push(message);
        }
    }
    merged
}

/// Callers asking for "the latest N" want the tail of the window; callers
/// paging forward from `since` want the head.
fn truncate_window(messages: Vec<MessageRow>, limit: usize, since: Option<i64>) -> Vec<MessageRow> {
    if messages.len() <= limit {
        return messages;
    }
    if since.is_some_and(|s| s > 0) {
        messages.into_iter().take(limit).collect()
    } else {
        let skip = messages.len() - limit;
        messages.into_iter().skip(skip).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: i64) -> MessageRow {
        MessageRow {
            message_id: id,
            channel_id: 42,
            sender_id: 1,
            content: format!("message {id}"),
            timestamp: Utc::now(),
            message_type: "plain".to_owned(),
            uuid: None,
        }
    }

    #[test]
    fn merge_deduplicates_and_orders() {
        let from_db = vec![message(3), message(1), message(2)];
        let from_redis = vec![message(3), message(4)];
        let merged = merge(from_db, from_redis);
        let ids: Vec<i64> = merged.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn window_truncation() {
        let messages: Vec<MessageRow> = (1..=10).map(message).collect();
        // Latest-N keeps the tail.
        let tail = truncate_window(messages.clone(), 3, None);
        assert_eq!(
            tail.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            vec![8, 9, 10]
        );
        // Paging forward keeps the head.
        let head = truncate_window(messages, 3, Some(5));
        assert_eq!(
            head.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn hash_round_trip() {
        let mut hash = HashMap::new();
        hash.insert("message_id".to_owned(), "7".to_owned());
        hash.insert("channel_id".to_owned(), "42".to_owned());
        hash.insert("sender_id".to_owned(), "1001".to_owned());
        hash.insert("content".to_owned(), "hello".to_owned());
        hash.insert("timestamp".to_owned(), Utc::now().to_rfc3339());
        hash.insert("type".to_owned(), "plain".to_owned());
        hash.insert("uuid".to_owned(), String::new());
        let parsed = parse_hash(&hash).unwrap();
        assert_eq!(parsed.message_id, 7);
        assert_eq!(parsed.channel_id, 42);
        assert!(parsed.uuid.is_none());

        hash.remove("timestamp");
        assert!(parse_hash(&hash).is_none());
    }
}
