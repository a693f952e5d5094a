// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::app::App;
use crate::db::chat::{self, ChannelRow, ChannelType, MessageRow};
use crate::db::users::{self, UserRow};
use crate::error::ApiError;
use crate::pipeline::MessageStore;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

/// The default public channel every connecting user lands in.
pub const DEFAULT_CHANNEL_ID: i64 = 1;

/// One event frame on the notification WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct ChatEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ChatEvent {
    pub fn new(event: &str, data: serde_json::Value) -> Self {
        Self {
            event: event.to_owned(),
            data: Some(data),
        }
    }
}

/// Channel membership and live delivery over the notification WebSocket.
/// Membership is process-local; cross-instance room joins arrive via
/// Redis pub/sub.
pub struct ChatServer {
    pub app: Arc<App>,
    pub store: Arc<MessageStore>,
    clients: Mutex<HashMap<i64, UnboundedSender<ChatEvent>>>,
    channels: Mutex<HashMap<i64, Vec<i64>>>,
}

impl ChatServer {
    pub fn new(app: Arc<App>, store: Arc<MessageStore>) -> Self {
        Self {
            app,
            store,
            clients: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn connect(&self, user_id: i64, sender: UnboundedSender<ChatEvent>) {
        self.clients.lock().unwrap().insert(user_id, sender);
    }

    pub fn disconnect(&self, user_id: i64) {
        self.clients.lock().unwrap().remove(&user_id);
        let mut channels = self.channels.lock().unwrap();
        for members in channels.values_mut() {
            members.retain(|&member| member != user_id);
        }
        channels.retain(|_, members| !members.is_empty());
    }

    pub fn is_member(&self, channel_id: i64, user_id: i64) -> bool {
        self.channels
            .lock()
            .unwrap()
            .get(&channel_id)
            .is_some_and(|members| members.contains(&user_id))
    }

    pub fn members(&self, channel_id: i64) -> Vec<i64> {
        self.channels
            .lock()
            .unwrap()
            .get(&channel_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn send_event(&self, user_id: i64, event: ChatEvent) {
        if let Some(sender) = self.clients.lock().unwrap().get(&user_id) {
            let _ = sender.send(event);
        }
    }

    pub fn broadcast(&self, channel_id: i64, event: ChatEvent) {
        for user_id in self.members(channel_id) {
            self.send_event(user_id, event.clone());
        }
    }

    async fn channel_resp(
        &self,
        channel: &ChannelRow,
        user_id: i64,
    ) -> Result<serde_json::Value, ApiError> {
        let last_message_id = self.store.last_message_id(channel.channel_id).await?;
        let last_read_id = self.store.last_read(channel.channel_id, user_id).await?;
        let mut resp = json!({
            "channel_id": channel.channel_id,
            "name": channel.name,
            "description": channel.description,
            "type": channel.channel_type,
            "moderated": false,
            "last_message_id": last_message_id,
            "last_read_id": last_read_id,
        });
        // Public channels never expose their user list.
        if channel.kind() != ChannelType::Public {
            resp["users"] = json!(self.members(channel.channel_id));
        }
        Ok(resp)
    }

    pub async fn join_channel(
        &self,
        user_id: i64,
        channel: &ChannelRow,
    ) -> Result<serde_json::Value, ApiError> {
        {
            let mut channels = self.channels.lock().unwrap();
            let members = channels.entry(channel.channel_id).or_default();
            if !members.contains(&user_id) {
                members.push(user_id);
            }
        }
        let resp = self.channel_resp(channel, user_id).await?;
        self.send_event(user_id, ChatEvent::new("chat.channel.join", resp.clone()));
        Ok(resp)
    }

    pub async fn leave_channel(&self, user_id: i64, channel: &ChannelRow) -> Result<(), ApiError> {
        {
            let mut channels = self.channels.lock().unwrap();
            if let Some(members) = channels.get_mut(&channel.channel_id) {
                members.retain(|&member| member != user_id);
                if members.is_empty() {
                    channels.remove(&channel.channel_id);
                }
            }
        }
        let resp = self.channel_resp(channel, user_id).await?;
        self.send_event(user_id, ChatEvent::new("chat.channel.part", resp));
        Ok(())
    }

    /// Driven by the `chat:room:joined` pub/sub notice from the
    /// multiplayer hub.
    pub async fn join_room_channel(&self, channel_id: i64, user_id: i64) {
        let channel = match chat::channel(&self.app.db, channel_id).await {
            Ok(Some(channel)) => channel,
            Ok(None) => return,
            Err(e) => {
                log::error!("failed to load room channel {channel_id}: {e}");
                return;
            }
        };
        if let Err(e) = self.join_channel(user_id, &channel).await {
            log::error!("failed to join {user_id} to room channel {channel_id}: {e}");
        }
    }

    pub async fn leave_room_channel(&self, channel_id: i64, user_id: i64) {
        let channel = match chat::channel(&self.app.db, channel_id).await {
            Ok(Some(channel)) => channel,
            _ => return,
        };
        if let Err(e) = self.leave_channel(user_id, &channel).await {
            log::error!("failed to part {user_id} from room channel {channel_id}: {e}");
        }
    }

    pub fn message_resp(message: &MessageRow, sender: &UserRow) -> serde_json::Value {
        json!({
            "message_id": message.message_id,
            "channel_id": message.channel_id,
            "sender_id": message.sender_id,
            "content": message.content,
            "timestamp": message.timestamp.to_rfc3339(),
            "is_action": message.message_type == "action",
            "uuid": message.uuid,
            "sender": user_resp(sender),
        })
    }

    /// Pushes a freshly stored message to the channel's live members.
    pub fn deliver_message(&self, message: &MessageRow, sender: &UserRow) {
        self.broadcast(
            message.channel_id,
            ChatEvent::new(
                "chat.message.new",
                json!({
                    "messages": [Self::message_resp(message, sender)],
                    "users": [user_resp(sender)],
                }),
            ),
        );
    }

    /// Inserts a notification plus its per-receiver rows and pushes a
    /// `new` event to each receiver that is online.
    #[allow(clippy::too_many_arguments)]
    pub async fn deliver_notification(
        &self,
        name: &str,
        category: &str,
        object_type: &str,
        object_id: i64,
        source_user_id: Option<i64>,
        details: serde_json::Value,
        receivers: &[i64],
    ) -> Result<(), ApiError> {
        let id = chat::insert_notification(
            &self.app.db,
            name,
            category,
            object_type,
            object_id,
            source_user_id,
            &details,
        )
        .await?;
        let event = ChatEvent::new(
            "new",
            json!({
                "id": id,
                "name": name,
                "category": category,
                "object_type": object_type,
                "object_id": object_id,
                "source_user_id": source_user_id,
                "details": details,
                "is_read": false,
                "created_at": chrono::Utc::now().to_rfc3339(),
            }),
        );
        for &receiver in receivers {
            chat::insert_user_notification(&self.app.db, id, receiver).await?;
            self.send_event(receiver, event.clone());
        }
        Ok(())
    }

    /// A `chat:notification` pub/sub payload from another process.
    pub async fn relay_notification(&self, payload: &str) {
        let Ok(detail) = serde_json::from_str::<serde_json::Value>(payload) else {
            log::warn!("undecodable chat:notification payload");
            return;
        };
        let receivers: Vec<i64> = detail
            .get("receivers")
            .and_then(|r| serde_json::from_value(r.clone()).ok())
            .unwrap_or_default();
        let event = ChatEvent::new("new", detail);
        for receiver in receivers {
            self.send_event(receiver, event.clone());
        }
    }
}

pub fn user_resp(user: &UserRow) -> serde_json::Value {
    json!({
        "id": user.id,
        "username": user.username,
        "country_code": user.country_code,
        "is_bot": user.is_bot,
    })
}

/// Resolves the receivers of a channel-message notification: every live
/// member except the sender.
pub fn channel_message_receivers(server: &ChatServer, channel_id: i64, sender_id: i64) -> Vec<i64> {
    server
        .members(channel_id)
        .into_iter()
        .filter(|&member| member != sender_id)
        .collect()
}

/// Loads a user or fails the request; chat paths always need the sender
/// row for the response envelope.
pub async fn require_user(app: &App, user_id: i64) -> Result<UserRow, ApiError> {
    users::by_id(&app.db, user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("user not found".to_owned()))
}
