// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The metadata hub: propagates each user's presence (status + activity)
//! to a global watcher group and to per-friend groups, and relays
//! score-processed events to room watchers.

use crate::app::App;
use crate::db::{scores, users};
use crate::error::InvokeError;
use crate::hub::{arg, Hub, HubClient, HubCore};
use async_trait::async_trait;
use cadence_common::metadata::{
    MultiplayerRoomScoreSetEvent, OnlineStatus, UserActivity, UserPresence,
};
use cadence_common::protocol::{WireIn, WireOut};
use cadence_common::{PlaylistItemId, RoomId, ScoreId, UserId};
use deadpool_redis::redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const ONLINE_PRESENCE_WATCHERS_GROUP: &str = "metadata:online-presence-watchers";

fn friend_watchers_group(user_id: UserId) -> String {
    format!("metadata:friend-presence-watchers:{user_id}")
}

fn room_watchers_group(room_id: RoomId) -> String {
    format!("metadata:room-watchers:{room_id}")
}

pub struct MetadataHub {
    core: HubCore,
    app: Arc<App>,
    states: Mutex<HashMap<UserId, UserPresence>>,
}

impl MetadataHub {
    pub fn new(app: Arc<App>) -> Self {
        let negotiate_timeout = app.options.negotiate_timeout();
        Self {
            core: HubCore::new("metadata", negotiate_timeout),
            app,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn presence(&self, user_id: UserId) -> Option<UserPresence> {
        self.states.lock().unwrap().get(&user_id).cloned()
    }

    /// Pushes the (possibly cleared) presence to the global group and the
    /// user's friend group. Non-pushable states broadcast null so peers
    /// drop the entry.
    fn broadcast_presence(&self, user_id: UserId, presence: Option<&UserPresence>) {
        let payload = presence.filter(|p| p.pushable());
        let arguments = vec![WireOut::of(&user_id), WireOut::of(&payload.cloned())];
        self.core.broadcast_group(
            ONLINE_PRESENCE_WATCHERS_GROUP,
            "UserPresenceUpdated",
            arguments.clone(),
        );
        self.core.broadcast_group(
            &friend_watchers_group(user_id),
            "FriendPresenceUpdated",
            arguments,
        );
    }

    async fn update_status(&self, client: &Arc<HubClient>, status: i64) -> Result<(), InvokeError> {
        let status = OnlineStatus::from_ordinal(status.max(0) as u64)
            .ok_or_else(|| InvokeError::new("unknown status"))?;
        let presence = {
            let mut states = self.states.lock().unwrap();
            let presence = states.entry(client.user_id).or_default();
            if presence.status == Some(status) {
                return Ok(());
            }
            presence.status = Some(status);
            presence.clone()
        };
        self.broadcast_presence(client.user_id, Some(&presence));
        client.invoke_noblock(
            "UserPresenceUpdated",
            vec![
                WireOut::of(&client.user_id),
                WireOut::of(&Some(presence.clone()).filter(|p| p.pushable())),
            ],
        );
        Ok(())
    }

    async fn update_activity(
        &self,
        client: &Arc<HubClient>,
        activity: Option<UserActivity>,
    ) -> Result<(), InvokeError> {
        let presence = {
            let mut states = self.states.lock().unwrap();
            let presence = states.entry(client.user_id).or_default();
            presence.activity = activity;
            presence.clone()
        };
        self.broadcast_presence(client.user_id, Some(&presence));
        client.invoke_noblock(
            "UserPresenceUpdated",
            vec![
                WireOut::of(&client.user_id),
                WireOut::of(&Some(presence.clone()).filter(|p| p.pushable())),
            ],
        );
        Ok(())
    }

    fn begin_watching_presence(&self, client: &Arc<HubClient>) {
        let pushable: Vec<(UserId, UserPresence)> = self
            .states
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, presence)| presence.pushable())
            .map(|(user_id, presence)| (*user_id, presence.clone()))
            .collect();
        for (user_id, presence) in pushable {
            client.invoke_noblock(
                "UserPresenceUpdated",
                vec![WireOut::of(&user_id), WireOut::of(&Some(presence))],
            );
        }
        self.core
            .add_to_group(ONLINE_PRESENCE_WATCHERS_GROUP, client.user_id);
    }

    /// Relays a processed score to watchers of its room, resolving the
    /// event detail from the committed score row.
    pub async fn on_score_processed(&self, score_id: ScoreId) {
        let score = match scores::score_by_id(&self.app.db, score_id.0).await {
            Ok(Some(score)) => score,
            Ok(None) => return,
            Err(e) => {
                log::error!("failed to load processed score {score_id}: {e}");
                return;
            }
        };
        let (Some(room_id), Some(playlist_item_id)) = (score.room_id, score.playlist_item_id)
        else {
            return;
        };
        if !score.passed {
            return;
        }
        let event = MultiplayerRoomScoreSetEvent {
            room_id: RoomId(room_id),
            playlist_item_id: PlaylistItemId(playlist_item_id),
            score_id,
            user_id: UserId(score.user_id),
            total_score: score.total_score,
            new_rank: None,
        };
        self.core.broadcast_group(
            &room_watchers_group(RoomId(room_id)),
            "MultiplayerRoomScoreSet",
            vec![WireOut::of(&event)],
        );
    }
}

#[async_trait]
impl Hub for MetadataHub {
    fn core(&self) -> &HubCore {
        &self.core
    }

    async fn on_connect(&self, client: &Arc<HubClient>) {
        self.states
            .lock()
            .unwrap()
            .entry(client.user_id)
            .or_default();

        // Join this client to each friend's watcher group, and nudge the
        // groups of friends who are already visible.
        match users::friends_of(&self.app.db, client.user_id.0).await {
            Ok(friends) => {
                for friend in friends {
                    let friend = UserId(friend);
                    self.core
                        .add_to_group(&friend_watchers_group(friend), client.user_id);
                    if let Some(presence) = self.presence(friend).filter(|p| p.pushable()) {
                        self.core.broadcast_group(
                            &friend_watchers_group(friend),
                            "FriendPresenceUpdated",
                            vec![WireOut::of(&friend), WireOut::of(&Some(presence))],
                        );
                    }
                }
            }
            Err(e) => log::error!("failed to load friends of {}: {e}", client.user_id),
        }

        if let Ok(mut redis) = self.app.redis().await {
            let _ = redis
                .set::<_, _, ()>(format!("metadata:online:{}", client.user_id), "")
                .await;
        }
        log::info!("[metadata] client {} connected", client.user_id);
    }

    async fn clean_state(&self, user_id: UserId) {
        let presence = self.states.lock().unwrap().remove(&user_id);
        if presence.is_some_and(|p| p.pushable()) {
            self.broadcast_presence(user_id, None);
        }
        if let Ok(mut redis) = self.app.redis().await {
            let _ = redis
                .del::<_, ()>(format!("metadata:online:{user_id}"))
                .await;
        }
        if let Err(e) = users::update_last_visit(&self.app.db, user_id.0).await {
            log::error!("failed to stamp last_visit for {user_id}: {e}");
        }
    }

    async fn dispatch(
        &self,
        client: &Arc<HubClient>,
        target: &str,
        args: &[WireIn],
    ) -> Result<Option<WireOut>, InvokeError> {
        match target {
            "UpdateStatus" => {
                self.update_status(client, arg(args, 0)?).await?;
            }
            "UpdateActivity" => {
                // A missing argument means "no activity".
                let activity = match args.first() {
                    Some(value) => value.parse::<Option<UserActivity>>()?,
                    None => None,
                };
                self.update_activity(client, activity).await?;
            }
            "BeginWatchingUserPresence" => {
                self.begin_watching_presence(client);
            }
            "EndWatchingUserPresence" => {
                self.core
                    .remove_from_group(ONLINE_PRESENCE_WATCHERS_GROUP, client.user_id);
            }
            "BeginWatchingMultiplayerRoom" => {
                let room_id: RoomId = arg(args, 0)?;
                self.core
                    .add_to_group(&room_watchers_group(room_id), client.user_id);
            }
            "EndWatchingMultiplayerRoom" => {
                let room_id: RoomId = arg(args, 0)?;
                self.core
                    .remove_from_group(&room_watchers_group(room_id), client.user_id);
            }
            other => {
                return Err(InvokeError::new(format!("Method '{other}' not found in hub")));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pushable_rules() {
        let mut presence = UserPresence::default();
        assert!(!presence.pushable());
        presence.status = Some(OnlineStatus::Offline);
        assert!(!presence.pushable());
        presence.status = Some(OnlineStatus::DoNotDisturb);
        assert!(presence.pushable());
        presence.status = Some(OnlineStatus::Online);
        assert!(presence.pushable());
    }
}
