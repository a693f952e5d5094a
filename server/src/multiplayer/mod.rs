// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The multiplayer hub: authoritative room lifecycle, playlist queue,
//! readiness and gameplay barriers, results reconciliation, host
//! management and invitations.

mod events;
mod match_type;
mod queue;
mod room;

pub use room::ServerRoom;

use crate::app::App;
use crate::db::chat::{self as chat_db, ChannelType};
use crate::db::rooms;
use crate::db::users::{self, RelationshipKind};
use crate::error::InvokeError;
use crate::hub::{arg, Hub, HubClient, HubCore};
use crate::spectator::SpectatorHub;
use async_trait::async_trait;
use cadence_common::multiplayer::{
    BeatmapAvailability, DownloadState, GameplayAbortReason, MatchRequest, MatchType,
    MultiplayerRoom, MultiplayerRoomSettings, MultiplayerRoomState, MultiplayerRoomUser,
    MultiplayerUserState,
};
use cadence_common::protocol::{WireIn, WireOut};
use cadence_common::spectator::{SpectatedUserState, SpectatorState};
use cadence_common::{BeatmapId, RoomId, RulesetId, UserId};
use deadpool_redis::redis::AsyncCommands;
use room::{CountdownContinuation, CountdownKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;

/// Clients stuck loading are forced into gameplay (or back to idle) after
/// this long.
const GAMEPLAY_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

fn group(room_id: RoomId) -> String {
    format!("room:{room_id}")
}

pub struct MultiplayerHub {
    core: HubCore,
    pub(crate) app: Arc<App>,
    rooms: StdMutex<HashMap<RoomId, Arc<Mutex<ServerRoom>>>>,
    joined: StdMutex<HashMap<UserId, RoomId>>,
    spectator: OnceLock<Arc<SpectatorHub>>,
    self_ref: OnceLock<Weak<MultiplayerHub>>,
}

impl MultiplayerHub {
    pub fn new(app: Arc<App>) -> Self {
        let negotiate_timeout = app.options.negotiate_timeout();
        Self {
            core: HubCore::new("multiplayer", negotiate_timeout),
            app,
            rooms: StdMutex::new(HashMap::new()),
            joined: StdMutex::new(HashMap::new()),
            spectator: OnceLock::new(),
            self_ref: OnceLock::new(),
        }
    }

    /// Wires cross-hub references once all hubs exist.
    pub fn wire(self: &Arc<Self>, spectator: Arc<SpectatorHub>) {
        let _ = self.spectator.set(spectator);
        let _ = self.self_ref.set(Arc::downgrade(self));
    }

    pub(crate) fn clone_handle(&self) -> Arc<Self> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("multiplayer hub used before wiring")
    }

    pub(crate) fn room_by_id(&self, room_id: RoomId) -> Option<Arc<Mutex<ServerRoom>>> {
        self.rooms.lock().unwrap().get(&room_id).cloned()
    }

    pub(crate) fn room_broadcast(&self, room_id: RoomId, target: &str, arguments: Vec<WireOut>) {
        self.core.broadcast_group(&group(room_id), target, arguments);
    }

    fn joined_room(&self, user_id: UserId) -> Option<RoomId> {
        self.joined.lock().unwrap().get(&user_id).copied()
    }

    fn ensure_in_room(&self, user_id: UserId) -> Result<Arc<Mutex<ServerRoom>>, InvokeError> {
        let room_id = self
            .joined_room(user_id)
            .ok_or_else(|| InvokeError::new("You are not in a room"))?;
        self.room_by_id(room_id)
            .ok_or_else(|| InvokeError::new("Room does not exist"))
    }

    fn ensure_host(&self, room: &ServerRoom, user_id: UserId) -> Result<(), InvokeError> {
        if !room.is_host(user_id) {
            return Err(InvokeError::new("You are not the host of this room"));
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) {
        match self.app.redis().await {
            Ok(mut conn) => {
                if let Err(e) = conn.publish::<_, _, ()>(channel, payload).await {
                    log::error!("failed to publish on {channel}: {e}");
                }
            }
            Err(e) => log::error!("redis unavailable for publish on {channel}: {e}"),
        }
    }

    // ---- room creation and membership -------------------------------

    async fn create_room(
        &self,
        client: &Arc<HubClient>,
        mut room: MultiplayerRoom,
    ) -> Result<MultiplayerRoom, InvokeError> {
        if self.joined_room(client.user_id).is_some() {
            return Err(InvokeError::new("You are already in a room"));
        }
        let mut first_item = room
            .playlist
            .first()
            .cloned()
            .ok_or_else(|| InvokeError::new("Room has no playlist items"))?;
        let beatmap = rooms::beatmap(&self.app.db, first_item.beatmap_id.0)
            .await?
            .ok_or_else(|| InvokeError::new("Failed to fetch beatmap, please retry later"))?;

        let room_id =
            rooms::insert_room(&self.app.db, &room.settings, client.user_id, cadence_common::ChannelId(0))
                .await?;
        let channel_id = chat_db::create_channel(
            &self.app.db,
            &format!("room_{room_id}"),
            "Multiplayer room",
            ChannelType::Multiplayer,
        )
        .await?;
        rooms::set_room_channel(&self.app.db, room_id, channel_id).await?;

        first_item.owner_id = client.user_id;
        first_item.checksum = beatmap.checksum;
        first_item.expired = false;
        first_item.order = 0;
        first_item.id = rooms::insert_playlist_item(&self.app.db, room_id, &first_item).await?;

        room.room_id = room_id;
        room.channel_id = cadence_common::ChannelId(channel_id);
        room.state = MultiplayerRoomState::Open;
        room.users = Vec::new();
        room.host = None;
        room.active_countdowns = Vec::new();
        room.playlist = vec![first_item.clone()];
        room.settings.playlist_item_id = first_item.id;

        let match_type = room.settings.match_type;
        let mut server_room = ServerRoom::new(room);
        self.apply_match_type(&mut server_room, match_type);
        let password = server_room.room.settings.password.clone();
        self.rooms
            .lock()
            .unwrap()
            .insert(room_id, Arc::new(Mutex::new(server_room)));

        self.log_room_event(room_id, client.user_id, "room_created").await;
        log::info!("[multiplayer] {} created room {room_id}", client.user_id);
        self.join_room_with_password(client, room_id, &password).await
    }

    async fn join_room_with_password(
        &self,
        client: &Arc<HubClient>,
        room_id: RoomId,
        password: &str,
    ) -> Result<MultiplayerRoom, InvokeError> {
        if self.joined_room(client.user_id).is_some() {
            return Err(InvokeError::new("You are already in a room"));
        }
        let room_lock = self
            .room_by_id(room_id)
            .ok_or_else(|| InvokeError::new("Room does not exist"))?;
        let mut room = room_lock.lock().await;
        if room.user(client.user_id).is_some() {
            return Err(InvokeError::new("You are already in this room"));
        }
        if room.room.settings.password != password {
            return Err(InvokeError::new("Incorrect password"));
        }

        let user = MultiplayerRoomUser::new(client.user_id);
        if room.room.host.is_none() {
            // First joiner after CreateRoom becomes host.
            room.room.host = Some(user.clone());
        }
        self.joined.lock().unwrap().insert(client.user_id, room_id);

        // Broadcast precedes group membership: the joiner learns about
        // themselves from the returned room snapshot, not the event.
        self.room_broadcast(room_id, "UserJoined", vec![WireOut::of(&user)]);
        room.room.users.push(user);
        self.core.add_to_group(&group(room_id), client.user_id);
        self.match_type_join(&mut room, client.user_id);

        self.send_room_state_to_new_user(client, &room).await;

        self.log_room_event(room_id, client.user_id, "player_joined").await;
        rooms::upsert_participation(&self.app.db, room_id, client.user_id).await?;
        rooms::adjust_participant_count(&self.app.db, room_id, 1).await?;
        self.publish(
            "chat:room:joined",
            format!("{}:{}", room.room.channel_id, client.user_id),
        )
        .await;

        log::info!("[multiplayer] {} joined room {room_id}", client.user_id);
        Ok(room.room.clone())
    }

    /// Removes the user from the room, transferring host or closing the
    /// room as needed. Ordering matters: host transfer is announced
    /// before the departure event.
    async fn make_user_leave(
        &self,
        room: &mut ServerRoom,
        user_id: UserId,
        kicked: bool,
    ) -> Result<(), InvokeError> {
        let room_id = room.id();
        let Some(index) = room.room.users.iter().position(|u| u.user_id == user_id) else {
            return Err(InvokeError::new("You are not in this room"));
        };
        let departed = room.room.users.remove(index);
        self.core.remove_from_group(&group(room_id), user_id);
        self.joined.lock().unwrap().remove(&user_id);

        self.publish(
            "chat:room:left",
            format!("{}:{}", room.room.channel_id, user_id),
        )
        .await;
        rooms::mark_participation_left(&self.app.db, room_id, user_id).await?;
        rooms::adjust_participant_count(&self.app.db, room_id, -1).await?;

        if room.room.users.is_empty() {
            self.end_room(room).await?;
            return Ok(());
        }

        self.update_room_state(room).await?;

        let was_host = room
            .room
            .host
            .as_ref()
            .is_some_and(|host| host.user_id == user_id);
        if was_host {
            // The oldest remaining joiner inherits the room.
            let next_host = room.room.users[0].clone();
            self.set_host(room, next_host).await?;
        }

        if kicked {
            if let Some(target) = self.core.client(user_id) {
                target.invoke_noblock("UserKicked", vec![WireOut::of(&departed)]);
            }
            self.room_broadcast(room_id, "UserKicked", vec![WireOut::of(&departed)]);
        } else {
            self.room_broadcast(room_id, "UserLeft", vec![WireOut::of(&departed)]);
        }
        Ok(())
    }

    /// The last user left; tear the room down.
    async fn end_room(&self, room: &mut ServerRoom) -> Result<(), InvokeError> {
        let room_id = room.id();
        room.stop_all_countdowns();
        room.room.state = MultiplayerRoomState::Closed;
        rooms::update_room_settings(
            &self.app.db,
            room_id,
            &room.room.settings,
            room.room.host.as_ref().map(|h| h.user_id),
        )
        .await?;
        rooms::close_room(&self.app.db, room_id).await?;
        if let Some(host) = &room.room.host {
            self.log_room_event(room_id, host.user_id, "room_disbanded").await;
        }
        self.rooms.lock().unwrap().remove(&room_id);
        log::info!("[multiplayer] room {room_id} ended");
        Ok(())
    }

    async fn set_host(
        &self,
        room: &mut ServerRoom,
        user: MultiplayerRoomUser,
    ) -> Result<(), InvokeError> {
        let user_id = user.user_id;
        room.room.host = Some(user);
        rooms::update_room_settings(
            &self.app.db,
            room.id(),
            &room.room.settings,
            Some(user_id),
        )
        .await?;
        self.room_broadcast(room.id(), "HostChanged", vec![WireOut::of(&user_id)]);
        Ok(())
    }

    // ---- user state machine ------------------------------------------

    fn validate_state_change(
        room: &ServerRoom,
        old: MultiplayerUserState,
        new: MultiplayerUserState,
    ) -> Result<(), InvokeError> {
        use MultiplayerUserState::*;
        let bad = || InvokeError::new(format!("Cannot change state from {old:?} to {new:?}"));
        match new {
            Idle => {
                if old.is_playing() {
                    return Err(InvokeError::new(
                        "Cannot return to idle without aborting gameplay.",
                    ));
                }
            }
            Ready => {
                if old != Idle {
                    return Err(bad());
                }
                if room.current_item().map_or(true, |item| item.expired) {
                    return Err(InvokeError::new(
                        "Cannot ready up while all items have been played.",
                    ));
                }
            }
            WaitingForLoad | Playing => {
                return Err(InvokeError::new("State is managed by the server."));
            }
            Loaded => {
                if old != WaitingForLoad {
                    return Err(bad());
                }
            }
            ReadyForGameplay => {
                if old != Loaded {
                    return Err(bad());
                }
            }
            FinishedPlay => {
                if old != Playing {
                    return Err(bad());
                }
            }
            Results => {
                if !matches!(old, FinishedPlay | Spectating) {
                    return Err(bad());
                }
            }
            Spectating => {
                let from_lobby = matches!(old, Idle | Ready | Results);
                let from_gameplay = old.is_playing()
                    && matches!(
                        room.room.state,
                        MultiplayerRoomState::WaitingForLoad | MultiplayerRoomState::Playing
                    );
                if !from_lobby && !from_gameplay {
                    return Err(bad());
                }
            }
        }
        Ok(())
    }

    fn change_user_state(
        &self,
        room: &mut ServerRoom,
        user_id: UserId,
        state: MultiplayerUserState,
    ) {
        let room_id = room.room.room_id;
        if let Some(user) = room.user_mut(user_id) {
            log::info!(
                "[multiplayer] {user_id} state {:?} -> {state:?} in room {}",
                user.state,
                room_id
            );
            user.state = state;
        }
        self.room_broadcast(
            room.id(),
            "UserStateChanged",
            vec![WireOut::of(&user_id), WireOut::of(&state)],
        );
    }

    async fn change_state(
        &self,
        client: &Arc<HubClient>,
        state: MultiplayerUserState,
    ) -> Result<(), InvokeError> {
        let room_lock = self.ensure_in_room(client.user_id)?;
        let mut room = room_lock.lock().await;
        let user = room
            .user(client.user_id)
            .ok_or_else(|| InvokeError::new("You are not in this room"))?;
        let old = user.state;
        if old == state {
            return Ok(());
        }
        // Late or duplicate client transitions during gameplay unwinding
        // are dropped rather than rejected.
        match state {
            MultiplayerUserState::Idle if old.is_playing() => return Ok(()),
            MultiplayerUserState::Loaded | MultiplayerUserState::ReadyForGameplay
                if !old.is_playing() =>
            {
                return Ok(())
            }
            _ => {}
        }
        Self::validate_state_change(&room, old, state)?;
        self.change_user_state(&mut room, client.user_id, state);

        if state == MultiplayerUserState::Spectating {
            self.sync_spectator_into_gameplay(client, &room).await;
        }

        self.update_room_state(&mut room).await
    }

    /// A user flipping to spectator mid-game needs the load prompt and a
    /// snapshot of everyone's progress.
    async fn sync_spectator_into_gameplay(&self, client: &Arc<HubClient>, room: &ServerRoom) {
        if matches!(
            room.room.state,
            MultiplayerRoomState::WaitingForLoad | MultiplayerRoomState::Playing
        ) {
            client.invoke_noblock("LoadRequested", Vec::new());
        }
        client.invoke_noblock(
            "RoomStateChanged",
            vec![WireOut::of(&room.room.state)],
        );
        for user in &room.room.users {
            if user.state.is_playing() || user.state == MultiplayerUserState::Results {
                client.invoke_noblock(
                    "UserStateChanged",
                    vec![WireOut::of(&user.user_id), WireOut::of(&user.state)],
                );
            }
        }
        if room.room.state == MultiplayerRoomState::Open
            && room
                .room
                .users
                .iter()
                .any(|u| u.state == MultiplayerUserState::Results)
        {
            client.invoke_noblock("ResultsReady", Vec::new());
        }
    }

    // ---- availability, mods, style -----------------------------------

    fn change_beatmap_availability(
        &self,
        room: &mut ServerRoom,
        user_id: UserId,
        availability: BeatmapAvailability,
    ) {
        let changed = match room.user_mut(user_id) {
            Some(user) if user.availability != availability => {
                user.availability = availability.clone();
                true
            }
            _ => false,
        };
        if changed {
            self.room_broadcast(
                room.id(),
                "UserBeatmapAvailabilityChanged",
                vec![WireOut::of(&user_id), WireOut::of(&availability)],
            );
        }
    }

    fn change_user_mods(
        &self,
        room: &mut ServerRoom,
        user_id: UserId,
        mods: Vec<cadence_common::mods::ApiMod>,
        explicit: bool,
    ) -> Result<(), InvokeError> {
        let item = room
            .current_item()
            .ok_or_else(|| InvokeError::new("Room has no playlist items"))?;
        let (valid, projected) = item.validate_user_mods(&mods);
        if !valid && explicit {
            let incompatible: Vec<&str> = mods
                .iter()
                .filter(|m| !projected.iter().any(|p| p.acronym == m.acronym))
                .map(|m| m.acronym.as_str())
                .collect();
            return Err(InvokeError::new(format!(
                "Incompatible mods were selected: {}",
                incompatible.join(",")
            )));
        }
        let changed = match room.user_mut(user_id) {
            Some(user) if user.mods != projected => {
                user.mods = projected.clone();
                true
            }
            _ => false,
        };
        if changed {
            self.room_broadcast(
                room.id(),
                "UserModsChanged",
                vec![WireOut::of(&user_id), WireOut::of(&projected)],
            );
        }
        Ok(())
    }

    async fn change_user_style(
        &self,
        room: &mut ServerRoom,
        user_id: UserId,
        beatmap_id: Option<BeatmapId>,
        ruleset_id: Option<RulesetId>,
    ) -> Result<(), InvokeError> {
        {
            let Some(user) = room.user(user_id) else {
                return Err(InvokeError::new("You are not in this room"));
            };
            if user.beatmap_id == beatmap_id && user.ruleset_id == ruleset_id {
                return Ok(());
            }
        }

        if beatmap_id.is_some() || ruleset_id.is_some() {
            let item = room
                .current_item()
                .ok_or_else(|| InvokeError::new("Room has no playlist items"))?;
            if !item.freestyle {
                return Err(InvokeError::new("Current item does not allow free user styles."));
            }
            let item_beatmap = rooms::beatmap(&self.app.db, item.beatmap_id.0)
                .await?
                .ok_or_else(|| InvokeError::new("Item beatmap not found"))?;
            let user_beatmap = match beatmap_id {
                None => item_beatmap.clone(),
                Some(id) => rooms::beatmap(&self.app.db, id.0)
                    .await?
                    .ok_or_else(|| InvokeError::new("Invalid beatmap selected."))?,
            };
            if user_beatmap.beatmapset_id != item_beatmap.beatmapset_id {
                return Err(InvokeError::new(
                    "Selected beatmap is not from the same beatmap set.",
                ));
            }
            if let Some(ruleset_id) = ruleset_id {
                // Only the base ruleset converts to others.
                if user_beatmap.mode != 0 && ruleset_id.0 != user_beatmap.mode {
                    return Err(InvokeError::new(
                        "Selected ruleset is not supported for the given beatmap.",
                    ));
                }
            }
        }

        if let Some(user) = room.user_mut(user_id) {
            user.beatmap_id = beatmap_id;
            user.ruleset_id = ruleset_id;
        }
        self.room_broadcast(
            room.id(),
            "UserStyleChanged",
            vec![
                WireOut::of(&user_id),
                WireOut::of(&beatmap_id),
                WireOut::of(&ruleset_id),
            ],
        );
        Ok(())
    }

    /// Re-validates every user's style and mods against the current item
    /// (after settings or item changes).
    pub(crate) async fn validate_styles(&self, room: &mut ServerRoom) -> Result<(), InvokeError> {
        let Some(item) = room.current_item().cloned() else {
            return Ok(());
        };
        let users: Vec<UserId> = room.room.users.iter().map(|u| u.user_id).collect();

        if !item.freestyle {
            for user_id in users.iter().copied() {
                self.change_user_style(room, user_id, None, None).await?;
            }
        } else if let Some(item_beatmap) = rooms::beatmap(&self.app.db, item.beatmap_id.0).await? {
            let set_beatmaps =
                rooms::beatmaps_of_set(&self.app.db, item_beatmap.beatmapset_id).await?;
            for user_id in users.iter().copied() {
                let (mut beatmap_id, mut ruleset_id) = match room.user(user_id) {
                    Some(user) => (user.beatmap_id, user.ruleset_id),
                    None => continue,
                };
                let user_beatmap = beatmap_id
                    .and_then(|id| set_beatmaps.iter().find(|(bid, _)| *bid == id.0));
                if beatmap_id.is_some() && user_beatmap.is_none() {
                    beatmap_id = None;
                }
                let beatmap_mode = user_beatmap.map(|(_, mode)| *mode).unwrap_or(item_beatmap.mode);
                if ruleset_id.is_some_and(|r| beatmap_mode != 0 && r.0 != beatmap_mode) {
                    ruleset_id = None;
                }
                self.change_user_style(room, user_id, beatmap_id, ruleset_id)
                    .await?;
            }
        }

        // Invalid mods are projected onto the valid set, not rejected.
        for user_id in users {
            let mods = match room.user(user_id) {
                Some(user) => user.mods.clone(),
                None => continue,
            };
            self.change_user_mods(room, user_id, mods, false)?;
        }
        Ok(())
    }

    /// Drops every ready user back to idle; optionally resets download
    /// availability when the beatmap itself changed.
    pub(crate) async fn unready_all_users(
        &self,
        room: &mut ServerRoom,
        reset_beatmap_availability: bool,
    ) -> Result<(), InvokeError> {
        let ready: Vec<UserId> = room
            .room
            .users
            .iter()
            .filter(|u| u.state == MultiplayerUserState::Ready)
            .map(|u| u.user_id)
            .collect();
        for user_id in ready {
            self.change_user_state(room, user_id, MultiplayerUserState::Idle);
        }
        if reset_beatmap_availability {
            let users: Vec<UserId> = room.room.users.iter().map(|u| u.user_id).collect();
            for user_id in users {
                self.change_beatmap_availability(room, user_id, BeatmapAvailability::default());
            }
        }
        self.stop_countdowns_of_kind(room, CountdownKind::MatchStart);
        Ok(())
    }

    // ---- settings ----------------------------------------------------

    async fn change_settings(
        &self,
        client: &Arc<HubClient>,
        mut settings: MultiplayerRoomSettings,
    ) -> Result<(), InvokeError> {
        let room_lock = self.ensure_in_room(client.user_id)?;
        let mut room = room_lock.lock().await;
        self.ensure_host(&room, client.user_id)?;
        if room.room.state != MultiplayerRoomState::Open {
            return Err(InvokeError::new("Cannot change settings while playing"));
        }
        if settings.match_type == MatchType::Playlists {
            return Err(InvokeError::new("Invalid match type selected"));
        }

        settings.playlist_item_id = room.room.settings.playlist_item_id;
        let previous = room.room.settings.clone();
        room.room.settings = settings.clone();

        if previous.match_type != settings.match_type {
            self.apply_match_type(&mut room, settings.match_type);
        }
        if previous.queue_mode != settings.queue_mode {
            self.update_queue_mode(&mut room).await?;
        }

        rooms::update_room_settings(
            &self.app.db,
            room.id(),
            &room.room.settings,
            room.room.host.as_ref().map(|h| h.user_id),
        )
        .await?;
        self.validate_styles(&mut room).await?;
        self.unready_all_users(&mut room, false).await?;
        let settings = room.room.settings.clone();
        self.room_broadcast(room.id(), "SettingsChanged", vec![WireOut::of(&settings)]);
        self.update_room_state(&mut room).await
    }

    // ---- match lifecycle ---------------------------------------------

    async fn start_match_rpc(&self, client: &Arc<HubClient>) -> Result<(), InvokeError> {
        let room_lock = self.ensure_in_room(client.user_id)?;
        let mut room = room_lock.lock().await;
        self.ensure_host(&room, client.user_id)?;
        let host_state = room
            .room
            .host
            .as_ref()
            .and_then(|host| room.user(host.user_id))
            .map(|user| user.state);
        if !matches!(
            host_state,
            Some(MultiplayerUserState::Ready | MultiplayerUserState::Spectating)
        ) {
            return Err(InvokeError::new("Can't start match when the host is not ready."));
        }
        if !room
            .room
            .users
            .iter()
            .any(|u| u.state == MultiplayerUserState::Ready)
        {
            return Err(InvokeError::new("Can't start match when no users are ready."));
        }
        self.start_match(&mut room).await?;
        self.update_room_state(&mut room).await
    }

    /// Drives the start-of-match transition: locally-available idle/ready
    /// users move to waiting-for-load, the room follows, and a forced
    /// gameplay start is armed.
    pub(crate) async fn start_match(&self, room: &mut ServerRoom) -> Result<(), InvokeError> {
        if room.room.state != MultiplayerRoomState::Open {
            return Err(InvokeError::new("Can't start match when already in a running state."));
        }
        let item = room
            .current_item()
            .cloned()
            .ok_or_else(|| InvokeError::new("Room has no playlist items"))?;
        if item.expired {
            return Err(InvokeError::new("Current playlist item is expired"));
        }
        if !room
            .room
            .users
            .iter()
            .any(|u| u.state == MultiplayerUserState::Ready)
        {
            // An auto-start fired with nobody ready; rotate the queue.
            self.finish_current_item(room).await?;
            return Ok(());
        }

        let starting: Vec<UserId> = room
            .room
            .users
            .iter()
            .filter(|u| {
                u.availability.state == DownloadState::LocallyAvailable
                    && matches!(
                        u.state,
                        MultiplayerUserState::Ready | MultiplayerUserState::Idle
                    )
            })
            .map(|u| u.user_id)
            .collect();
        for user_id in starting {
            self.change_user_state(room, user_id, MultiplayerUserState::WaitingForLoad);
        }
        self.change_room_state(room, MultiplayerRoomState::WaitingForLoad);
        self.room_broadcast(room.id(), "LoadRequested", Vec::new());
        self.start_countdown(
            room,
            CountdownKind::ForceGameplayStart,
            GAMEPLAY_LOAD_TIMEOUT,
            CountdownContinuation::StartGameplay,
            false,
        );
        let detail = self.match_started_detail(room);
        self.log_game_event(room.id(), item.id, "game_started", Some(detail))
            .await;
        log::info!("[multiplayer] room {} match started", room.id());
        Ok(())
    }

    /// The gameplay-load barrier resolved (everyone loaded or the forced
    /// start fired): loaded users begin playing, stragglers reset.
    pub(crate) async fn start_gameplay(&self, room: &mut ServerRoom) -> Result<(), InvokeError> {
        if room.room.state != MultiplayerRoomState::WaitingForLoad {
            return Err(InvokeError::new("Room is not ready for gameplay"));
        }
        self.stop_countdowns_of_kind(room, CountdownKind::ForceGameplayStart);

        let snapshot: Vec<(UserId, MultiplayerUserState)> = room
            .room
            .users
            .iter()
            .map(|u| (u.user_id, u.state))
            .collect();
        let mut playing = 0u32;
        for (user_id, state) in snapshot {
            match state {
                MultiplayerUserState::Loaded | MultiplayerUserState::ReadyForGameplay => {
                    playing += 1;
                    self.change_user_state(room, user_id, MultiplayerUserState::Playing);
                    if let Some(client) = self.core.client(user_id) {
                        client.invoke_noblock("GameplayStarted", Vec::new());
                    }
                }
                MultiplayerUserState::WaitingForLoad => {
                    self.change_user_state(room, user_id, MultiplayerUserState::Idle);
                    self.room_broadcast(
                        room.id(),
                        "GameplayAborted",
                        vec![WireOut::of(&GameplayAbortReason::LoadTookTooLong)],
                    );
                }
                _ => {}
            }
        }

        if playing > 0 {
            self.change_room_state(room, MultiplayerRoomState::Playing);
            rooms::update_room_status(&self.app.db, room.id(), "playing").await?;
            if let Ok(mut conn) = self.app.redis().await {
                let _ = conn
                    .set_ex::<_, _, ()>(
                        format!("multiplayer:{}:gameplay:players", room.id()),
                        playing,
                        3600,
                    )
                    .await;
            }
            // Re-seed the spectator projection so watchers of every
            // participant see the fresh round.
            for user in room.room.users.clone() {
                if let Some(client) = self.core.client(user.user_id) {
                    self.sync_with_spectator_hub(&client, room).await;
                }
            }
        } else {
            self.change_room_state(room, MultiplayerRoomState::Open);
            self.finish_current_item(room).await?;
        }
        Ok(())
    }

    fn change_room_state(&self, room: &mut ServerRoom, state: MultiplayerRoomState) {
        log::debug!(
            "[multiplayer] room {} state {:?} -> {state:?}",
            room.id(),
            room.room.state
        );
        room.room.state = state;
        self.room_broadcast(room.id(), "RoomStateChanged", vec![WireOut::of(&state)]);
    }

    /// Re-evaluates the room after any user-state change; drives
    /// auto-start, the load barrier, and end-of-game reconciliation.
    pub(crate) async fn update_room_state(&self, room: &mut ServerRoom) -> Result<(), InvokeError> {
        match room.room.state {
            MultiplayerRoomState::Open => {
                if room.room.settings.auto_start_enabled()
                    && room.current_item().is_some_and(|item| !item.expired)
                    && room
                        .room
                        .users
                        .iter()
                        .any(|u| u.state == MultiplayerUserState::Ready)
                    && !self.has_countdown_of_kind(room, CountdownKind::MatchStart)
                {
                    let duration = room.room.settings.auto_start_duration.0;
                    self.start_countdown(
                        room,
                        CountdownKind::MatchStart,
                        duration,
                        CountdownContinuation::StartMatch,
                        true,
                    );
                }
            }
            MultiplayerRoomState::WaitingForLoad => {
                let loading = room
                    .room
                    .users
                    .iter()
                    .any(|u| u.state == MultiplayerUserState::WaitingForLoad);
                let any_playing_slot = room.room.users.iter().any(|u| u.state.is_playing());
                if !loading && any_playing_slot {
                    self.start_gameplay(room).await?;
                }
            }
            MultiplayerRoomState::Playing => {
                if room
                    .room
                    .users
                    .iter()
                    .all(|u| u.state != MultiplayerUserState::Playing)
                {
                    self.finish_gameplay(room).await?;
                }
            }
            MultiplayerRoomState::Closed => {}
        }
        Ok(())
    }

    /// No one is playing anymore: move finishers and spectators to the
    /// results screen, reopen the room, and rotate the queue.
    async fn finish_gameplay(&self, room: &mut ServerRoom) -> Result<(), InvokeError> {
        let mut any_finished = false;
        let snapshot: Vec<(UserId, MultiplayerUserState)> = room
            .room
            .users
            .iter()
            .map(|u| (u.user_id, u.state))
            .collect();
        for (user_id, state) in snapshot {
            match state {
                MultiplayerUserState::FinishedPlay => {
                    any_finished = true;
                    self.change_user_state(room, user_id, MultiplayerUserState::Results);
                }
                MultiplayerUserState::Spectating => {
                    // Spectators follow everyone to the results screen.
                    self.change_user_state(room, user_id, MultiplayerUserState::Results);
                }
                _ => {}
            }
        }

        self.change_room_state(room, MultiplayerRoomState::Open);
        rooms::update_room_status(&self.app.db, room.id(), "idle").await?;
        self.room_broadcast(room.id(), "ResultsReady", Vec::new());
        self.notify_spectator_hub_game_ended(room).await;

        if let Some(item) = room.current_item() {
            let item_id = item.id;
            let event = if any_finished { "game_completed" } else { "game_aborted" };
            self.log_game_event(room.id(), item_id, event, None).await;
        }
        self.finish_current_item(room).await
    }

    async fn abort_gameplay(&self, client: &Arc<HubClient>) -> Result<(), InvokeError> {
        let room_lock = self.ensure_in_room(client.user_id)?;
        let mut room = room_lock.lock().await;
        let user = room
            .user(client.user_id)
            .ok_or_else(|| InvokeError::new("You are not in this room"))?;
        if !user.state.is_playing() {
            return Err(InvokeError::new(
                "Cannot abort gameplay while not in a gameplay state",
            ));
        }
        self.change_user_state(&mut room, client.user_id, MultiplayerUserState::Idle);
        self.update_room_state(&mut room).await
    }

    async fn abort_match(&self, client: &Arc<HubClient>) -> Result<(), InvokeError> {
        let room_lock = self.ensure_in_room(client.user_id)?;
        let mut room = room_lock.lock().await;
        self.ensure_host(&room, client.user_id)?;
        if !matches!(
            room.room.state,
            MultiplayerRoomState::Playing | MultiplayerRoomState::WaitingForLoad
        ) {
            return Err(InvokeError::new("Cannot abort a match that hasn't started."));
        }
        let playing: Vec<UserId> = room
            .room
            .users
            .iter()
            .filter(|u| u.state.is_playing())
            .map(|u| u.user_id)
            .collect();
        for user_id in playing {
            self.change_user_state(&mut room, user_id, MultiplayerUserState::Idle);
        }
        self.room_broadcast(
            room.id(),
            "GameplayAborted",
            vec![WireOut::of(&GameplayAbortReason::HostAborted)],
        );
        self.update_room_state(&mut room).await
    }

    async fn send_match_request(
        &self,
        client: &Arc<HubClient>,
        request: MatchRequest,
    ) -> Result<(), InvokeError> {
        let room_lock = self.ensure_in_room(client.user_id)?;
        let mut room = room_lock.lock().await;
        if room.user(client.user_id).is_none() {
            return Err(InvokeError::new("You are not in this room"));
        }
        match request {
            MatchRequest::StartMatchCountdown(request) => {
                self.ensure_host(&room, client.user_id)?;
                if room.room.state != MultiplayerRoomState::Open {
                    return Err(InvokeError::new("Cannot start match countdown when not open"));
                }
                self.start_countdown(
                    &mut room,
                    CountdownKind::MatchStart,
                    request.duration.0,
                    CountdownContinuation::StartMatch,
                    false,
                );
            }
            MatchRequest::StopCountdown(request) => {
                let Some(active) = room.countdowns.get(&request.id) else {
                    return Ok(());
                };
                if active.info.is_exclusive() || active.from_auto_start {
                    return Err(InvokeError::new("Cannot stop the requested countdown"));
                }
                self.stop_countdown(&mut room, request.id);
            }
            MatchRequest::ChangeTeam(request) => {
                self.handle_change_team(&mut room, client.user_id, request.team_id)?;
            }
        }
        Ok(())
    }

    // ---- invitations -------------------------------------------------

    async fn invite_player(
        &self,
        client: &Arc<HubClient>,
        target_id: UserId,
    ) -> Result<(), InvokeError> {
        let room_lock = self.ensure_in_room(client.user_id)?;
        let room = room_lock.lock().await;
        if room.user(client.user_id).is_none() {
            return Err(InvokeError::new("You are not in this room"));
        }
        if target_id == client.user_id {
            return Err(InvokeError::new("You cannot invite yourself"));
        }
        if room.user(target_id).is_some() {
            return Err(InvokeError::new("User already invited"));
        }
        let target = users::by_id(&self.app.db, target_id.0)
            .await?
            .ok_or_else(|| InvokeError::new("User not found"))?;
        if target.is_restricted {
            return Err(InvokeError::new("User is restricted"));
        }
        if users::blocked_either_way(&self.app.db, client.user_id.0, target_id.0).await? {
            return Err(InvokeError::new(
                "Cannot perform action due to user being blocked",
            ));
        }
        if target.pm_friends_only {
            let follows = users::relationship(&self.app.db, target_id.0, client.user_id.0).await?
                == Some(RelationshipKind::Follow);
            if !follows {
                return Err(InvokeError::new(
                    "Cannot perform action because user has disabled non-friend communications",
                ));
            }
        }
        let target_client = self
            .core
            .client(target_id)
            .ok_or_else(|| InvokeError::new("User is not online"))?;
        target_client.invoke_noblock(
            "Invited",
            vec![
                WireOut::of(&client.user_id),
                WireOut::of(&room.room.room_id),
                WireOut::of(&room.room.settings.password),
            ],
        );
        Ok(())
    }

    // ---- catch-up and cross-hub sync ---------------------------------

    /// Sends a late joiner everything they need to render the room
    /// mid-game.
    async fn send_room_state_to_new_user(&self, client: &Arc<HubClient>, room: &ServerRoom) {
        if room.room.state != MultiplayerRoomState::Open {
            client.invoke_noblock("RoomStateChanged", vec![WireOut::of(&room.room.state)]);
        }
        if matches!(
            room.room.state,
            MultiplayerRoomState::WaitingForLoad | MultiplayerRoomState::Playing
        ) {
            client.invoke_noblock("LoadRequested", Vec::new());
        }
        for user in &room.room.users {
            if user.user_id != client.user_id {
                client.invoke_noblock(
                    "UserStateChanged",
                    vec![WireOut::of(&user.user_id), WireOut::of(&user.state)],
                );
            }
        }
        if room.room.state == MultiplayerRoomState::Open
            && room
                .room
                .users
                .iter()
                .any(|u| u.state == MultiplayerUserState::Results)
        {
            client.invoke_noblock("ResultsReady", Vec::new());
        }
        self.sync_with_spectator_hub(client, room).await;
    }

    /// Projects the spectator hub's per-player streams into this room so
    /// cross-page spectating stays coherent. The projection is
    /// unidirectional and tolerates staleness.
    async fn sync_with_spectator_hub(&self, client: &Arc<HubClient>, room: &ServerRoom) {
        let Some(spectator) = self.spectator.get() else {
            return;
        };
        for user in &room.room.users {
            if user.state.is_playing() {
                if let Some(state) = spectator.playing_state(user.user_id).await {
                    client.invoke_noblock(
                        "UserBeganPlaying",
                        vec![WireOut::of(&user.user_id), WireOut::of(&state)],
                    );
                }
            } else if user.state == MultiplayerUserState::Results {
                let state = self.synthetic_finished_state(room, user);
                client.invoke_noblock(
                    "UserFinishedPlaying",
                    vec![WireOut::of(&user.user_id), WireOut::of(&state)],
                );
            }
        }
    }

    /// Tells spectator-hub watchers that room members reached results.
    async fn notify_spectator_hub_game_ended(&self, room: &ServerRoom) {
        let Some(spectator) = self.spectator.get() else {
            return;
        };
        for user in &room.room.users {
            if user.state == MultiplayerUserState::Results {
                let state = self.synthetic_finished_state(room, user);
                spectator.broadcast_user_finished(user.user_id, &state);
            }
        }
    }

    fn synthetic_finished_state(
        &self,
        room: &ServerRoom,
        user: &MultiplayerRoomUser,
    ) -> SpectatorState {
        SpectatorState {
            beatmap_id: room.current_item().map(|item| item.beatmap_id),
            ruleset_id: user.ruleset_id.or(Some(RulesetId(0))),
            mods: user.mods.clone(),
            state: SpectatedUserState::Passed,
            maximum_statistics: Default::default(),
        }
    }

    // ---- shutdown ----------------------------------------------------

    /// Announces imminent shutdown to every room with an exclusive
    /// countdown; no continuation fires.
    pub async fn announce_shutdown(&self, grace: Duration) {
        let rooms: Vec<Arc<Mutex<ServerRoom>>> =
            self.rooms.lock().unwrap().values().cloned().collect();
        for room_lock in rooms {
            let mut room = room_lock.lock().await;
            self.start_countdown(
                &mut room,
                CountdownKind::ServerShuttingDown,
                grace,
                CountdownContinuation::None,
                false,
            );
        }
    }
}

#[async_trait]
impl Hub for MultiplayerHub {
    fn core(&self) -> &HubCore {
        &self.core
    }

    async fn on_connect(&self, client: &Arc<HubClient>) {
        log::info!("[multiplayer] client {} connected", client.user_id);
    }

    async fn clean_state(&self, user_id: UserId) {
        let Some(room_id) = self.joined_room(user_id) else {
            return;
        };
        let Some(room_lock) = self.room_by_id(room_id) else {
            self.joined.lock().unwrap().remove(&user_id);
            return;
        };
        let mut room = room_lock.lock().await;
        self.log_room_event(room_id, user_id, "player_left").await;
        if let Err(e) = self.make_user_leave(&mut room, user_id, false).await {
            log::error!("[multiplayer] failed to remove {user_id} from {room_id}: {e}");
        }
    }

    async fn dispatch(
        &self,
        client: &Arc<HubClient>,
        target: &str,
        args: &[WireIn],
    ) -> Result<Option<WireOut>, InvokeError> {
        match target {
            "CreateRoom" => {
                let room = self.create_room(client, arg(args, 0)?).await?;
                return Ok(Some(WireOut::of(&room)));
            }
            "JoinRoom" => {
                let room = self
                    .join_room_with_password(client, arg(args, 0)?, "")
                    .await?;
                return Ok(Some(WireOut::of(&room)));
            }
            "JoinRoomWithPassword" => {
                let password: Option<String> = arg(args, 1)?;
                let room = self
                    .join_room_with_password(client, arg(args, 0)?, password.as_deref().unwrap_or(""))
                    .await?;
                return Ok(Some(WireOut::of(&room)));
            }
            "LeaveRoom" => {
                if self.joined_room(client.user_id).is_none() {
                    return Ok(None);
                }
                let room_lock = self.ensure_in_room(client.user_id)?;
                let mut room = room_lock.lock().await;
                self.log_room_event(room.id(), client.user_id, "player_left")
                    .await;
                self.make_user_leave(&mut room, client.user_id, false).await?;
                log::info!("[multiplayer] {} left room", client.user_id);
            }
            "KickUser" => {
                let target_id: UserId = arg(args, 0)?;
                let room_lock = self.ensure_in_room(client.user_id)?;
                let mut room = room_lock.lock().await;
                self.ensure_host(&room, client.user_id)?;
                if target_id == client.user_id {
                    return Err(InvokeError::new("Can't kick self"));
                }
                if room.user(target_id).is_none() {
                    return Err(InvokeError::new("User not found in this room"));
                }
                self.log_room_event(room.id(), target_id, "player_kicked")
                    .await;
                self.make_user_leave(&mut room, target_id, true).await?;
            }
            "TransferHost" => {
                let target_id: UserId = arg(args, 0)?;
                let room_lock = self.ensure_in_room(client.user_id)?;
                let mut room = room_lock.lock().await;
                self.ensure_host(&room, client.user_id)?;
                let new_host = room
                    .user(target_id)
                    .cloned()
                    .ok_or_else(|| InvokeError::new("User not found in this room"))?;
                self.log_room_event(room.id(), target_id, "host_changed").await;
                self.set_host(&mut room, new_host).await?;
            }
            "ChangeState" => {
                self.change_state(client, arg(args, 0)?).await?;
            }
            "ChangeBeatmapAvailability" => {
                let availability: BeatmapAvailability = arg(args, 0)?;
                let room_lock = self.ensure_in_room(client.user_id)?;
                let mut room = room_lock.lock().await;
                if room.user(client.user_id).is_none() {
                    return Err(InvokeError::new("You are not in this room"));
                }
                self.change_beatmap_availability(&mut room, client.user_id, availability);
            }
            "ChangeUserMods" => {
                let mods = arg(args, 0)?;
                let room_lock = self.ensure_in_room(client.user_id)?;
                let mut room = room_lock.lock().await;
                if room.user(client.user_id).is_none() {
                    return Err(InvokeError::new("You are not in this room"));
                }
                self.change_user_mods(&mut room, client.user_id, mods, true)?;
            }
            "ChangeUserStyle" => {
                let beatmap_id: Option<BeatmapId> = arg(args, 0)?;
                let ruleset_id: Option<RulesetId> = arg(args, 1)?;
                let room_lock = self.ensure_in_room(client.user_id)?;
                let mut room = room_lock.lock().await;
                self.change_user_style(&mut room, client.user_id, beatmap_id, ruleset_id)
                    .await?;
            }
            "AddPlaylistItem" => {
                let item = arg(args, 0)?;
                let room_lock = self.ensure_in_room(client.user_id)?;
                let mut room = room_lock.lock().await;
                if room.user(client.user_id).is_none() {
                    return Err(InvokeError::new("You are not in this room"));
                }
                self.queue_add_item(&mut room, item, client.user_id).await?;
            }
            "EditPlaylistItem" => {
                let item = arg(args, 0)?;
                let room_lock = self.ensure_in_room(client.user_id)?;
                let mut room = room_lock.lock().await;
                if room.user(client.user_id).is_none() {
                    return Err(InvokeError::new("You are not in this room"));
                }
                self.queue_edit_item(&mut room, item, client.user_id).await?;
            }
            "RemovePlaylistItem" => {
                let item_id = arg(args, 0)?;
                let room_lock = self.ensure_in_room(client.user_id)?;
                let mut room = room_lock.lock().await;
                if room.user(client.user_id).is_none() {
                    return Err(InvokeError::new("You are not in this room"));
                }
                self.queue_remove_item(&mut room, item_id, client.user_id)
                    .await?;
            }
            "ChangeSettings" => {
                self.change_settings(client, arg(args, 0)?).await?;
            }
            "StartMatch" => {
                self.start_match_rpc(client).await?;
            }
            "AbortGameplay" => {
                self.abort_gameplay(client).await?;
            }
            "AbortMatch" => {
                self.abort_match(client).await?;
            }
            "SendMatchRequest" => {
                self.send_match_request(client, arg(args, 0)?).await?;
            }
            "InvitePlayer" => {
                self.invite_player(client, arg(args, 0)?).await?;
            }
            other => {
                return Err(InvokeError::new(format!("Method '{other}' not found in hub")));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests;
