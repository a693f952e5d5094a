// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use super::room::ServerRoom;
use super::MultiplayerHub;
use cadence_common::multiplayer::{
    MultiplayerRoom, MultiplayerRoomSettings, MultiplayerRoomState, MultiplayerRoomUser,
    MultiplayerUserState, PlaylistItem,
};
use cadence_common::{BeatmapId, ChannelId, PlaylistItemId, RoomId, RulesetId, UserId};

fn item(id: i64, expired: bool) -> PlaylistItem {
    PlaylistItem {
        id: PlaylistItemId(id),
        owner_id: UserId(1001),
        beatmap_id: BeatmapId(842),
        checksum: String::new(),
        ruleset_id: RulesetId(0),
        required_mods: Vec::new(),
        allowed_mods: Vec::new(),
        expired,
        order: 0,
        played_at: None,
        star: 5.0,
        freestyle: false,
    }
}

fn sample_room() -> ServerRoom {
    let mut settings = MultiplayerRoomSettings::default();
    settings.playlist_item_id = PlaylistItemId(1);
    let mut host = MultiplayerRoomUser::new(UserId(1001));
    host.state = MultiplayerUserState::Ready;
    ServerRoom::new(MultiplayerRoom {
        room_id: RoomId(3),
        state: MultiplayerRoomState::Open,
        settings,
        users: vec![host.clone(), MultiplayerRoomUser::new(UserId(1002))],
        host: Some(host),
        match_state: None,
        playlist: vec![item(1, false), item(2, false)],
        active_countdowns: Vec::new(),
        channel_id: ChannelId(55),
    })
}

fn validate(
    room: &ServerRoom,
    old: MultiplayerUserState,
    new: MultiplayerUserState,
) -> Result<(), crate::error::InvokeError> {
    MultiplayerHub::validate_state_change(room, old, new)
}

#[test]
fn state_ladder_accepts_forward_transitions() {
    use MultiplayerUserState::*;
    let room = sample_room();
    assert!(validate(&room, Idle, Ready).is_ok());
    assert!(validate(&room, WaitingForLoad, Loaded).is_ok());
    assert!(validate(&room, Loaded, ReadyForGameplay).is_ok());
    assert!(validate(&room, Playing, FinishedPlay).is_ok());
    assert!(validate(&room, FinishedPlay, Results).is_ok());
    assert!(validate(&room, Results, Idle).is_ok());
}

#[test]
fn server_managed_states_are_rejected() {
    use MultiplayerUserState::*;
    let room = sample_room();
    assert!(validate(&room, Ready, WaitingForLoad).is_err());
    assert!(validate(&room, Ready, Playing).is_err());
    assert!(validate(&room, Idle, Loaded).is_err());
    assert!(validate(&room, WaitingForLoad, ReadyForGameplay).is_err());
    assert!(validate(&room, Idle, FinishedPlay).is_err());
}

#[test]
fn cannot_idle_out_of_gameplay() {
    use MultiplayerUserState::*;
    let room = sample_room();
    assert!(validate(&room, Playing, Idle).is_err());
    assert!(validate(&room, Loaded, Idle).is_err());
}

#[test]
fn ready_requires_unexpired_item() {
    use MultiplayerUserState::*;
    let mut room = sample_room();
    assert!(validate(&room, Idle, Ready).is_ok());
    for item in &mut room.room.playlist {
        item.expired = true;
    }
    let err = validate(&room, Idle, Ready).unwrap_err();
    assert!(err.to_string().contains("all items have been played"));
}

#[test]
fn spectating_rules_depend_on_room_state() {
    use MultiplayerUserState::*;
    let mut room = sample_room();
    // From the lobby it is always allowed.
    assert!(validate(&room, Idle, Spectating).is_ok());
    assert!(validate(&room, Ready, Spectating).is_ok());
    assert!(validate(&room, Results, Spectating).is_ok());
    // From gameplay only while the room is loading or playing.
    assert!(validate(&room, Playing, Spectating).is_err());
    room.room.state = MultiplayerRoomState::Playing;
    assert!(validate(&room, Playing, Spectating).is_ok());
    room.room.state = MultiplayerRoomState::WaitingForLoad;
    assert!(validate(&room, WaitingForLoad, Spectating).is_ok());
    // Finished players cannot re-enter as spectators mid-game.
    assert!(validate(&room, FinishedPlay, Spectating).is_err());
}

#[test]
fn spectators_may_reach_results() {
    use MultiplayerUserState::*;
    let room = sample_room();
    assert!(validate(&room, Spectating, Results).is_ok());
    assert!(validate(&room, Ready, Results).is_err());
}

#[test]
fn current_item_follows_settings_pointer() {
    let mut room = sample_room();
    assert_eq!(room.current_item().unwrap().id, PlaylistItemId(1));
    room.room.settings.playlist_item_id = PlaylistItemId(2);
    assert_eq!(room.current_item().unwrap().id, PlaylistItemId(2));
    // A stale pointer falls back to the head of the playlist.
    room.room.settings.playlist_item_id = PlaylistItemId(99);
    assert_eq!(room.current_item().unwrap().id, PlaylistItemId(1));
}

#[test]
fn host_checks() {
    let room = sample_room();
    assert!(room.is_host(UserId(1001)));
    assert!(!room.is_host(UserId(1002)));
    assert!(room.user(UserId(1002)).is_some());
    assert!(room.user(UserId(9999)).is_none());
}
