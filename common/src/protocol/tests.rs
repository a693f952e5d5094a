// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: LGPL-3.0-or-later

use crate::id::{BeatmapId, ChannelId, CountdownId, PlaylistItemId, RoomId, RulesetId, UserId};
use crate::metadata::{InLobby, OnlineStatus, UserActivity, UserPresence};
use crate::mods::{ApiMod, HitResult, ModSetting, Statistics};
use crate::multiplayer::{
    BeatmapAvailability, ForceGameplayStartCountdown, MatchRoomState, MatchType,
    MultiplayerCountdown, MultiplayerRoom, MultiplayerRoomSettings, MultiplayerRoomState,
    MultiplayerRoomUser, MultiplayerUserState, PlaylistItem, QueueMode, TeamVersusRoomState,
};
use crate::protocol::messagepack::{decode_varint, encode_varint};
use crate::protocol::{
    handshake_response, parse_handshake, CodecKind, Packet, TimeSpan, WireIn, WireOut, WireValue,
    RECORD_SEPARATOR,
};
use crate::spectator::{
    FrameDataBundle, FrameHeader, LegacyReplayFrame, ReplayButtonState, ScoreProcessorStatistics,
    SpectatedUserState, SpectatorState,
};
use chrono::{TimeZone, Utc};

fn round_trip<T: WireValue + PartialEq + std::fmt::Debug>(value: &T) {
    let msgpack = value.to_msgpack();
    assert_eq!(&T::from_msgpack(&msgpack).unwrap(), value, "msgpack: {msgpack:?}");
    let json = value.to_json();
    assert_eq!(&T::from_json(&json).unwrap(), value, "json: {json}");
}

fn sample_room() -> MultiplayerRoom {
    let item = PlaylistItem {
        id: PlaylistItemId(7),
        owner_id: UserId(1001),
        beatmap_id: BeatmapId(842),
        checksum: "d41d8cd98f00b204e9800998ecf8427e".to_owned(),
        ruleset_id: RulesetId(0),
        required_mods: vec![ApiMod::new("HR")],
        allowed_mods: vec![ApiMod::new("HD")],
        expired: false,
        order: 0,
        played_at: Some(Utc.timestamp_opt(1_720_000_000, 0).unwrap()),
        star: 5.32,
        freestyle: false,
    };
    let mut host = MultiplayerRoomUser::new(UserId(1001));
    host.state = MultiplayerUserState::Ready;
    host.availability = BeatmapAvailability::locally_available();
    MultiplayerRoom {
        room_id: RoomId(3),
        state: MultiplayerRoomState::Open,
        settings: MultiplayerRoomSettings {
            name: "weekly lobby".to_owned(),
            playlist_item_id: PlaylistItemId(7),
            password: "hunter2".to_owned(),
            match_type: MatchType::TeamVersus,
            queue_mode: QueueMode::AllPlayers,
            auto_start_duration: TimeSpan::from_secs(120),
            auto_skip: true,
        },
        users: vec![host.clone(), MultiplayerRoomUser::new(UserId(1002))],
        host: Some(host),
        match_state: Some(MatchRoomState::TeamVersus(TeamVersusRoomState::red_and_blue())),
        playlist: vec![item],
        active_countdowns: vec![MultiplayerCountdown::ForceGameplayStart(
            ForceGameplayStartCountdown {
                id: CountdownId(4),
                time_remaining: TimeSpan::from_secs(30),
            },
        )],
        channel_id: ChannelId(55),
    }
}

#[test]
fn varint_round_trip() {
    for n in [0u64, 1, 127, 128, 300, 16383, 16384, u32::MAX as u64] {
        let encoded = encode_varint(n);
        let (decoded, consumed) = decode_varint(&encoded).unwrap();
        assert_eq!(decoded, n);
        assert_eq!(consumed, encoded.len());
    }
    assert_eq!(encode_varint(127), vec![0x7f]);
    assert_eq!(encode_varint(128), vec![0x80, 0x01]);
}

#[test]
fn room_round_trips_both_codecs() {
    round_trip(&sample_room());
}

#[test]
fn room_json_uses_camel_case() {
    let json = sample_room().to_json();
    let settings = &json["settings"];
    assert!(settings.get("autoStartDuration").is_some());
    assert_eq!(settings["autoStartDuration"], serde_json::json!("00:02:00"));
    assert!(json.get("activeCountdowns").is_some());
}

#[test]
fn union_json_encoding() {
    let state = MatchRoomState::TeamVersus(TeamVersusRoomState::red_and_blue());
    let json = state.to_json();
    assert_eq!(json["$dtype"], "TeamVersusRoomState");
    // Pascal case inside the union payload.
    assert_eq!(json["$value"]["Teams"][0]["Name"], "Team Red");
    round_trip(&state);
}

#[test]
fn union_msgpack_encoding() {
    let countdown = MultiplayerCountdown::ForceGameplayStart(ForceGameplayStartCountdown {
        id: CountdownId(9),
        time_remaining: TimeSpan::from_secs(30),
    });
    let rmpv::Value::Array(items) = countdown.to_msgpack() else {
        panic!("union should encode as an array");
    };
    assert_eq!(items[0].as_u64(), Some(1));
    // 30 seconds in 100ns ticks.
    assert_eq!(items[1].as_array().unwrap()[1].as_i64(), Some(300_000_000));
    round_trip(&countdown);
}

#[test]
fn activity_union_tags() {
    let activity = UserActivity::InLobby(InLobby {
        room_id: RoomId(3),
        room_name: "weekly lobby".to_owned(),
    });
    let rmpv::Value::Array(items) = activity.to_msgpack() else {
        panic!("union should encode as an array");
    };
    assert_eq!(items[0].as_u64(), Some(22));
    round_trip(&activity);

    let presence = UserPresence {
        activity: Some(activity),
        status: Some(OnlineStatus::Online),
    };
    assert!(presence.pushable());
    round_trip(&presence);
    round_trip(&UserPresence::default());
}

#[test]
fn spectator_models_round_trip() {
    let mut statistics = Statistics::new();
    statistics.insert(HitResult::Great, 211);
    statistics.insert(HitResult::Miss, 2);
    let bundle = FrameDataBundle {
        header: FrameHeader {
            total_score: 123_456,
            acc: 0.987,
            combo: 88,
            max_combo: 120,
            statistics: statistics.clone(),
            score_processor_statistics: ScoreProcessorStatistics::default(),
            received_time: Utc.timestamp_opt(1_720_000_000, 500_000_000).unwrap(),
            mods: vec![ApiMod {
                acronym: "DT".to_owned(),
                settings: [("speed_change".to_owned(), ModSetting::Float(1.4))]
                    .into_iter()
                    .collect(),
            }],
        },
        frames: vec![
            LegacyReplayFrame {
                time: 0,
                x: Some(256.0),
                y: Some(192.0),
                button_state: ReplayButtonState::LEFT1,
            },
            LegacyReplayFrame {
                time: 16,
                x: None,
                y: None,
                button_state: ReplayButtonState::NONE,
            },
        ],
    };
    round_trip(&bundle);

    let state = SpectatorState {
        beatmap_id: Some(BeatmapId(842)),
        ruleset_id: Some(RulesetId(0)),
        mods: Vec::new(),
        state: SpectatedUserState::Playing,
        maximum_statistics: statistics,
    };
    round_trip(&state);

    // Statistics keys are the raw judgement values, stringified in JSON.
    let json = state.to_json();
    assert!(json["maximumStatistics"].get("5").is_some());
}

#[test]
fn invocation_round_trip_messagepack() {
    let packet = Packet::invocation(
        Some("4".to_owned()),
        "UserStateChanged",
        vec![
            WireOut::of(&UserId(1001)),
            WireOut::of(&MultiplayerUserState::Ready),
        ],
    );
    let encoded = packet.encode(CodecKind::MessagePack);
    let decoded = Packet::decode(&encoded, CodecKind::MessagePack).unwrap();
    assert_eq!(decoded.len(), 1);
    let Packet::Invocation {
        invocation_id,
        target,
        arguments,
        ..
    } = &decoded[0]
    else {
        panic!("expected invocation");
    };
    assert_eq!(invocation_id.as_deref(), Some("4"));
    assert_eq!(target, "UserStateChanged");
    assert_eq!(arguments[0].parse::<UserId>().unwrap(), UserId(1001));
    assert_eq!(
        arguments[1].parse::<MultiplayerUserState>().unwrap(),
        MultiplayerUserState::Ready
    );
}

#[test]
fn invocation_round_trip_json() {
    let packet = Packet::invocation(None, "ResultsReady", Vec::new());
    let encoded = packet.encode(CodecKind::Json);
    assert_eq!(*encoded.last().unwrap(), RECORD_SEPARATOR);
    let decoded = Packet::decode(&encoded, CodecKind::Json).unwrap();
    let Packet::Invocation {
        invocation_id,
        target,
        arguments,
        ..
    } = &decoded[0]
    else {
        panic!("expected invocation");
    };
    assert!(invocation_id.is_none());
    assert_eq!(target, "ResultsReady");
    assert!(arguments.is_empty());
}

#[test]
fn completion_result_kinds() {
    for codec in [CodecKind::MessagePack, CodecKind::Json] {
        let err = Packet::completion("7".to_owned(), Some("not the host".to_owned()), None);
        let decoded = Packet::decode(&err.encode(codec), codec).unwrap();
        let Packet::Completion {
            invocation_id,
            error,
            result,
        } = &decoded[0]
        else {
            panic!("expected completion");
        };
        assert_eq!(invocation_id, "7");
        assert_eq!(error.as_deref(), Some("not the host"));
        assert!(result.is_none());

        let void = Packet::completion("8".to_owned(), None, None);
        let decoded = Packet::decode(&void.encode(codec), codec).unwrap();
        let Packet::Completion { error, result, .. } = &decoded[0] else {
            panic!("expected completion");
        };
        assert!(error.is_none() && result.is_none());

        let value = Packet::completion("9".to_owned(), None, Some(WireOut::of(&UserId(5))));
        let decoded = Packet::decode(&value.encode(codec), codec).unwrap();
        let Packet::Completion { result, .. } = &decoded[0] else {
            panic!("expected completion");
        };
        assert_eq!(result.as_ref().unwrap().parse::<UserId>().unwrap(), UserId(5));
    }
}

#[test]
fn ping_and_close() {
    for codec in [CodecKind::MessagePack, CodecKind::Json] {
        let decoded = Packet::decode(&Packet::Ping.encode(codec), codec).unwrap();
        assert!(matches!(decoded[0], Packet::Ping));

        let close = Packet::Close {
            error: Some("kicked".to_owned()),
            allow_reconnect: true,
        };
        let decoded = Packet::decode(&close.encode(codec), codec).unwrap();
        let Packet::Close {
            error,
            allow_reconnect,
        } = &decoded[0]
        else {
            panic!("expected close");
        };
        assert_eq!(error.as_deref(), Some("kicked"));
        assert!(allow_reconnect);
    }
}

#[test]
fn multiple_frames_per_buffer() {
    let a = Packet::invocation(None, "Ping1", Vec::new()).encode(CodecKind::MessagePack);
    let b = Packet::Ping.encode(CodecKind::MessagePack);
    let mut buffer = a;
    buffer.extend_from_slice(&b);
    let decoded = Packet::decode(&buffer, CodecKind::MessagePack).unwrap();
    assert_eq!(decoded.len(), 2);

    let a = Packet::invocation(None, "Ping1", Vec::new()).encode(CodecKind::Json);
    let b = Packet::Ping.encode(CodecKind::Json);
    let mut buffer = a;
    buffer.extend_from_slice(&b);
    let decoded = Packet::decode(&buffer, CodecKind::Json).unwrap();
    assert_eq!(decoded.len(), 2);
}

#[test]
fn handshake() {
    let request = parse_handshake(b"{\"protocol\":\"messagepack\",\"version\":1}\x1e").unwrap();
    assert_eq!(CodecKind::from_name(&request.protocol), Some(CodecKind::MessagePack));
    assert_eq!(request.version, 1);

    assert_eq!(handshake_response(None), b"{}\x1e");
    let failed = handshake_response(Some("unsupported protocol"));
    assert_eq!(*failed.last().unwrap(), RECORD_SEPARATOR);
    assert!(std::str::from_utf8(&failed).unwrap().contains("unsupported protocol"));
}

#[test]
fn decode_rejects_unknown_kind() {
    // Kind 5 (cancel invocation) is unsupported.
    assert!(Packet::decode(b"{\"type\":5}\x1e", CodecKind::Json).is_err());
}

#[test]
fn wire_in_cross_codec_values() {
    let availability = BeatmapAvailability {
        state: crate::multiplayer::DownloadState::Downloading,
        progress: Some(0.25),
    };
    let from_msgpack = WireIn::MessagePack(availability.to_msgpack());
    let from_json = WireIn::Json(availability.to_json());
    assert_eq!(from_msgpack.parse::<BeatmapAvailability>().unwrap(), availability);
    assert_eq!(from_json.parse::<BeatmapAvailability>().unwrap(), availability);
}
