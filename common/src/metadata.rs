// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Presence wire models. Activity tags are the client's union ordinals and
//! are deliberately sparse; do not renumber.

use crate::id::{BeatmapId, PlaylistItemId, RoomId, RulesetId, ScoreId, UserId};
use crate::protocol::macros::{wire_enum, wire_model, wire_union};

wire_enum! {
    pub enum OnlineStatus {
        Offline,
        DoNotDisturb,
        Online,
    }
}

wire_model! {
    pub struct ChoosingBeatmap {
    }
}

wire_model! {
    pub struct InSoloGame {
        pub beatmap_id: BeatmapId,
        pub beatmap_display_title: String,
        pub ruleset_id: RulesetId,
        pub ruleset_playing_verb: String,
    }
}

wire_model! {
    pub struct InMultiplayerGame {
        pub beatmap_id: BeatmapId,
        pub beatmap_display_title: String,
        pub ruleset_id: RulesetId,
        pub ruleset_playing_verb: String,
    }
}

wire_model! {
    pub struct SpectatingMultiplayerGame {
        pub beatmap_id: BeatmapId,
        pub beatmap_display_title: String,
        pub ruleset_id: RulesetId,
        pub ruleset_playing_verb: String,
    }
}

wire_model! {
    pub struct InPlaylistGame {
        pub beatmap_id: BeatmapId,
        pub beatmap_display_title: String,
        pub ruleset_id: RulesetId,
        pub ruleset_playing_verb: String,
    }
}

wire_model! {
    pub struct PlayingDailyChallenge {
        pub beatmap_id: BeatmapId,
        pub beatmap_display_title: String,
        pub ruleset_id: RulesetId,
        pub ruleset_playing_verb: String,
    }
}

wire_model! {
    pub struct EditingBeatmap {
        pub beatmap_id: BeatmapId,
        pub beatmap_display_title: String,
    }
}

wire_model! {
    pub struct ModdingBeatmap {
        pub beatmap_id: BeatmapId,
        pub beatmap_display_title: String,
    }
}

wire_model! {
    pub struct TestingBeatmap {
        pub beatmap_id: BeatmapId,
        pub beatmap_display_title: String,
    }
}

wire_model! {
    pub struct WatchingReplay {
        pub score_id: ScoreId,
        pub player_name: String,
        pub beatmap_id: BeatmapId,
        pub beatmap_display_title: String,
    }
}

wire_model! {
    pub struct SpectatingUser {
        pub score_id: ScoreId,
        pub player_name: String,
        pub beatmap_id: BeatmapId,
        pub beatmap_display_title: String,
    }
}

wire_model! {
    pub struct SearchingForLobby {
    }
}

wire_model! {
    pub struct InLobby {
        pub room_id: RoomId,
        pub room_name: String,
    }
}

wire_model! {
    pub struct InDailyChallengeLobby {
    }
}

wire_union! {
    pub enum UserActivity {
        ChoosingBeatmap(ChoosingBeatmap) = 11,
        InSoloGame(InSoloGame) = 12,
        WatchingReplay(WatchingReplay) = 13,
        SpectatingUser(SpectatingUser) = 14,
        SearchingForLobby(SearchingForLobby) = 21,
        InLobby(InLobby) = 22,
        InMultiplayerGame(InMultiplayerGame) = 23,
        SpectatingMultiplayerGame(SpectatingMultiplayerGame) = 24,
        InPlaylistGame(InPlaylistGame) = 31,
        EditingBeatmap(EditingBeatmap) = 41,
        ModdingBeatmap(ModdingBeatmap) = 42,
        TestingBeatmap(TestingBeatmap) = 43,
        InDailyChallengeLobby(InDailyChallengeLobby) = 51,
        PlayingDailyChallenge(PlayingDailyChallenge) = 52,
    }
}

wire_model! {
    pub struct UserPresence {
        pub activity: Option<UserActivity>,
        pub status: Option<OnlineStatus>,
    }
}

impl Default for UserPresence {
    fn default() -> Self {
        Self {
            activity: None,
            status: None,
        }
    }
}

impl UserPresence {
    /// A presence is pushed to watchers only while the user is visible.
    pub fn pushable(&self) -> bool {
        self.status
            .is_some_and(|status| status != OnlineStatus::Offline)
    }
}

wire_model! {
    /// Pushed to room watchers when score processing lands a new result
    /// on a playlist item.
    pub struct MultiplayerRoomScoreSetEvent {
        pub room_id: RoomId,
        pub playlist_item_id: PlaylistItemId,
        pub score_id: ScoreId,
        pub user_id: UserId,
        pub total_score: i64,
        pub new_rank: Option<i32>,
    }
}
