// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Multiplayer room wire models. Field order is the client's MessagePack
//! key order; do not reorder.

use crate::id::{BeatmapId, ChannelId, CountdownId, PlaylistItemId, RoomId, RulesetId, TeamId, UserId};
use crate::mods::ApiMod;
use crate::protocol::macros::{wire_enum, wire_model, wire_union};
use crate::protocol::TimeSpan;
use chrono::{DateTime, Utc};

wire_enum! {
    pub enum MatchType {
        Playlists,
        HeadToHead,
        TeamVersus,
    }
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Playlists => "playlists",
            Self::HeadToHead => "head_to_head",
            Self::TeamVersus => "team_versus",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "playlists" => Self::Playlists,
            "head_to_head" => Self::HeadToHead,
            "team_versus" => Self::TeamVersus,
            _ => return None,
        })
    }
}

wire_enum! {
    pub enum QueueMode {
        HostOnly,
        AllPlayers,
        AllPlayersRoundRobin,
    }
}

impl QueueMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostOnly => "host_only",
            Self::AllPlayers => "all_players",
            Self::AllPlayersRoundRobin => "all_players_round_robin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "host_only" => Self::HostOnly,
            "all_players" => Self::AllPlayers,
            "all_players_round_robin" => Self::AllPlayersRoundRobin,
            _ => return None,
        })
    }
}

wire_enum! {
    pub enum MultiplayerRoomState {
        Open,
        WaitingForLoad,
        Playing,
        Closed,
    }
}

wire_enum! {
    /// The per-user state ladder. Ordering is significant: transitions are
    /// validated against it and the ordinals are the wire encoding.
    pub enum MultiplayerUserState {
        Idle,
        Ready,
        WaitingForLoad,
        Loaded,
        ReadyForGameplay,
        Playing,
        FinishedPlay,
        Results,
        Spectating,
    }
}

impl MultiplayerUserState {
    /// States in which the user occupies a gameplay slot.
    pub fn is_playing(self) -> bool {
        matches!(
            self,
            Self::WaitingForLoad | Self::Loaded | Self::ReadyForGameplay | Self::Playing
        )
    }
}

wire_enum! {
    pub enum DownloadState {
        Unknown,
        NotDownloaded,
        Downloading,
        Importing,
        LocallyAvailable,
    }
}

wire_enum! {
    pub enum GameplayAbortReason {
        LoadTookTooLong,
        HostAborted,
    }
}

wire_model! {
    pub struct MultiplayerRoomSettings {
        pub name: String,
        pub playlist_item_id: PlaylistItemId,
        pub password: String,
        pub match_type: MatchType,
        pub queue_mode: QueueMode,
        pub auto_start_duration: TimeSpan,
        pub auto_skip: bool,
    }
}

impl Default for MultiplayerRoomSettings {
    fn default() -> Self {
        Self {
            name: "Unnamed Room".to_owned(),
            playlist_item_id: PlaylistItemId(0),
            password: String::new(),
            match_type: MatchType::HeadToHead,
            queue_mode: QueueMode::HostOnly,
            auto_start_duration: TimeSpan::default(),
            auto_skip: false,
        }
    }
}

impl MultiplayerRoomSettings {
    pub fn auto_start_enabled(&self) -> bool {
        !self.auto_start_duration.0.is_zero()
    }
}

wire_model! {
    pub struct BeatmapAvailability {
        pub state: DownloadState,
        pub progress: Option<f64>,
    }
}

impl Default for BeatmapAvailability {
    fn default() -> Self {
        Self {
            state: DownloadState::Unknown,
            progress: None,
        }
    }
}

impl BeatmapAvailability {
    pub fn locally_available() -> Self {
        Self {
            state: DownloadState::LocallyAvailable,
            progress: None,
        }
    }
}

wire_model! {
    pub struct MultiplayerTeam {
        pub id: TeamId,
        pub name: String,
    }
}

wire_model! {
    pub struct TeamVersusUserState {
        pub team_id: TeamId,
    }
}

wire_union! {
    pub enum MatchUserState {
        TeamVersus(TeamVersusUserState) = 0,
    }
}

wire_model! {
    pub struct TeamVersusRoomState {
        pub teams: Vec<MultiplayerTeam>,
    }
}

impl TeamVersusRoomState {
    pub fn red_and_blue() -> Self {
        Self {
            teams: vec![
                MultiplayerTeam {
                    id: TeamId(0),
                    name: "Team Red".to_owned(),
                },
                MultiplayerTeam {
                    id: TeamId(1),
                    name: "Team Blue".to_owned(),
                },
            ],
        }
    }
}

wire_union! {
    pub enum MatchRoomState {
        TeamVersus(TeamVersusRoomState) = 0,
    }
}

wire_model! {
    pub struct PlaylistItem {
        pub id: PlaylistItemId,
        pub owner_id: UserId,
        pub beatmap_id: BeatmapId,
        pub checksum: String,
        pub ruleset_id: RulesetId,
        pub required_mods: Vec<ApiMod>,
        pub allowed_mods: Vec<ApiMod>,
        pub expired: bool,
        pub order: i32,
        pub played_at: Option<DateTime<Utc>>,
        pub star: f64,
        pub freestyle: bool,
    }
}

impl PlaylistItem {
    /// Projects `proposed` onto the mods this item actually allows.
    /// Returns whether the proposal was already valid plus the projection.
    pub fn validate_user_mods(&self, proposed: &[ApiMod]) -> (bool, Vec<ApiMod>) {
        if self.freestyle {
            // Freestyle items accept any mod selection.
            return (true, proposed.to_vec());
        }
        let valid: Vec<ApiMod> = proposed
            .iter()
            .filter(|m| self.allowed_mods.iter().any(|a| a.acronym == m.acronym))
            .cloned()
            .collect();
        (valid.len() == proposed.len(), valid)
    }
}

wire_model! {
    pub struct MatchStartCountdown {
        pub id: CountdownId,
        pub time_remaining: TimeSpan,
    }
}

wire_model! {
    pub struct ForceGameplayStartCountdown {
        pub id: CountdownId,
        pub time_remaining: TimeSpan,
    }
}

wire_model! {
    pub struct ServerShuttingDownCountdown {
        pub id: CountdownId,
        pub time_remaining: TimeSpan,
    }
}

wire_union! {
    pub enum MultiplayerCountdown {
        MatchStart(MatchStartCountdown) = 0,
        ForceGameplayStart(ForceGameplayStartCountdown) = 1,
        ServerShuttingDown(ServerShuttingDownCountdown) = 2,
    }
}

impl MultiplayerCountdown {
    pub fn id(&self) -> CountdownId {
        match self {
            Self::MatchStart(c) => c.id,
            Self::ForceGameplayStart(c) => c.id,
            Self::ServerShuttingDown(c) => c.id,
        }
    }

    pub fn time_remaining(&self) -> TimeSpan {
        match self {
            Self::MatchStart(c) => c.time_remaining,
            Self::ForceGameplayStart(c) => c.time_remaining,
            Self::ServerShuttingDown(c) => c.time_remaining,
        }
    }

    /// Exclusive countdowns displace others of the same kind and cannot be
    /// stopped by clients.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::ForceGameplayStart(_) | Self::ServerShuttingDown(_))
    }

    pub fn same_kind(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::MatchStart(_), Self::MatchStart(_))
                | (Self::ForceGameplayStart(_), Self::ForceGameplayStart(_))
                | (Self::ServerShuttingDown(_), Self::ServerShuttingDown(_))
        )
    }
}

wire_model! {
    pub struct ChangeTeamRequest {
        pub team_id: TeamId,
    }
}

wire_model! {
    pub struct StartMatchCountdownRequest {
        pub duration: TimeSpan,
    }
}

wire_model! {
    pub struct StopCountdownRequest {
        pub id: CountdownId,
    }
}

wire_union! {
    pub enum MatchRequest {
        ChangeTeam(ChangeTeamRequest) = 0,
        StartMatchCountdown(StartMatchCountdownRequest) = 1,
        StopCountdown(StopCountdownRequest) = 2,
    }
}

wire_model! {
    pub struct CountdownStartedEvent {
        pub countdown: MultiplayerCountdown,
    }
}

wire_model! {
    pub struct CountdownStoppedEvent {
        pub id: CountdownId,
    }
}

wire_union! {
    pub enum MatchServerEvent {
        CountdownStarted(CountdownStartedEvent) = 0,
        CountdownStopped(CountdownStoppedEvent) = 1,
    }
}

wire_model! {
    pub struct MultiplayerRoomUser {
        pub user_id: UserId,
        pub state: MultiplayerUserState,
        pub availability: BeatmapAvailability,
        pub mods: Vec<ApiMod>,
        pub match_state: Option<MatchUserState>,
        pub ruleset_id: Option<RulesetId>,
        pub beatmap_id: Option<BeatmapId>,
    }
}

impl MultiplayerRoomUser {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            state: MultiplayerUserState::Idle,
            availability: BeatmapAvailability::default(),
            mods: Vec::new(),
            match_state: None,
            ruleset_id: None,
            beatmap_id: None,
        }
    }
}

wire_model! {
    pub struct MultiplayerRoom {
        pub room_id: RoomId,
        pub state: MultiplayerRoomState,
        pub settings: MultiplayerRoomSettings,
        pub users: Vec<MultiplayerRoomUser>,
        pub host: Option<MultiplayerRoomUser>,
        pub match_state: Option<MatchRoomState>,
        pub playlist: Vec<PlaylistItem>,
        pub active_countdowns: Vec<MultiplayerCountdown>,
        pub channel_id: ChannelId,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_state_ordering() {
        use MultiplayerUserState::*;
        let ladder = [
            Idle,
            Ready,
            WaitingForLoad,
            Loaded,
            ReadyForGameplay,
            Playing,
            FinishedPlay,
            Results,
            Spectating,
        ];
        for (i, state) in ladder.into_iter().enumerate() {
            assert_eq!(state.ordinal(), i as u64);
        }
        assert!(WaitingForLoad.is_playing());
        assert!(Loaded.is_playing());
        assert!(ReadyForGameplay.is_playing());
        assert!(Playing.is_playing());
        assert!(!Results.is_playing());
        assert!(!Spectating.is_playing());
    }

    #[test]
    fn mod_validation_projects_onto_allowed() {
        let item = PlaylistItem {
            id: PlaylistItemId(1),
            owner_id: UserId(1),
            beatmap_id: BeatmapId(1),
            checksum: String::new(),
            ruleset_id: RulesetId(0),
            required_mods: Vec::new(),
            allowed_mods: vec![ApiMod::new("HD"), ApiMod::new("HR")],
            expired: false,
            order: 0,
            played_at: None,
            star: 5.0,
            freestyle: false,
        };
        let (ok, valid) = item.validate_user_mods(&[ApiMod::new("HD")]);
        assert!(ok);
        assert_eq!(valid.len(), 1);

        let (ok, valid) = item.validate_user_mods(&[ApiMod::new("HD"), ApiMod::new("DT")]);
        assert!(!ok);
        assert_eq!(valid, vec![ApiMod::new("HD")]);
    }

    #[test]
    fn exclusive_countdowns() {
        let start = MultiplayerCountdown::MatchStart(MatchStartCountdown {
            id: CountdownId(1),
            time_remaining: TimeSpan::from_secs(10),
        });
        let force = MultiplayerCountdown::ForceGameplayStart(ForceGameplayStartCountdown {
            id: CountdownId(2),
            time_remaining: TimeSpan::from_secs(30),
        });
        assert!(!start.is_exclusive());
        assert!(force.is_exclusive());
        assert!(!start.same_kind(&force));
    }
}
