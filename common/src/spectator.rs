// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Spectator wire models: play-session state and the frame bundles fanned
//! out to watchers.

use crate::id::{BeatmapId, RulesetId, UserId};
use crate::mods::{ApiMod, Statistics};
use crate::protocol::macros::{wire_enum, wire_model};
use crate::protocol::{WireError, WireValue};
use chrono::{DateTime, Utc};

wire_model! {
    /// Minimal identity pushed to a player when someone starts watching.
    pub struct SpectatorUser {
        pub user_id: UserId,
        pub username: String,
    }
}

wire_enum! {
    pub enum SpectatedUserState {
        Idle,
        Playing,
        Paused,
        Passed,
        Failed,
        Quit,
    }
}

wire_model! {
    pub struct SpectatorState {
        pub beatmap_id: Option<BeatmapId>,
        pub ruleset_id: Option<RulesetId>,
        pub mods: Vec<ApiMod>,
        pub state: SpectatedUserState,
        pub maximum_statistics: Statistics,
    }
}

impl Default for SpectatorState {
    fn default() -> Self {
        Self {
            beatmap_id: None,
            ruleset_id: None,
            mods: Vec::new(),
            state: SpectatedUserState::Idle,
            maximum_statistics: Statistics::new(),
        }
    }
}

wire_model! {
    pub struct ScoreProcessorStatistics {
        pub base_score: i64,
        pub maximum_base_score: i64,
        pub accuracy_judgement_count: i32,
        pub combo_portion: f64,
        pub bonus_portion: f64,
    }
}

impl Default for ScoreProcessorStatistics {
    fn default() -> Self {
        Self {
            base_score: 0,
            maximum_base_score: 0,
            accuracy_judgement_count: 0,
            combo_portion: 0.0,
            bonus_portion: 0.0,
        }
    }
}

wire_model! {
    pub struct FrameHeader {
        pub total_score: i64,
        pub acc: f64,
        pub combo: i32,
        pub max_combo: i32,
        pub statistics: Statistics,
        pub score_processor_statistics: ScoreProcessorStatistics,
        pub received_time: DateTime<Utc>,
        pub mods: Vec<ApiMod>,
    }
}

/// Pressed-button bitmask inside a legacy replay frame. A flags value,
/// not an ordinal: combinations like `LEFT1 | RIGHT1` are valid.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplayButtonState(pub u8);

impl ReplayButtonState {
    pub const NONE: Self = Self(0);
    pub const LEFT1: Self = Self(1);
    pub const RIGHT1: Self = Self(2);
    pub const LEFT2: Self = Self(4);
    pub const RIGHT2: Self = Self(8);
    pub const SMOKE: Self = Self(16);
}

impl WireValue for ReplayButtonState {
    fn to_msgpack(&self) -> rmpv::Value {
        rmpv::Value::from(self.0)
    }

    fn from_msgpack(v: &rmpv::Value) -> Result<Self, WireError> {
        v.as_u64()
            .map(|n| Self(n as u8))
            .ok_or(WireError::expected("integer", "ReplayButtonState"))
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::Value::from(self.0)
    }

    fn from_json(v: &serde_json::Value) -> Result<Self, WireError> {
        v.as_u64()
            .map(|n| Self(n as u8))
            .ok_or(WireError::expected("integer", "ReplayButtonState"))
    }
}

wire_model! {
    pub struct LegacyReplayFrame {
        pub time: i32,
        pub x: Option<f32>,
        pub y: Option<f32>,
        pub button_state: ReplayButtonState,
    }
}

wire_model! {
    pub struct FrameDataBundle {
        pub header: FrameHeader,
        pub frames: Vec<LegacyReplayFrame>,
    }
}
