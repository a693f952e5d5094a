// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: LGPL-3.0-or-later

//! Shared wire protocol and hub models for the cadence server: the
//! SignalR-compatible packet layer with its MessagePack/JSON codec pair,
//! and the strongly-typed models both sides of the socket agree on.

mod id;

pub mod metadata;
pub mod mods;
pub mod multiplayer;
pub mod protocol;
pub mod spectator;

pub use id::{
    BeatmapId, ChannelId, CountdownId, PlaylistItemId, RoomId, RulesetId, ScoreId, ScoreTokenId,
    TeamId, UserId,
};
