// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: LGPL-3.0-or-later

use crate::protocol::{WireError, WireValue};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(
            Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = <$inner as FromStr>::Err;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }

        impl WireValue for $name {
            fn to_msgpack(&self) -> rmpv::Value {
                self.0.to_msgpack()
            }

            fn from_msgpack(v: &rmpv::Value) -> Result<Self, WireError> {
                WireValue::from_msgpack(v).map(Self)
            }

            fn to_json(&self) -> serde_json::Value {
                self.0.to_json()
            }

            fn from_json(v: &serde_json::Value) -> Result<Self, WireError> {
                WireValue::from_json(v).map(Self)
            }
        }
    };
}

define_id!(UserId(i64));
define_id!(RoomId(i64));
define_id!(ChannelId(i64));
define_id!(PlaylistItemId(i64));
define_id!(BeatmapId(i64));
define_id!(ScoreId(i64));
define_id!(ScoreTokenId(i64));
define_id!(
    /// Countdown ids are only unique within their room.
    CountdownId(i32)
);
define_id!(RulesetId(i32));
define_id!(TeamId(i32));
