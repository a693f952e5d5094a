// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: LGPL-3.0-or-later

use crate::protocol::macros::wire_model;
use crate::protocol::{WireError, WireKey, WireValue};
use std::collections::BTreeMap;

/// A mod setting value. The client sends free-form scalars here (speed
/// multipliers, flags, seed strings), so this is the one deliberately
/// dynamic leaf in the schema.
#[derive(Clone, Debug, PartialEq)]
pub enum ModSetting {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl WireValue for ModSetting {
    fn to_msgpack(&self) -> rmpv::Value {
        match self {
            Self::Bool(v) => rmpv::Value::from(*v),
            Self::Int(v) => rmpv::Value::from(*v),
            Self::Float(v) => rmpv::Value::from(*v),
            Self::Text(v) => rmpv::Value::from(v.as_str()),
        }
    }

    fn from_msgpack(v: &rmpv::Value) -> Result<Self, WireError> {
        match v {
            rmpv::Value::Boolean(b) => Ok(Self::Bool(*b)),
            rmpv::Value::Integer(_) => Ok(Self::Int(v.as_i64().unwrap_or_default())),
            rmpv::Value::F32(f) => Ok(Self::Float(f64::from(*f))),
            rmpv::Value::F64(f) => Ok(Self::Float(*f)),
            rmpv::Value::String(s) => Ok(Self::Text(s.as_str().unwrap_or_default().to_owned())),
            _ => Err(WireError::expected("scalar", "ModSetting")),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(v) => serde_json::Value::from(*v),
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Value::from(*v),
            Self::Text(v) => serde_json::Value::from(v.as_str()),
        }
    }

    fn from_json(v: &serde_json::Value) -> Result<Self, WireError> {
        match v {
            serde_json::Value::Bool(b) => Ok(Self::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else {
                    Ok(Self::Float(n.as_f64().unwrap_or_default()))
                }
            }
            serde_json::Value::String(s) => Ok(Self::Text(s.clone())),
            _ => Err(WireError::expected("scalar", "ModSetting")),
        }
    }
}

wire_model! {
    /// A gameplay modifier: an acronym plus its settings object.
    pub struct ApiMod {
        pub acronym: String,
        pub settings: BTreeMap<String, ModSetting>,
    }
}

impl ApiMod {
    pub fn new(acronym: &str) -> Self {
        Self {
            acronym: acronym.to_owned(),
            settings: BTreeMap::new(),
        }
    }
}

impl Default for ApiMod {
    fn default() -> Self {
        Self::new("")
    }
}

/// Legacy replay headers carry mods as the classic bitmask. Unmapped
/// acronyms simply contribute no bits.
pub fn legacy_mods_bitmask(mods: &[ApiMod]) -> i32 {
    let mut bits = 0;
    for m in mods {
        bits |= match m.acronym.as_str() {
            "NF" => 1,
            "EZ" => 1 << 1,
            "TD" => 1 << 2,
            "HD" => 1 << 3,
            "HR" => 1 << 4,
            "SD" => 1 << 5,
            "DT" => 1 << 6,
            "RX" => 1 << 7,
            "HT" => 1 << 8,
            // Nightcore implies double time.
            "NC" => (1 << 9) | (1 << 6),
            "FL" => 1 << 10,
            "AT" => 1 << 11,
            "SO" => 1 << 12,
            "AP" => 1 << 13,
            // Perfect implies sudden death.
            "PF" => (1 << 14) | (1 << 5),
            _ => 0,
        };
    }
    bits
}

/// A scoring judgement. Discriminants are the client's wire values; they
/// are not contiguous, so this is not an ordinal enum.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum HitResult {
    None = 0,
    Miss = 1,
    Meh = 2,
    Ok = 3,
    Good = 4,
    Great = 5,
    Perfect = 6,
    SmallTickMiss = 7,
    SmallTickHit = 8,
    LargeTickMiss = 9,
    LargeTickHit = 10,
    SmallBonus = 11,
    LargeBonus = 12,
    IgnoreMiss = 13,
    IgnoreHit = 14,
    ComboBreak = 15,
    SliderTailHit = 16,
    LegacyComboIncrease = 99,
}

impl HitResult {
    pub fn from_value(n: u64) -> Option<Self> {
        Some(match n {
            0 => Self::None,
            1 => Self::Miss,
            2 => Self::Meh,
            3 => Self::Ok,
            4 => Self::Good,
            5 => Self::Great,
            6 => Self::Perfect,
            7 => Self::SmallTickMiss,
            8 => Self::SmallTickHit,
            9 => Self::LargeTickMiss,
            10 => Self::LargeTickHit,
            11 => Self::SmallBonus,
            12 => Self::LargeBonus,
            13 => Self::IgnoreMiss,
            14 => Self::IgnoreHit,
            15 => Self::ComboBreak,
            16 => Self::SliderTailHit,
            99 => Self::LegacyComboIncrease,
            _ => return None,
        })
    }

    pub fn value(self) -> u64 {
        self as u64
    }

    /// Snake-case name used in JSON score bodies (the replay trailer
    /// among them).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Miss => "miss",
            Self::Meh => "meh",
            Self::Ok => "ok",
            Self::Good => "good",
            Self::Great => "great",
            Self::Perfect => "perfect",
            Self::SmallTickMiss => "small_tick_miss",
            Self::SmallTickHit => "small_tick_hit",
            Self::LargeTickMiss => "large_tick_miss",
            Self::LargeTickHit => "large_tick_hit",
            Self::SmallBonus => "small_bonus",
            Self::LargeBonus => "large_bonus",
            Self::IgnoreMiss => "ignore_miss",
            Self::IgnoreHit => "ignore_hit",
            Self::ComboBreak => "combo_break",
            Self::SliderTailHit => "slider_tail_hit",
            Self::LegacyComboIncrease => "legacy_combo_increase",
        }
    }

    /// Whether this judgement represents contact with a hit object.
    pub fn is_hit(self) -> bool {
        matches!(
            self,
            Self::Meh
                | Self::Ok
                | Self::Good
                | Self::Great
                | Self::Perfect
                | Self::SmallTickHit
                | Self::LargeTickHit
                | Self::SmallBonus
                | Self::LargeBonus
                | Self::IgnoreHit
                | Self::SliderTailHit
        )
    }
}

impl WireValue for HitResult {
    fn to_msgpack(&self) -> rmpv::Value {
        rmpv::Value::from(self.value())
    }

    fn from_msgpack(v: &rmpv::Value) -> Result<Self, WireError> {
        let n = v.as_u64().ok_or(WireError::expected("integer", "HitResult"))?;
        Self::from_value(n).ok_or(WireError::UnknownOrdinal("HitResult", n))
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::Value::from(self.value())
    }

    fn from_json(v: &serde_json::Value) -> Result<Self, WireError> {
        let n = v.as_u64().ok_or(WireError::expected("integer", "HitResult"))?;
        Self::from_value(n).ok_or(WireError::UnknownOrdinal("HitResult", n))
    }
}

/// Statistics maps key on the judgement: raw value in MessagePack,
/// stringified value in JSON (object keys must be strings).
impl WireKey for HitResult {
    fn to_msgpack_key(&self) -> rmpv::Value {
        rmpv::Value::from(self.value())
    }

    fn from_msgpack_key(v: &rmpv::Value) -> Result<Self, WireError> {
        Self::from_msgpack(v)
    }

    fn to_json_key(&self) -> String {
        self.value().to_string()
    }

    fn from_json_key(s: &str) -> Result<Self, WireError> {
        let n: u64 = s
            .parse()
            .map_err(|_| WireError::expected("numeric key", "HitResult"))?;
        Self::from_value(n).ok_or(WireError::UnknownOrdinal("HitResult", n))
    }
}

pub type Statistics = BTreeMap<HitResult, u32>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmask_implications() {
        assert_eq!(legacy_mods_bitmask(&[ApiMod::new("HD")]), 8);
        // NC carries the DT bit, PF the SD bit.
        assert_eq!(legacy_mods_bitmask(&[ApiMod::new("NC")]), 512 | 64);
        assert_eq!(legacy_mods_bitmask(&[ApiMod::new("PF")]), 16384 | 32);
        assert_eq!(legacy_mods_bitmask(&[ApiMod::new("WTF")]), 0);
    }

    #[test]
    fn hit_result_values_round_trip() {
        for n in (0..=16).chain([99]) {
            let hit = HitResult::from_value(n).unwrap();
            assert_eq!(hit.value(), n);
        }
        assert!(HitResult::from_value(17).is_none());
        assert!(HitResult::Great.is_hit());
        assert!(!HitResult::Miss.is_hit());
        assert!(!HitResult::ComboBreak.is_hit());
    }
}
