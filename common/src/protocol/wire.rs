// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: LGPL-3.0-or-later

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// Decode failure in either codec. Carries enough context to log what the
/// peer actually sent without panicking on malformed input.
#[derive(Debug)]
pub enum WireError {
    Expected(&'static str, &'static str),
    Truncated(&'static str),
    UnknownOrdinal(&'static str, u64),
    UnknownTag(&'static str, String),
    UnknownPacketKind(u64),
    Malformed(String),
}

impl WireError {
    pub fn expected(what: &'static str, context: &'static str) -> Self {
        Self::Expected(what, context)
    }
}

impl Display for WireError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expected(what, context) => write!(f, "expected {what} in {context}"),
            Self::Truncated(context) => write!(f, "truncated payload in {context}"),
            Self::UnknownOrdinal(context, n) => write!(f, "unknown ordinal {n} for {context}"),
            Self::UnknownTag(context, tag) => write!(f, "unknown union tag {tag} for {context}"),
            Self::UnknownPacketKind(n) => write!(f, "unknown packet kind {n}"),
            Self::Malformed(s) => write!(f, "malformed payload: {s}"),
        }
    }
}

impl std::error::Error for WireError {}

/// JSON field naming applied to a model: camelCase at the top level,
/// PascalCase inside `$dtype`/`$value` tagged unions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FieldCase {
    Camel,
    Pascal,
}

impl FieldCase {
    pub fn apply(self, snake: &str) -> String {
        let mut out = String::with_capacity(snake.len());
        let mut upper = matches!(self, Self::Pascal);
        for c in snake.chars() {
            if c == '_' {
                upper = true;
            } else if upper {
                out.extend(c.to_uppercase());
                upper = false;
            } else {
                out.push(c);
            }
        }
        out
    }
}

/// A type with a single schema declaration projected onto both wire
/// codecs: positional MessagePack arrays and camelCase JSON objects.
pub trait WireValue: Sized {
    fn to_msgpack(&self) -> rmpv::Value;
    fn from_msgpack(v: &rmpv::Value) -> Result<Self, WireError>;
    fn to_json(&self) -> serde_json::Value;
    fn from_json(v: &serde_json::Value) -> Result<Self, WireError>;
}

/// Map keys need a distinct projection: MessagePack maps key on the raw
/// value, JSON objects key on strings.
pub trait WireKey: Sized + Ord {
    fn to_msgpack_key(&self) -> rmpv::Value;
    fn from_msgpack_key(v: &rmpv::Value) -> Result<Self, WireError>;
    fn to_json_key(&self) -> String;
    fn from_json_key(s: &str) -> Result<Self, WireError>;
}

macro_rules! impl_wire_int {
    ($($ty:ty),*) => {
        $(
            impl WireValue for $ty {
                fn to_msgpack(&self) -> rmpv::Value {
                    rmpv::Value::from(*self as i64)
                }

                fn from_msgpack(v: &rmpv::Value) -> Result<Self, WireError> {
                    v.as_i64()
                        .or_else(|| v.as_u64().map(|n| n as i64))
                        .map(|n| n as $ty)
                        .ok_or(WireError::expected("integer", stringify!($ty)))
                }

                fn to_json(&self) -> serde_json::Value {
                    serde_json::Value::from(*self as i64)
                }

                fn from_json(v: &serde_json::Value) -> Result<Self, WireError> {
                    v.as_i64()
                        .or_else(|| v.as_u64().map(|n| n as i64))
                        .map(|n| n as $ty)
                        .ok_or(WireError::expected("integer", stringify!($ty)))
                }
            }
        )*
    };
}

impl_wire_int!(i8, i16, i32, i64, u8, u16, u32, u64);

macro_rules! impl_wire_float {
    ($($ty:ty),*) => {
        $(
            impl WireValue for $ty {
                fn to_msgpack(&self) -> rmpv::Value {
                    rmpv::Value::from(*self as f64)
                }

                fn from_msgpack(v: &rmpv::Value) -> Result<Self, WireError> {
                    v.as_f64()
                        .map(|n| n as $ty)
                        .ok_or(WireError::expected("float", stringify!($ty)))
                }

                fn to_json(&self) -> serde_json::Value {
                    serde_json::Number::from_f64(*self as f64)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }

                fn from_json(v: &serde_json::Value) -> Result<Self, WireError> {
                    v.as_f64()
                        .map(|n| n as $ty)
                        .ok_or(WireError::expected("float", stringify!($ty)))
                }
            }
        )*
    };
}

impl_wire_float!(f32, f64);

impl WireValue for bool {
    fn to_msgpack(&self) -> rmpv::Value {
        rmpv::Value::from(*self)
    }

    fn from_msgpack(v: &rmpv::Value) -> Result<Self, WireError> {
        v.as_bool().ok_or(WireError::expected("bool", "bool"))
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::Value::from(*self)
    }

    fn from_json(v: &serde_json::Value) -> Result<Self, WireError> {
        v.as_bool().ok_or(WireError::expected("bool", "bool"))
    }
}

impl WireValue for String {
    fn to_msgpack(&self) -> rmpv::Value {
        rmpv::Value::from(self.as_str())
    }

    fn from_msgpack(v: &rmpv::Value) -> Result<Self, WireError> {
        v.as_str()
            .map(str::to_owned)
            .ok_or(WireError::expected("string", "String"))
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::Value::from(self.as_str())
    }

    fn from_json(v: &serde_json::Value) -> Result<Self, WireError> {
        v.as_str()
            .map(str::to_owned)
            .ok_or(WireError::expected("string", "String"))
    }
}

impl<T: WireValue> WireValue for Option<T> {
    fn to_msgpack(&self) -> rmpv::Value {
        match self {
            Some(inner) => inner.to_msgpack(),
            None => rmpv::Value::Nil,
        }
    }

    fn from_msgpack(v: &rmpv::Value) -> Result<Self, WireError> {
        if v.is_nil() {
            Ok(None)
        } else {
            T::from_msgpack(v).map(Some)
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Some(inner) => inner.to_json(),
            None => serde_json::Value::Null,
        }
    }

    fn from_json(v: &serde_json::Value) -> Result<Self, WireError> {
        if v.is_null() {
            Ok(None)
        } else {
            T::from_json(v).map(Some)
        }
    }
}

impl<T: WireValue> WireValue for Vec<T> {
    fn to_msgpack(&self) -> rmpv::Value {
        rmpv::Value::Array(self.iter().map(WireValue::to_msgpack).collect())
    }

    fn from_msgpack(v: &rmpv::Value) -> Result<Self, WireError> {
        v.as_array()
            .ok_or(WireError::expected("array", "Vec"))?
            .iter()
            .map(T::from_msgpack)
            .collect()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(self.iter().map(WireValue::to_json).collect())
    }

    fn from_json(v: &serde_json::Value) -> Result<Self, WireError> {
        v.as_array()
            .ok_or(WireError::expected("array", "Vec"))?
            .iter()
            .map(T::from_json)
            .collect()
    }
}

impl<K: WireKey, V: WireValue> WireValue for BTreeMap<K, V> {
    fn to_msgpack(&self) -> rmpv::Value {
        rmpv::Value::Map(
            self.iter()
                .map(|(k, v)| (k.to_msgpack_key(), v.to_msgpack()))
                .collect(),
        )
    }

    fn from_msgpack(v: &rmpv::Value) -> Result<Self, WireError> {
        v.as_map()
            .ok_or(WireError::expected("map", "BTreeMap"))?
            .iter()
            .map(|(k, v)| Ok((K::from_msgpack_key(k)?, V::from_msgpack(v)?)))
            .collect()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.iter()
                .map(|(k, v)| (k.to_json_key(), v.to_json()))
                .collect(),
        )
    }

    fn from_json(v: &serde_json::Value) -> Result<Self, WireError> {
        v.as_object()
            .ok_or(WireError::expected("object", "BTreeMap"))?
            .iter()
            .map(|(k, v)| Ok((K::from_json_key(k)?, V::from_json(v)?)))
            .collect()
    }
}

impl WireKey for String {
    fn to_msgpack_key(&self) -> rmpv::Value {
        rmpv::Value::from(self.as_str())
    }

    fn from_msgpack_key(v: &rmpv::Value) -> Result<Self, WireError> {
        v.as_str()
            .map(str::to_owned)
            .ok_or(WireError::expected("string key", "String"))
    }

    fn to_json_key(&self) -> String {
        self.clone()
    }

    fn from_json_key(s: &str) -> Result<Self, WireError> {
        Ok(s.to_owned())
    }
}

/// The client encodes timestamps as a 2-element array of a MessagePack
/// timestamp extension and a zero offset; JSON uses ISO-8601.
impl WireValue for DateTime<Utc> {
    fn to_msgpack(&self) -> rmpv::Value {
        rmpv::Value::Array(vec![encode_timestamp(self), rmpv::Value::from(0)])
    }

    fn from_msgpack(v: &rmpv::Value) -> Result<Self, WireError> {
        // Tolerate both the bare extension and the wrapped form.
        let inner = match v.as_array() {
            Some(items) => items.first().ok_or(WireError::Truncated("timestamp"))?,
            None => v,
        };
        decode_timestamp(inner)
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::Value::from(self.to_rfc3339())
    }

    fn from_json(v: &serde_json::Value) -> Result<Self, WireError> {
        let s = v.as_str().ok_or(WireError::expected("string", "timestamp"))?;
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| WireError::Malformed(format!("bad timestamp {s:?}: {e}")))
    }
}

fn encode_timestamp(dt: &DateTime<Utc>) -> rmpv::Value {
    let secs = dt.timestamp();
    let nanos = dt.timestamp_subsec_nanos();
    let data = if nanos == 0 && (0..=u32::MAX as i64).contains(&secs) {
        (secs as u32).to_be_bytes().to_vec()
    } else if (0..1i64 << 34).contains(&secs) {
        (((nanos as u64) << 34) | secs as u64).to_be_bytes().to_vec()
    } else {
        let mut data = Vec::with_capacity(12);
        data.extend_from_slice(&nanos.to_be_bytes());
        data.extend_from_slice(&secs.to_be_bytes());
        data
    };
    rmpv::Value::Ext(-1, data)
}

fn decode_timestamp(v: &rmpv::Value) -> Result<DateTime<Utc>, WireError> {
    let rmpv::Value::Ext(-1, data) = v else {
        return Err(WireError::expected("timestamp extension", "timestamp"));
    };
    let (secs, nanos) = match data.len() {
        4 => (u32::from_be_bytes(data[..4].try_into().unwrap()) as i64, 0),
        8 => {
            let combined = u64::from_be_bytes(data[..8].try_into().unwrap());
            ((combined & ((1 << 34) - 1)) as i64, (combined >> 34) as u32)
        }
        12 => (
            i64::from_be_bytes(data[4..12].try_into().unwrap()),
            u32::from_be_bytes(data[..4].try_into().unwrap()),
        ),
        n => return Err(WireError::Malformed(format!("timestamp extension of {n} bytes"))),
    };
    Utc.timestamp_opt(secs, nanos)
        .single()
        .ok_or_else(|| WireError::Malformed(format!("timestamp out of range: {secs}s")))
}

/// A .NET `TimeSpan` on the wire: 100 ns ticks in MessagePack,
/// `hh:mm:ss` in JSON.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeSpan(pub Duration);

impl TimeSpan {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn ticks(self) -> i64 {
        (self.0.as_nanos() / 100) as i64
    }
}

impl From<Duration> for TimeSpan {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl WireValue for TimeSpan {
    fn to_msgpack(&self) -> rmpv::Value {
        rmpv::Value::from(self.ticks())
    }

    fn from_msgpack(v: &rmpv::Value) -> Result<Self, WireError> {
        let ticks = v.as_i64().ok_or(WireError::expected("integer", "TimeSpan"))?;
        Ok(Self(Duration::from_nanos(ticks.max(0) as u64 * 100)))
    }

    fn to_json(&self) -> serde_json::Value {
        let total = self.0.as_secs();
        serde_json::Value::from(format!(
            "{:02}:{:02}:{:02}",
            total / 3600,
            total / 60 % 60,
            total % 60
        ))
    }

    fn from_json(v: &serde_json::Value) -> Result<Self, WireError> {
        let s = v.as_str().ok_or(WireError::expected("string", "TimeSpan"))?;
        let mut secs = 0u64;
        for part in s.split(':') {
            let n: u64 = part
                .parse()
                .map_err(|_| WireError::Malformed(format!("bad duration {s:?}")))?;
            secs = secs * 60 + n;
        }
        Ok(Self(Duration::from_secs(secs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_case() {
        assert_eq!(FieldCase::Camel.apply("auto_start_duration"), "autoStartDuration");
        assert_eq!(FieldCase::Pascal.apply("beatmap_id"), "BeatmapId");
        assert_eq!(FieldCase::Camel.apply("state"), "state");
        assert_eq!(FieldCase::Pascal.apply("state"), "State");
    }

    #[test]
    fn timestamp_representations() {
        let small = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert!(matches!(encode_timestamp(&small), rmpv::Value::Ext(-1, ref d) if d.len() == 4));
        assert_eq!(decode_timestamp(&encode_timestamp(&small)).unwrap(), small);

        let nanos = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        assert!(matches!(encode_timestamp(&nanos), rmpv::Value::Ext(-1, ref d) if d.len() == 8));
        assert_eq!(decode_timestamp(&encode_timestamp(&nanos)).unwrap(), nanos);

        let ancient = Utc.timestamp_opt(-1, 5).unwrap();
        assert!(matches!(encode_timestamp(&ancient), rmpv::Value::Ext(-1, ref d) if d.len() == 12));
        assert_eq!(decode_timestamp(&encode_timestamp(&ancient)).unwrap(), ancient);
    }

    #[test]
    fn timespan_json() {
        let span = TimeSpan(Duration::from_secs(2 * 3600 + 3 * 60 + 4));
        assert_eq!(span.to_json(), serde_json::json!("02:03:04"));
        assert_eq!(TimeSpan::from_json(&span.to_json()).unwrap(), span);
        assert_eq!(
            TimeSpan::from_json(&serde_json::json!("45")).unwrap(),
            TimeSpan(Duration::from_secs(45))
        );
    }
}
