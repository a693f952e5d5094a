// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: LGPL-3.0-or-later

//! The schema bridge: each hub model is declared once and projected onto
//! both codecs. `wire_model!` lays fields out as a positional MessagePack
//! array and a camelCase JSON object, `wire_enum!` encodes variants by
//! ordinal, and `wire_union!` produces `[tag, payload]` / `$dtype`-tagged
//! encodings for the sealed unions the client expects.

macro_rules! wire_model {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* pub $field:ident : $ty:ty, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl $crate::protocol::WireValue for $name {
            fn to_msgpack(&self) -> rmpv::Value {
                rmpv::Value::Array(vec![$( $crate::protocol::WireValue::to_msgpack(&self.$field), )*])
            }

            fn from_msgpack(v: &rmpv::Value) -> Result<Self, $crate::protocol::WireError> {
                let items = v
                    .as_array()
                    .ok_or($crate::protocol::WireError::expected("array", stringify!($name)))?;
                let mut items = items.iter();
                Ok(Self {
                    $(
                        $field: match items.next() {
                            Some(item) => $crate::protocol::WireValue::from_msgpack(item)?,
                            None => {
                                return Err($crate::protocol::WireError::Truncated(stringify!($name)));
                            }
                        },
                    )*
                })
            }

            fn to_json(&self) -> serde_json::Value {
                self.to_json_object($crate::protocol::FieldCase::Camel)
            }

            fn from_json(v: &serde_json::Value) -> Result<Self, $crate::protocol::WireError> {
                Self::from_json_object(v, $crate::protocol::FieldCase::Camel)
            }
        }

        impl $name {
            #[allow(unused)]
            pub fn to_json_object(&self, case: $crate::protocol::FieldCase) -> serde_json::Value {
                #[allow(unused_mut)]
                let mut map = serde_json::Map::new();
                $(
                    map.insert(
                        case.apply(stringify!($field)),
                        $crate::protocol::WireValue::to_json(&self.$field),
                    );
                )*
                serde_json::Value::Object(map)
            }

            #[allow(unused)]
            pub fn from_json_object(
                v: &serde_json::Value,
                case: $crate::protocol::FieldCase,
            ) -> Result<Self, $crate::protocol::WireError> {
                let map = v
                    .as_object()
                    .ok_or($crate::protocol::WireError::expected("object", stringify!($name)))?;
                Ok(Self {
                    $(
                        $field: {
                            // Absent fields decode as null so optional
                            // members may be omitted.
                            let key = case.apply(stringify!($field));
                            let item = map.get(key.as_str()).unwrap_or(&serde_json::Value::Null);
                            $crate::protocol::WireValue::from_json(item)?
                        },
                    )*
                })
            }
        }
    };
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum $name {
            #[default]
            $( $(#[$vmeta])* $variant, )*
        }

        impl $name {
            pub const VARIANTS: &'static [$name] = &[$( $name::$variant, )*];

            pub fn ordinal(self) -> u64 {
                self as u64
            }

            pub fn from_ordinal(n: u64) -> Option<Self> {
                Self::VARIANTS.get(n as usize).copied()
            }
        }

        impl $crate::protocol::WireValue for $name {
            fn to_msgpack(&self) -> rmpv::Value {
                rmpv::Value::from(self.ordinal())
            }

            fn from_msgpack(v: &rmpv::Value) -> Result<Self, $crate::protocol::WireError> {
                let n = v
                    .as_u64()
                    .ok_or($crate::protocol::WireError::expected("ordinal", stringify!($name)))?;
                Self::from_ordinal(n)
                    .ok_or($crate::protocol::WireError::UnknownOrdinal(stringify!($name), n))
            }

            fn to_json(&self) -> serde_json::Value {
                serde_json::Value::from(self.ordinal())
            }

            fn from_json(v: &serde_json::Value) -> Result<Self, $crate::protocol::WireError> {
                let n = v
                    .as_u64()
                    .ok_or($crate::protocol::WireError::expected("ordinal", stringify!($name)))?;
                Self::from_ordinal(n)
                    .ok_or($crate::protocol::WireError::UnknownOrdinal(stringify!($name), n))
            }
        }
    };
}

macro_rules! wire_union {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $variant:ident($payload:ident) = $tag:literal, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub enum $name {
            $( $variant($payload), )*
        }

        impl $crate::protocol::WireValue for $name {
            fn to_msgpack(&self) -> rmpv::Value {
                match self {
                    $(
                        Self::$variant(inner) => rmpv::Value::Array(vec![
                            rmpv::Value::from($tag as u64),
                            $crate::protocol::WireValue::to_msgpack(inner),
                        ]),
                    )*
                }
            }

            fn from_msgpack(v: &rmpv::Value) -> Result<Self, $crate::protocol::WireError> {
                let items = v
                    .as_array()
                    .ok_or($crate::protocol::WireError::expected("union array", stringify!($name)))?;
                let tag = items
                    .first()
                    .and_then(rmpv::Value::as_u64)
                    .ok_or($crate::protocol::WireError::expected("union tag", stringify!($name)))?;
                let payload = items
                    .get(1)
                    .ok_or($crate::protocol::WireError::Truncated(stringify!($name)))?;
                match tag {
                    $(
                        $tag => Ok(Self::$variant($crate::protocol::WireValue::from_msgpack(payload)?)),
                    )*
                    other => Err($crate::protocol::WireError::UnknownTag(
                        stringify!($name),
                        other.to_string(),
                    )),
                }
            }

            fn to_json(&self) -> serde_json::Value {
                match self {
                    $(
                        Self::$variant(inner) => {
                            let mut map = serde_json::Map::new();
                            map.insert("$dtype".to_owned(), serde_json::Value::from(stringify!($payload)));
                            map.insert(
                                "$value".to_owned(),
                                inner.to_json_object($crate::protocol::FieldCase::Pascal),
                            );
                            serde_json::Value::Object(map)
                        }
                    )*
                }
            }

            fn from_json(v: &serde_json::Value) -> Result<Self, $crate::protocol::WireError> {
                let map = v
                    .as_object()
                    .ok_or($crate::protocol::WireError::expected("union object", stringify!($name)))?;
                let dtype = map
                    .get("$dtype")
                    .and_then(serde_json::Value::as_str)
                    .ok_or($crate::protocol::WireError::expected("$dtype", stringify!($name)))?;
                let payload = map
                    .get("$value")
                    .ok_or($crate::protocol::WireError::expected("$value", stringify!($name)))?;
                match dtype {
                    $(
                        stringify!($payload) => Ok(Self::$variant($payload::from_json_object(
                            payload,
                            $crate::protocol::FieldCase::Pascal,
                        )?)),
                    )*
                    other => Err($crate::protocol::WireError::UnknownTag(
                        stringify!($name),
                        other.to_owned(),
                    )),
                }
            }
        }
    };
}

pub(crate) use {wire_enum, wire_model, wire_union};
