// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: LGPL-3.0-or-later

//! The SignalR-compatible wire layer: packet shapes, the two framing
//! codecs, and the schema bridge between native types and both encodings.

pub(crate) mod macros;

mod json;
mod messagepack;
#[cfg(test)]
mod tests;
mod wire;

pub use wire::{FieldCase, TimeSpan, WireError, WireKey, WireValue};

use serde::{Deserialize, Serialize};

/// Record separator terminating JSON frames and the handshake.
pub const RECORD_SEPARATOR: u8 = 0x1e;

pub const KIND_INVOCATION: u64 = 1;
pub const KIND_COMPLETION: u64 = 3;
pub const KIND_PING: u64 = 6;
pub const KIND_CLOSE: u64 = 7;

/// Which codec a connection negotiated during its handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecKind {
    MessagePack,
    Json,
}

impl CodecKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "messagepack" => Some(Self::MessagePack),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// An argument or result arriving from a client, still in the dynamic
/// representation of whichever codec the connection speaks.
#[derive(Clone, Debug)]
pub enum WireIn {
    MessagePack(rmpv::Value),
    Json(serde_json::Value),
}

impl WireIn {
    pub fn parse<T: WireValue>(&self) -> Result<T, WireError> {
        match self {
            Self::MessagePack(v) => T::from_msgpack(v),
            Self::Json(v) => T::from_json(v),
        }
    }
}

/// An outbound value pre-projected onto both codecs, so one broadcast can
/// serve clients on either without re-walking the model per recipient.
#[derive(Clone, Debug)]
pub struct WireOut {
    pub msgpack: rmpv::Value,
    pub json: serde_json::Value,
}

impl WireOut {
    pub fn of<T: WireValue>(value: &T) -> Self {
        Self {
            msgpack: value.to_msgpack(),
            json: value.to_json(),
        }
    }
}

/// One hub packet. `V` is [`WireIn`] on the receive path and [`WireOut`]
/// on the send path.
#[derive(Clone, Debug)]
pub enum Packet<V> {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<V>,
        stream_ids: Option<Vec<String>>,
    },
    Completion {
        invocation_id: String,
        error: Option<String>,
        result: Option<V>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

impl Packet<WireOut> {
    pub fn invocation(invocation_id: Option<String>, target: &str, arguments: Vec<WireOut>) -> Self {
        Self::Invocation {
            invocation_id,
            target: target.to_owned(),
            arguments,
            stream_ids: None,
        }
    }

    pub fn completion(invocation_id: String, error: Option<String>, result: Option<WireOut>) -> Self {
        Self::Completion {
            invocation_id,
            error,
            result,
        }
    }

    pub fn encode(&self, codec: CodecKind) -> Vec<u8> {
        match codec {
            CodecKind::MessagePack => messagepack::encode(self),
            CodecKind::Json => json::encode(self),
        }
    }
}

impl Packet<WireIn> {
    pub fn decode(data: &[u8], codec: CodecKind) -> Result<Vec<Self>, WireError> {
        match codec {
            CodecKind::MessagePack => messagepack::decode(data),
            CodecKind::Json => json::decode(data),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HandshakeRequest {
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub version: u32,
}

/// Parses the record-separator-terminated handshake frame.
pub fn parse_handshake(data: &[u8]) -> Result<HandshakeRequest, WireError> {
    let data = data.strip_suffix(&[RECORD_SEPARATOR]).unwrap_or(data);
    serde_json::from_slice(data).map_err(|e| WireError::Malformed(format!("bad handshake: {e}")))
}

/// The server's handshake reply: `{}` on success, `{"error": ...}` otherwise.
pub fn handshake_response(error: Option<&str>) -> Vec<u8> {
    let body = match error {
        Some(error) => serde_json::json!({ "error": error }),
        None => serde_json::json!({}),
    };
    let mut out = serde_json::to_vec(&body).unwrap();
    out.push(RECORD_SEPARATOR);
    out
}
