// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: LGPL-3.0-or-later

//! MessagePack framing: each packet is a LEB128-varint length prefix
//! followed by a MessagePack array whose first element is the kind tag.

use super::{
    Packet, WireError, WireIn, WireOut, KIND_CLOSE, KIND_COMPLETION, KIND_INVOCATION, KIND_PING,
};
use rmpv::Value;

/// Completion result kinds on the wire.
const RESULT_ERROR: u64 = 1;
const RESULT_VOID: u64 = 2;
const RESULT_NON_VOID: u64 = 3;

pub fn encode(packet: &Packet<WireOut>) -> Vec<u8> {
    let payload = match packet {
        Packet::Ping => vec![Value::from(KIND_PING)],
        Packet::Invocation {
            invocation_id,
            target,
            arguments,
            stream_ids,
        } => {
            let mut payload = vec![
                Value::from(KIND_INVOCATION),
                Value::Map(Vec::new()),
                match invocation_id {
                    Some(id) => Value::from(id.as_str()),
                    None => Value::Nil,
                },
                Value::from(target.as_str()),
                Value::Array(arguments.iter().map(|a| a.msgpack.clone()).collect()),
            ];
            if let Some(stream_ids) = stream_ids {
                payload.push(Value::Array(
                    stream_ids.iter().map(|id| Value::from(id.as_str())).collect(),
                ));
            }
            payload
        }
        Packet::Completion {
            invocation_id,
            error,
            result,
        } => {
            let (kind, value) = match (error, result) {
                (Some(error), _) => (RESULT_ERROR, Value::from(error.as_str())),
                (None, Some(result)) => (RESULT_NON_VOID, result.msgpack.clone()),
                (None, None) => (RESULT_VOID, Value::Nil),
            };
            let mut payload = vec![
                Value::from(KIND_COMPLETION),
                Value::Map(Vec::new()),
                Value::from(invocation_id.as_str()),
                Value::from(kind),
            ];
            if kind != RESULT_VOID {
                payload.push(value);
            }
            payload
        }
        Packet::Close {
            error,
            allow_reconnect,
        } => vec![
            Value::from(KIND_CLOSE),
            Value::from(error.as_deref().unwrap_or("")),
            Value::from(*allow_reconnect),
        ],
    };

    let mut body = Vec::new();
    rmpv::encode::write_value(&mut body, &Value::Array(payload)).unwrap();
    let mut out = encode_varint(body.len() as u64);
    out.extend_from_slice(&body);
    out
}

pub fn decode(data: &[u8]) -> Result<Vec<Packet<WireIn>>, WireError> {
    let mut packets = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let (length, consumed) = decode_varint(rest)?;
        rest = &rest[consumed..];
        if rest.len() < length as usize {
            return Err(WireError::Truncated("frame"));
        }
        let (frame, tail) = rest.split_at(length as usize);
        packets.push(decode_frame(frame)?);
        rest = tail;
    }
    Ok(packets)
}

fn decode_frame(mut frame: &[u8]) -> Result<Packet<WireIn>, WireError> {
    let value = rmpv::decode::read_value(&mut frame)
        .map_err(|e| WireError::Malformed(format!("bad msgpack frame: {e}")))?;
    let items = value
        .as_array()
        .ok_or(WireError::expected("array", "packet"))?;
    let kind = items
        .first()
        .and_then(Value::as_u64)
        .ok_or(WireError::expected("kind tag", "packet"))?;
    match kind {
        KIND_PING => Ok(Packet::Ping),
        KIND_INVOCATION => {
            let invocation_id = match items.get(2) {
                Some(Value::String(s)) => s.as_str().map(str::to_owned),
                _ => None,
            };
            let target = items
                .get(3)
                .and_then(Value::as_str)
                .ok_or(WireError::expected("target", "invocation"))?
                .to_owned();
            let arguments = match items.get(4) {
                Some(Value::Array(args)) => {
                    args.iter().cloned().map(WireIn::MessagePack).collect()
                }
                _ => Vec::new(),
            };
            let stream_ids = match items.get(5) {
                Some(Value::Array(ids)) => Some(
                    ids.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect(),
                ),
                _ => None,
            };
            Ok(Packet::Invocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            })
        }
        KIND_COMPLETION => {
            let invocation_id = items
                .get(2)
                .and_then(Value::as_str)
                .ok_or(WireError::expected("invocation id", "completion"))?
                .to_owned();
            let result_kind = items
                .get(3)
                .and_then(Value::as_u64)
                .ok_or(WireError::expected("result kind", "completion"))?;
            let (error, result) = match result_kind {
                RESULT_ERROR => (
                    items.get(4).and_then(Value::as_str).map(str::to_owned),
                    None,
                ),
                RESULT_NON_VOID => (None, items.get(4).cloned().map(WireIn::MessagePack)),
                _ => (None, None),
            };
            Ok(Packet::Completion {
                invocation_id,
                error,
                result,
            })
        }
        KIND_CLOSE => {
            let error = items
                .get(1)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_owned);
            let allow_reconnect = items.get(2).and_then(Value::as_bool).unwrap_or(false);
            Ok(Packet::Close {
                error,
                allow_reconnect,
            })
        }
        other => Err(WireError::UnknownPacketKind(other)),
    }
}

pub fn encode_varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(2);
    while value >= 0x80 {
        out.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
    out
}

/// Returns the decoded value and the number of bytes consumed.
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize), WireError> {
    let mut result = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
        if shift > 63 {
            break;
        }
    }
    Err(WireError::Truncated("varint"))
}
