// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: LGPL-3.0-or-later

//! JSON framing: one object per packet, each terminated by the record
//! separator byte.

use super::{
    Packet, WireError, WireIn, WireOut, KIND_CLOSE, KIND_COMPLETION, KIND_INVOCATION, KIND_PING,
    RECORD_SEPARATOR,
};
use serde_json::{json, Value};

pub fn encode(packet: &Packet<WireOut>) -> Vec<u8> {
    let payload = match packet {
        Packet::Ping => json!({ "type": KIND_PING }),
        Packet::Invocation {
            invocation_id,
            target,
            arguments,
            stream_ids,
        } => {
            let mut payload = json!({
                "type": KIND_INVOCATION,
                "target": target,
                "arguments": arguments.iter().map(|a| a.json.clone()).collect::<Vec<_>>(),
            });
            let map = payload.as_object_mut().unwrap();
            if let Some(id) = invocation_id {
                map.insert("invocationId".to_owned(), Value::from(id.as_str()));
            }
            if let Some(stream_ids) = stream_ids {
                map.insert("streamIds".to_owned(), json!(stream_ids));
            }
            payload
        }
        Packet::Completion {
            invocation_id,
            error,
            result,
        } => {
            let mut payload = json!({
                "type": KIND_COMPLETION,
                "invocationId": invocation_id,
            });
            let map = payload.as_object_mut().unwrap();
            if let Some(error) = error {
                map.insert("error".to_owned(), Value::from(error.as_str()));
            } else if let Some(result) = result {
                map.insert("result".to_owned(), result.json.clone());
            }
            payload
        }
        Packet::Close {
            error,
            allow_reconnect,
        } => {
            let mut payload = json!({
                "type": KIND_CLOSE,
                "allowReconnect": allow_reconnect,
            });
            if let Some(error) = error {
                payload
                    .as_object_mut()
                    .unwrap()
                    .insert("error".to_owned(), Value::from(error.as_str()));
            }
            payload
        }
    };
    let mut out = serde_json::to_vec(&payload).unwrap();
    out.push(RECORD_SEPARATOR);
    out
}

pub fn decode(data: &[u8]) -> Result<Vec<Packet<WireIn>>, WireError> {
    data.split(|&b| b == RECORD_SEPARATOR)
        .filter(|frame| !frame.is_empty())
        .map(decode_frame)
        .collect()
}

fn decode_frame(frame: &[u8]) -> Result<Packet<WireIn>, WireError> {
    let value: Value = serde_json::from_slice(frame)
        .map_err(|e| WireError::Malformed(format!("bad json frame: {e}")))?;
    let kind = value
        .get("type")
        .and_then(Value::as_u64)
        .ok_or(WireError::expected("kind tag", "packet"))?;
    match kind {
        KIND_PING => Ok(Packet::Ping),
        KIND_INVOCATION => Ok(Packet::Invocation {
            invocation_id: value
                .get("invocationId")
                .and_then(Value::as_str)
                .map(str::to_owned),
            target: value
                .get("target")
                .and_then(Value::as_str)
                .ok_or(WireError::expected("target", "invocation"))?
                .to_owned(),
            arguments: value
                .get("arguments")
                .and_then(Value::as_array)
                .map(|args| args.iter().cloned().map(WireIn::Json).collect())
                .unwrap_or_default(),
            stream_ids: value.get("streamIds").and_then(Value::as_array).map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            }),
        }),
        KIND_COMPLETION => Ok(Packet::Completion {
            invocation_id: value
                .get("invocationId")
                .and_then(Value::as_str)
                .ok_or(WireError::expected("invocation id", "completion"))?
                .to_owned(),
            error: value.get("error").and_then(Value::as_str).map(str::to_owned),
            result: value.get("result").cloned().map(WireIn::Json),
        }),
        KIND_CLOSE => Ok(Packet::Close {
            error: value.get("error").and_then(Value::as_str).map(str::to_owned),
            allow_reconnect: value
                .get("allowReconnect")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        other => Err(WireError::UnknownPacketKind(other)),
    }
}
