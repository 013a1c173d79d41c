//! MessagePack wire protocol: each frame is a MessagePack array, positional
//! rather than tagged, prefixed by an unsigned LEB128 varint byte length.
//!
//! The handshake request/response is always JSON regardless of the chosen
//! message protocol, so [`MsgpackProtocol::decode_handshake`] splits on the
//! first record separator the same way [`super::json`] does, then decodes
//! everything after it as length-prefixed MessagePack frames.

use super::Protocol;
use crate::error::CodecError;
use crate::messages::{HandshakeRequest, HandshakeResponse, Message};
use rmpv::Value;

const RECORD_SEPARATOR: u8 = 0x1E;

#[derive(Debug, Default, Clone, Copy)]
pub struct MsgpackProtocol;

impl Protocol for MsgpackProtocol {
    fn name(&self) -> &'static str {
        "messagepack"
    }

    fn version(&self) -> u8 {
        1
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let value = to_positional_array(message)?;
        let mut body = Vec::new();
        rmpv::encode::write_value(&mut body, &value)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        let mut out = to_varint(body.len() as u64);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decode(&self, buf: &[u8]) -> Result<Vec<Message>, CodecError> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            let (len, consumed) = from_varint(&buf[offset..])?;
            offset += consumed;
            let end = offset
                .checked_add(len as usize)
                .filter(|&e| e <= buf.len())
                .ok_or(CodecError::Truncated)?;
            let slice = &buf[offset..end];
            offset = end;
            let value = rmpv::decode::read_value(&mut &slice[..])
                .map_err(|e| CodecError::Malformed(e.to_string()))?;
            out.push(from_positional_array(value)?);
        }
        Ok(out)
    }

    fn decode_handshake(
        &self,
        buf: &[u8],
    ) -> Result<(HandshakeResponse, Vec<Message>), CodecError> {
        let sep = buf
            .iter()
            .position(|&b| b == RECORD_SEPARATOR)
            .ok_or(CodecError::Truncated)?;
        let head = &buf[..sep];
        let response: HandshakeResponse =
            serde_json::from_slice(head).map_err(|e| CodecError::Malformed(e.to_string()))?;
        let rest = &buf[sep + 1..];
        let trailing = if rest.is_empty() {
            Vec::new()
        } else {
            self.decode(rest)?
        };
        Ok((response, trailing))
    }
}

/// Encode the handshake request as JSON, framed with the record separator —
/// the handshake is never MessagePack, even on this protocol.
pub fn encode_handshake(req: &HandshakeRequest) -> Result<Vec<u8>, CodecError> {
    let mut bytes =
        serde_json::to_vec(req).map_err(|e| CodecError::Malformed(e.to_string()))?;
    bytes.push(RECORD_SEPARATOR);
    Ok(bytes)
}

/// Unsigned LEB128: 7 payload bits per byte, MSB set while more bytes follow.
pub fn to_varint(mut n: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (n & 0x7f) as u8;
        n >>= 7;
        if n != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if n == 0 {
            break;
        }
    }
    out
}

fn from_varint(buf: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in buf.iter().enumerate() {
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }
    Err(CodecError::Truncated)
}

fn headers_value(headers: &Option<crate::messages::Headers>) -> Value {
    match headers {
        None => Value::Map(vec![]),
        Some(h) => Value::Map(
            h.iter()
                .map(|(k, v)| (Value::from(k.as_str()), Value::from(v.as_str())))
                .collect(),
        ),
    }
}

fn json_to_rmpv(v: &serde_json::Value) -> Value {
    rmpv::ext::to_value(v).unwrap_or(Value::Nil)
}

fn rmpv_to_json(v: &Value) -> serde_json::Value {
    rmpv::ext::from_value(v.clone()).unwrap_or(serde_json::Value::Null)
}

fn to_positional_array(message: &Message) -> Result<Value, CodecError> {
    let arr = match message {
        Message::Invocation {
            invocation_id,
            target,
            arguments,
            headers,
        } => vec![
            Value::from(1),
            headers_value(headers),
            invocation_id
                .as_deref()
                .map(Value::from)
                .unwrap_or(Value::Nil),
            Value::from(target.as_str()),
            Value::Array(arguments.iter().map(json_to_rmpv).collect()),
            Value::Array(vec![]),
        ],
        Message::InvocationClientStream {
            stream_ids,
            target,
            arguments,
            headers,
        } => vec![
            Value::from(1),
            headers_value(headers),
            Value::Nil,
            Value::from(target.as_str()),
            Value::Array(arguments.iter().map(json_to_rmpv).collect()),
            Value::Array(stream_ids.iter().map(|s| Value::from(s.as_str())).collect()),
        ],
        Message::StreamItem {
            invocation_id,
            item,
            headers,
        } => vec![
            Value::from(2),
            headers_value(headers),
            Value::from(invocation_id.as_str()),
            json_to_rmpv(item),
        ],
        Message::Completion {
            invocation_id,
            result,
            error,
            headers,
        } => {
            let (result_kind, payload) = match (error, result) {
                (Some(e), _) => (1, Value::from(e.as_str())),
                (None, None) => (2, Value::Nil),
                (None, Some(r)) => (3, json_to_rmpv(r)),
            };
            vec![
                Value::from(3),
                headers_value(headers),
                Value::from(invocation_id.as_str()),
                Value::from(result_kind),
                payload,
            ]
        }
        Message::StreamInvocation {
            invocation_id,
            target,
            arguments,
            headers,
        } => vec![
            Value::from(4),
            headers_value(headers),
            Value::from(invocation_id.as_str()),
            Value::from(target.as_str()),
            Value::Array(arguments.iter().map(json_to_rmpv).collect()),
            Value::Array(vec![]),
        ],
        Message::CancelInvocation {
            invocation_id,
            headers,
        } => vec![
            Value::from(5),
            headers_value(headers),
            Value::from(invocation_id.as_str()),
        ],
        Message::Ping => vec![Value::from(6)],
        Message::Close {
            error,
            allow_reconnect,
            headers: _,
        } => {
            let mut v = vec![
                Value::from(7),
                error.as_deref().map(Value::from).unwrap_or(Value::Nil),
            ];
            if let Some(b) = allow_reconnect {
                v.push(Value::from(*b));
            }
            v
        }
        Message::CompletionClientStream {
            invocation_id,
            headers,
        } => vec![
            Value::from(2),
            headers_value(headers),
            Value::from(invocation_id.as_str()),
        ],
        Message::InvocationBindingFailure { .. } => {
            return Err(CodecError::Malformed(
                "InvocationBindingFailure is never encoded".into(),
            ));
        }
    };
    Ok(Value::Array(arr))
}

fn from_positional_array(value: Value) -> Result<Message, CodecError> {
    let arr = value
        .as_array()
        .ok_or_else(|| CodecError::Malformed("frame is not an array".into()))?;
    let ty = arr
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| CodecError::Malformed("missing type".into()))?;

    let headers_of = |v: &Value| -> Option<crate::messages::Headers> {
        let map = v.as_map()?;
        Some(
            map.iter()
                .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.as_str()?.to_string())))
                .collect(),
        )
    };

    match ty {
        1 => {
            let headers = arr.get(1).and_then(headers_of);
            let invocation_id = arr.get(2).and_then(Value::as_str).map(str::to_string);
            let target = arr
                .get(3)
                .and_then(Value::as_str)
                .ok_or_else(|| CodecError::Malformed("invocation missing target".into()))?
                .to_string();
            let arguments = arr
                .get(4)
                .and_then(Value::as_array)
                .map(|a| a.iter().map(rmpv_to_json).collect())
                .unwrap_or_default();
            let stream_ids: Vec<String> = arr
                .get(5)
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|x| x.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            if stream_ids.is_empty() {
                Ok(Message::Invocation {
                    invocation_id,
                    target,
                    arguments,
                    headers,
                })
            } else {
                Ok(Message::InvocationClientStream {
                    stream_ids,
                    target,
                    arguments,
                    headers,
                })
            }
        }
        2 => {
            let headers = arr.get(1).and_then(headers_of);
            let invocation_id = arr
                .get(2)
                .and_then(Value::as_str)
                .ok_or_else(|| CodecError::Malformed("stream item missing invocationId".into()))?
                .to_string();
            let item = arr.get(3).map(rmpv_to_json).unwrap_or(serde_json::Value::Null);
            Ok(Message::StreamItem {
                invocation_id,
                item,
                headers,
            })
        }
        3 => {
            let headers = arr.get(1).and_then(headers_of);
            let invocation_id = arr
                .get(2)
                .and_then(Value::as_str)
                .ok_or_else(|| CodecError::Malformed("completion missing invocationId".into()))?
                .to_string();
            let result_kind = arr.get(3).and_then(Value::as_i64).unwrap_or(2);
            let payload = arr.get(4);
            let (result, error) = match result_kind {
                1 => (None, payload.and_then(Value::as_str).map(str::to_string)),
                3 => (payload.map(rmpv_to_json), None),
                _ => (None, None),
            };
            Ok(Message::Completion {
                invocation_id,
                result,
                error,
                headers,
            })
        }
        4 => {
            let headers = arr.get(1).and_then(headers_of);
            let invocation_id = arr
                .get(2)
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    CodecError::Malformed("stream invocation missing invocationId".into())
                })?
                .to_string();
            let target = arr
                .get(3)
                .and_then(Value::as_str)
                .ok_or_else(|| CodecError::Malformed("stream invocation missing target".into()))?
                .to_string();
            let arguments = arr
                .get(4)
                .and_then(Value::as_array)
                .map(|a| a.iter().map(rmpv_to_json).collect())
                .unwrap_or_default();
            Ok(Message::StreamInvocation {
                invocation_id,
                target,
                arguments,
                headers,
            })
        }
        5 => {
            let headers = arr.get(1).and_then(headers_of);
            let invocation_id = arr
                .get(2)
                .and_then(Value::as_str)
                .ok_or_else(|| CodecError::Malformed("cancel missing invocationId".into()))?
                .to_string();
            Ok(Message::CancelInvocation {
                invocation_id,
                headers,
            })
        }
        6 => Ok(Message::Ping),
        7 => {
            let error = arr.get(1).and_then(Value::as_str).map(str::to_string);
            let allow_reconnect = arr.get(2).and_then(Value::as_bool);
            Ok(Message::Close {
                error,
                allow_reconnect,
                headers: None,
            })
        }
        other => Err(CodecError::UnknownMessageType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn varint_round_trips() {
        for n in [0u64, 1, 127, 128, 300, 16384, 2_097_151, 5_000_000] {
            let encoded = to_varint(n);
            let (decoded, consumed) = from_varint(&encoded).unwrap();
            assert_eq!(decoded, n);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn varint_is_minimal_leb128() {
        assert_eq!(to_varint(127), vec![0x7f]);
        assert_eq!(to_varint(128), vec![0x80, 0x01]);
    }

    #[test]
    fn frame_length_prefix_matches_body_length() {
        let p = MsgpackProtocol;
        let bytes = p.encode(&Message::Ping).unwrap();
        let (len, consumed) = from_varint(&bytes).unwrap();
        assert_eq!(len as usize, bytes.len() - consumed);
    }

    #[test]
    fn round_trips_invocation() {
        let p = MsgpackProtocol;
        let m = Message::Invocation {
            invocation_id: Some("abc".into()),
            target: "Send".into(),
            arguments: vec![json!(42), json!("hi")],
            headers: None,
        };
        let bytes = p.encode(&m).unwrap();
        let decoded = p.decode(&bytes).unwrap();
        assert_eq!(decoded, vec![m]);
    }

    #[test]
    fn round_trips_completion_with_result() {
        let p = MsgpackProtocol;
        let m = Message::Completion {
            invocation_id: "x".into(),
            result: Some(json!(7)),
            error: None,
            headers: None,
        };
        let bytes = p.encode(&m).unwrap();
        assert_eq!(p.decode(&bytes).unwrap(), vec![m]);
    }

    #[test]
    fn round_trips_completion_with_error() {
        let p = MsgpackProtocol;
        let m = Message::Completion {
            invocation_id: "x".into(),
            result: None,
            error: Some("boom".into()),
            headers: None,
        };
        let bytes = p.encode(&m).unwrap();
        assert_eq!(p.decode(&bytes).unwrap(), vec![m]);
    }

    #[test]
    fn decode_handshake_splits_json_head_from_msgpack_tail() {
        let p = MsgpackProtocol;
        let mut raw = b"{}\x1E".to_vec();
        raw.extend(p.encode(&Message::Ping).unwrap());
        let (resp, trailing) = p.decode_handshake(&raw).unwrap();
        assert!(resp.error.is_none());
        assert_eq!(trailing, vec![Message::Ping]);
    }

    #[test]
    fn two_frames_decode_independently() {
        let p = MsgpackProtocol;
        let mut buf = p.encode(&Message::Ping).unwrap();
        buf.extend(
            p.encode(&Message::CancelInvocation {
                invocation_id: "i".into(),
                headers: None,
            })
            .unwrap(),
        );
        let decoded = p.decode(&buf).unwrap();
        assert_eq!(decoded.len(), 2);
    }
}
