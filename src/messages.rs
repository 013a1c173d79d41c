//! The SignalR hub protocol message algebra.
//!
//! Wire shape is a tagged union keyed by the numeric `type` field. JSON and
//! MessagePack each have their own encode/decode path (see
//! [`crate::protocol`]); this module only defines the in-memory shape and
//! the JSON field-name remapping (`invocationId`, `streamIds`,
//! `allowReconnect`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub type Headers = HashMap<String, String>;
pub type Args = Vec<Value>;

/// One hub protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Args,
        headers: Option<Headers>,
    },
    StreamItem {
        invocation_id: String,
        item: Value,
        headers: Option<Headers>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
        headers: Option<Headers>,
    },
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Args,
        headers: Option<Headers>,
    },
    CancelInvocation {
        invocation_id: String,
        headers: Option<Headers>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: Option<bool>,
        headers: Option<Headers>,
    },
    InvocationClientStream {
        stream_ids: Vec<String>,
        target: String,
        arguments: Args,
        headers: Option<Headers>,
    },
    CompletionClientStream {
        invocation_id: String,
        headers: Option<Headers>,
    },
    /// Diagnostic only — never sent on the wire. Produced by the codec when
    /// an `Invocation` cannot be bound to a registered handler.
    InvocationBindingFailure {
        target: String,
        detail: String,
    },
}

impl Message {
    /// The numeric wire tag for this variant (`-1` for the client-only
    /// diagnostic variant, which is never encoded).
    pub fn type_tag(&self) -> i64 {
        match self {
            Message::Invocation { .. } => 1,
            Message::StreamItem { .. } => 2,
            Message::Completion { .. } => 3,
            Message::StreamInvocation { .. } => 4,
            Message::CancelInvocation { .. } => 5,
            Message::Ping => 6,
            Message::Close { .. } => 7,
            Message::InvocationClientStream { .. } => 1,
            Message::CompletionClientStream { .. } => 2,
            Message::InvocationBindingFailure { .. } => -1,
        }
    }
}

/// Sent by the client immediately after the socket opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u8,
}

/// The server's reply to a [`HandshakeRequest`]. `error` set means the
/// handshake failed and the connection must not proceed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// On-wire JSON shape of a message, with serde doing the camelCase
/// remapping and field ordering. Completion is the only variant whose
/// `result`/`error` must never be serialized as `null`; both are declared
/// `skip_serializing_if = "Option::is_none"` for exactly that reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum WireMessage {
    Invocation {
        #[serde(rename = "type")]
        r#type: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<Headers>,
        #[serde(skip_serializing_if = "Option::is_none", rename = "invocationId")]
        invocation_id: Option<String>,
        target: String,
        arguments: Args,
        #[serde(skip_serializing_if = "Option::is_none", rename = "streamIds")]
        stream_ids: Option<Vec<String>>,
    },
    StreamItem {
        #[serde(rename = "type")]
        r#type: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<Headers>,
        #[serde(rename = "invocationId")]
        invocation_id: String,
        item: Value,
    },
    Completion {
        #[serde(rename = "type")]
        r#type: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<Headers>,
        #[serde(rename = "invocationId")]
        invocation_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    CancelInvocation {
        #[serde(rename = "type")]
        r#type: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<Headers>,
        #[serde(rename = "invocationId")]
        invocation_id: String,
    },
    Ping {
        #[serde(rename = "type")]
        r#type: u8,
    },
    Close {
        #[serde(rename = "type")]
        r#type: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", rename = "allowReconnect")]
        allow_reconnect: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<Headers>,
    },
}

impl From<&Message> for WireMessage {
    fn from(m: &Message) -> Self {
        match m.clone() {
            Message::Invocation {
                invocation_id,
                target,
                arguments,
                headers,
            } => WireMessage::Invocation {
                r#type: 1,
                headers,
                invocation_id,
                target,
                arguments,
                stream_ids: None,
            },
            Message::InvocationClientStream {
                stream_ids,
                target,
                arguments,
                headers,
            } => WireMessage::Invocation {
                r#type: 1,
                headers,
                invocation_id: None,
                target,
                arguments,
                stream_ids: Some(stream_ids),
            },
            Message::StreamItem {
                invocation_id,
                item,
                headers,
            } => WireMessage::StreamItem {
                r#type: 2,
                headers,
                invocation_id,
                item,
            },
            Message::Completion {
                invocation_id,
                result,
                error,
                headers,
            } => WireMessage::Completion {
                r#type: 3,
                headers,
                invocation_id,
                result,
                error,
            },
            Message::StreamInvocation {
                invocation_id,
                target,
                arguments,
                headers,
            } => WireMessage::Invocation {
                r#type: 4,
                headers,
                invocation_id: Some(invocation_id),
                target,
                arguments,
                stream_ids: None,
            },
            Message::CancelInvocation {
                invocation_id,
                headers,
            } => WireMessage::CancelInvocation {
                r#type: 5,
                headers,
                invocation_id,
            },
            Message::Ping => WireMessage::Ping { r#type: 6 },
            Message::Close {
                error,
                allow_reconnect,
                headers,
            } => WireMessage::Close {
                r#type: 7,
                error,
                allow_reconnect,
                headers,
            },
            Message::CompletionClientStream {
                invocation_id,
                headers,
            } => WireMessage::CancelInvocation {
                r#type: 2,
                headers,
                invocation_id,
            },
            Message::InvocationBindingFailure { .. } => {
                unreachable!("InvocationBindingFailure is never encoded")
            }
        }
    }
}

/// Encode one [`Message`] to its JSON object form (no framing — the
/// record-separator delimiter is added by [`crate::protocol::json`]).
pub fn to_json_value(m: &Message) -> serde_json::Result<Value> {
    serde_json::to_value(WireMessage::from(m))
}

/// Parse one JSON object into a [`Message`], dispatching on its `type` tag.
/// The caller is responsible for splitting the record-separated stream into
/// individual objects first.
pub fn from_json_value(v: Value) -> Result<Message, crate::error::CodecError> {
    use crate::error::CodecError;

    let ty = v
        .get("type")
        .and_then(Value::as_i64)
        .ok_or_else(|| CodecError::Malformed("missing type".into()))?;

    let headers = v
        .get("headers")
        .and_then(|h| serde_json::from_value::<Headers>(h.clone()).ok());

    match ty {
        1 => {
            let target = v
                .get("target")
                .and_then(Value::as_str)
                .ok_or_else(|| CodecError::Malformed("invocation missing target".into()))?
                .to_string();
            let arguments = v
                .get("arguments")
                .and_then(|a| a.as_array().cloned())
                .unwrap_or_default();
            let invocation_id = v
                .get("invocationId")
                .and_then(Value::as_str)
                .map(str::to_string);
            let stream_ids: Option<Vec<String>> = v.get("streamIds").and_then(|s| {
                s.as_array().map(|arr| {
                    arr.iter()
                        .filter_map(|x| x.as_str().map(str::to_string))
                        .collect()
                })
            });
            match stream_ids {
                Some(ids) if !ids.is_empty() => Ok(Message::InvocationClientStream {
                    stream_ids: ids,
                    target,
                    arguments,
                    headers,
                }),
                _ => Ok(Message::Invocation {
                    invocation_id,
                    target,
                    arguments,
                    headers,
                }),
            }
        }
        2 => {
            let invocation_id = v
                .get("invocationId")
                .and_then(Value::as_str)
                .ok_or_else(|| CodecError::Malformed("stream item missing invocationId".into()))?
                .to_string();
            let item = v.get("item").cloned().unwrap_or(Value::Null);
            Ok(Message::StreamItem {
                invocation_id,
                item,
                headers,
            })
        }
        3 => {
            let invocation_id = v
                .get("invocationId")
                .and_then(Value::as_str)
                .ok_or_else(|| CodecError::Malformed("completion missing invocationId".into()))?
                .to_string();
            Ok(Message::Completion {
                invocation_id,
                result: v.get("result").cloned(),
                error: v
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                headers,
            })
        }
        4 => {
            let invocation_id = v
                .get("invocationId")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    CodecError::Malformed("stream invocation missing invocationId".into())
                })?
                .to_string();
            let target = v
                .get("target")
                .and_then(Value::as_str)
                .ok_or_else(|| CodecError::Malformed("stream invocation missing target".into()))?
                .to_string();
            let arguments = v
                .get("arguments")
                .and_then(|a| a.as_array().cloned())
                .unwrap_or_default();
            Ok(Message::StreamInvocation {
                invocation_id,
                target,
                arguments,
                headers,
            })
        }
        5 => {
            let invocation_id = v
                .get("invocationId")
                .and_then(Value::as_str)
                .ok_or_else(|| CodecError::Malformed("cancel missing invocationId".into()))?
                .to_string();
            Ok(Message::CancelInvocation {
                invocation_id,
                headers,
            })
        }
        6 => Ok(Message::Ping),
        7 => Ok(Message::Close {
            error: v
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string),
            allow_reconnect: v.get("allowReconnect").and_then(Value::as_bool),
            headers,
        }),
        other => Err(CodecError::UnknownMessageType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invocation_round_trips_through_json_value() {
        let m = Message::Invocation {
            invocation_id: Some("abc".into()),
            target: "Send".into(),
            arguments: vec![json!(42), json!("hi")],
            headers: None,
        };
        let v = to_json_value(&m).unwrap();
        let back = from_json_value(v).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn completion_omits_absent_result_and_error() {
        let m = Message::Completion {
            invocation_id: "x".into(),
            result: None,
            error: None,
            headers: None,
        };
        let v = to_json_value(&m).unwrap();
        assert!(v.get("result").is_none());
        assert!(v.get("error").is_none());
    }

    #[test]
    fn ping_has_no_extra_fields() {
        let v = to_json_value(&Message::Ping).unwrap();
        assert_eq!(v, json!({"type": 6}));
    }
}
