//! JSON wire protocol: each frame is a UTF-8 JSON object terminated by the
//! ASCII record separator (`0x1E`).

use super::Protocol;
use crate::error::CodecError;
use crate::messages::{self, HandshakeRequest, HandshakeResponse, Message};

const RECORD_SEPARATOR: u8 = 0x1E;

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonProtocol;

impl Protocol for JsonProtocol {
    fn name(&self) -> &'static str {
        "json"
    }

    fn version(&self) -> u8 {
        1
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let value = messages::to_json_value(message)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        let mut bytes =
            serde_json::to_vec(&value).map_err(|e| CodecError::Malformed(e.to_string()))?;
        bytes.push(RECORD_SEPARATOR);
        Ok(bytes)
    }

    fn decode(&self, buf: &[u8]) -> Result<Vec<Message>, CodecError> {
        split_frames(buf)
            .into_iter()
            .map(parse_one)
            .collect()
    }

    fn is_binary(&self) -> bool {
        false
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

/// Encode a handshake request the same way any other frame is framed.
pub fn encode_handshake(req: &HandshakeRequest) -> Result<Vec<u8>, CodecError> {
    let mut bytes =
        serde_json::to_vec(req).map_err(|e| CodecError::Malformed(e.to_string()))?;
    bytes.push(RECORD_SEPARATOR);
    Ok(bytes)
}

fn split_frames(buf: &[u8]) -> Vec<&[u8]> {
    buf.split(|&b| b == RECORD_SEPARATOR)
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_one(raw: &[u8]) -> Result<Message, CodecError> {
    let value: serde_json::Value =
        serde_json::from_slice(raw).map_err(|e| CodecError::Malformed(e.to_string()))?;
    messages::from_json_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn s1_encode_invocation() {
        let p = JsonProtocol;
        let m = Message::Invocation {
            invocation_id: Some("abc".into()),
            target: "Send".into(),
            arguments: vec![json!(42), json!("hi")],
            headers: None,
        };
        let bytes = p.encode(&m).unwrap();
        assert_eq!(*bytes.last().unwrap(), RECORD_SEPARATOR);
        assert_eq!(bytes.iter().filter(|&&b| b == RECORD_SEPARATOR).count(), 1);
        let v: serde_json::Value = serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(v["type"], 1);
        assert_eq!(v["target"], "Send");
        assert_eq!(v["invocationId"], "abc");
    }

    #[test]
    fn s2_decode_ping() {
        let p = JsonProtocol;
        let msgs = p.decode(b"{\"type\":6}\x1E").unwrap();
        assert_eq!(msgs, vec![Message::Ping]);
    }

    #[test]
    fn s3_decode_completion_with_result() {
        let p = JsonProtocol;
        let msgs = p
            .decode(b"{\"type\":3,\"invocationId\":\"x\",\"result\":7}\x1E")
            .unwrap();
        assert_eq!(
            msgs,
            vec![Message::Completion {
                invocation_id: "x".into(),
                result: Some(json!(7)),
                error: None,
                headers: None,
            }]
        );
    }

    #[test]
    fn s8_pipelined_frames_decode_in_wire_order() {
        let p = JsonProtocol;
        let raw = b"{\"type\":1,\"target\":\"a\",\"arguments\":[]}\x1E{\"type\":1,\"target\":\"b\",\"arguments\":[]}\x1E";
        let msgs = p.decode(raw).unwrap();
        assert_eq!(msgs.len(), 2);
        match (&msgs[0], &msgs[1]) {
            (
                Message::Invocation { target: t1, .. },
                Message::Invocation { target: t2, .. },
            ) => {
                assert_eq!(t1, "a");
                assert_eq!(t2, "b");
            }
            _ => panic!("expected two invocations"),
        }
    }

    #[test]
    fn decode_handshake_splits_off_trailing_messages() {
        let p = JsonProtocol;
        let raw = b"{}\x1E{\"type\":6}\x1E";
        let (resp, trailing) = p.decode_handshake(raw).unwrap();
        assert!(resp.error.is_none());
        assert_eq!(trailing, vec![Message::Ping]);
    }

    #[test]
    fn decode_handshake_reports_error() {
        let p = JsonProtocol;
        let raw = b"{\"error\":\"bad protocol\"}\x1E";
        let (resp, trailing) = p.decode_handshake(raw).unwrap();
        assert_eq!(resp.error.as_deref(), Some("bad protocol"));
        assert!(trailing.is_empty());
    }

    #[test]
    fn unknown_type_is_an_error() {
        let p = JsonProtocol;
        let err = p.decode(b"{\"type\":99}\x1E").unwrap_err();
        assert!(matches!(err, CodecError::UnknownMessageType(99)));
    }
}
