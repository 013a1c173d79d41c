//! Wire codecs for the hub protocol.
//!
//! Two implementations share this contract: [`json`] (text frames delimited
//! by the ASCII record separator) and [`msgpack`] (binary frames prefixed by
//! a LEB128 varint length). Both live behind the [`Protocol`] trait so the
//! transport can be generic over the wire format.

pub mod json;
pub mod msgpack;

use crate::error::CodecError;
use crate::messages::{HandshakeRequest, HandshakeResponse, Message};

/// A hub protocol encoder/decoder.
pub trait Protocol: Send + Sync {
    /// The protocol name advertised in the handshake request (`"json"` or
    /// `"messagepack"`).
    fn name(&self) -> &'static str;

    /// The handshake protocol version this implementation speaks.
    fn version(&self) -> u8;

    /// Encode one message to its on-wire frame, including any delimiter or
    /// length prefix this codec requires.
    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError>;

    /// Decode a buffer that may contain zero or more complete frames.
    fn decode(&self, buf: &[u8]) -> Result<Vec<Message>, CodecError>;

    /// Whether frames of this protocol must go out as a WebSocket binary
    /// frame rather than a text frame. JSON frames are UTF-8 text;
    /// MessagePack frames are binary.
    fn is_binary(&self) -> bool {
        true
    }

    /// Split the handshake response from the front of `buf` and decode any
    /// messages pipelined immediately after it.
    fn decode_handshake(
        &self,
        buf: &[u8],
    ) -> Result<(HandshakeResponse, Vec<Message>), CodecError>;

    /// The handshake request this client sends immediately after the socket
    /// opens.
    fn handshake_message(&self) -> HandshakeRequest {
        HandshakeRequest {
            protocol: self.name().to_string(),
            version: self.version(),
        }
    }
}
