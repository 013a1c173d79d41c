//! Error taxonomy for the SignalR client.
//!
//! [`HubError`] is the primary, user-facing error type returned by
//! [`crate::transport::Transport::run`] and [`crate::client::SignalRClient::run`].
//! A handful of small, purely local error enums exist alongside it for
//! failures that never cross the public API (URL construction, internal
//! codec plumbing) — those follow the hand-rolled `Display`/`Error` style
//! instead of deriving `thiserror::Error`, mirroring the mix already present
//! in the crate this one is descended from.

use thiserror::Error;

/// Top-level failure surfaced to a caller of `run()`.
#[derive(Debug, Error)]
pub enum HubError {
    /// Negotiate responded 401; never retried.
    #[error("authorization failed")]
    AuthorizationError,

    /// Negotiate responded with an unexpected status code; never retried.
    #[error("negotiate failed with status {status}")]
    ConnectionError { status: u16 },

    /// Negotiate-phase I/O failed repeatedly and the retry budget is exhausted.
    #[error("negotiation failed after exhausting retry budget: {0}")]
    NegotiationFailure(String),

    /// A protocol-level failure reported by the server (handshake error,
    /// `Close` with an error, or an unbindable invocation).
    #[error("server error: {message}")]
    ServerError { message: String },

    /// `send` was called but the connection never reached a ready state
    /// within `connection_timeout`.
    #[error("timed out waiting for the connection to become ready")]
    NotReady,

    /// A `Completion` carrying an error arrived with no error sink registered.
    #[error("completion error with no error handler registered: {0}")]
    UnhandledCompletionError(String),

    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("msgpack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, HubError>;

/// Raised by the codec when a frame cannot be decoded into a known message.
#[derive(Debug)]
pub enum CodecError {
    UnknownMessageType(i64),
    Truncated,
    Malformed(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::UnknownMessageType(t) => write!(f, "unknown message type: {t}"),
            CodecError::Truncated => write!(f, "truncated frame"),
            CodecError::Malformed(s) => write!(f, "malformed frame: {s}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for HubError {
    fn from(e: CodecError) -> Self {
        HubError::ServerError {
            message: e.to_string(),
        }
    }
}
