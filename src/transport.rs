//! Negotiate, connect, handshake, and the receive/keepalive/reconnect loops.
//!
//! This is the state machine described for the crate: `Disconnected ->
//! Connecting -> Connected -> Reconnecting -> Connecting -> ...`. Two
//! distinct backoff policies apply depending on which phase fails — see
//! [`SocketBackoff`] and [`NegotiateRetryPolicy`].

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, info, warn};

use crate::error::{HubError, Result};
use crate::messages::Message;
use crate::protocol::Protocol;
use crate::url;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub type MessageSink = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type OpenCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(Option<String>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type TokenFactory = Arc<dyn Fn() -> BoxFuture<'static, String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnected)
        )
    }
}

/// Backoff for socket-open failures: a first-attempt jitter in `[0, 5)`
/// seconds, then geometric growth from a 1.92s seed at a 1.618 factor,
/// capped at 60s. Resets after a successful connect.
#[derive(Debug, Clone)]
pub struct SocketBackoff {
    attempt: u32,
    seed: Duration,
    factor: f64,
    cap: Duration,
}

impl Default for SocketBackoff {
    fn default() -> Self {
        SocketBackoff {
            attempt: 0,
            seed: Duration::from_millis(1920),
            factor: 1.618,
            cap: Duration::from_secs(60),
        }
    }
}

impl SocketBackoff {
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = if self.attempt == 0 {
            let jitter_ms = rand::rng().random_range(0..5000);
            Duration::from_millis(jitter_ms)
        } else {
            let secs = self.seed.as_secs_f64() * self.factor.powi(self.attempt as i32);
            Duration::from_secs_f64(secs.min(self.cap.as_secs_f64()))
        };
        self.attempt += 1;
        delay
    }
}

/// Retry budget for negotiate-phase I/O failures. Unlike [`SocketBackoff`]
/// this has a hard limit; once exhausted the error is surfaced to the
/// caller of `run()` instead of retried forever.
#[derive(Debug, Clone)]
pub struct NegotiateRetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
}

impl Default for NegotiateRetryPolicy {
    fn default() -> Self {
        NegotiateRetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            multiplier: 1.1,
        }
    }
}

impl NegotiateRetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(secs)
    }
}

pub struct TransportConfig {
    pub url: String,
    pub protocol: Arc<dyn Protocol>,
    pub headers: Vec<(String, String)>,
    pub ping_interval: Duration,
    pub connection_timeout: Duration,
    pub max_size: usize,
    pub access_token_factory: Option<TokenFactory>,
    pub skip_negotiation: bool,
    pub negotiate_retry: NegotiateRetryPolicy,
}

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    #[serde(default)]
    connection_id: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

pub struct Transport {
    cfg: TransportConfig,
    state: StdMutex<ConnectionState>,
    ready: Arc<Notify>,
    write_tx: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Transport {
    pub fn new(cfg: TransportConfig) -> Self {
        Transport {
            cfg,
            state: StdMutex::new(ConnectionState::Disconnected),
            ready: Arc::new(Notify::new()),
            write_tx: StdMutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn transition(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap();
        assert!(
            state.can_transition_to(next),
            "illegal transport transition {:?} -> {:?}",
            *state,
            next
        );
        debug!(from = ?*state, to = ?next, "transport state transition");
        *state = next;
    }

    /// Wait (bounded by `connection_timeout`) for the connection to reach
    /// `Connected`, then send `msg` through the write channel.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            tokio::time::timeout(self.cfg.connection_timeout, self.ready.notified())
                .await
                .map_err(|_| HubError::NotReady)?;
        }
        let bytes = self.cfg.protocol.encode(msg)?;
        let tx = self.write_tx.lock().unwrap();
        let tx = tx.as_ref().ok_or(HubError::NotReady)?;
        tx.send(bytes).map_err(|_| HubError::NotReady)
    }

    /// Drive negotiate -> connect -> handshake -> serve, reconnecting with
    /// backoff on socket-open failure, and surfacing a `NegotiationFailure`
    /// once the negotiate retry budget is exhausted.
    pub async fn run(
        &self,
        on_message: MessageSink,
        on_open: Option<OpenCallback>,
        on_close: Option<CloseCallback>,
    ) -> Result<()> {
        let mut socket_backoff = SocketBackoff::default();
        let mut negotiate_attempt: u32 = 0;

        loop {
            self.transition(ConnectionState::Connecting);

            let connect_result = self.connect_once().await;
            let socket = match connect_result {
                Ok(socket) => socket,
                Err(ConnectAttemptError::Negotiate(e)) => {
                    if negotiate_attempt >= self.cfg.negotiate_retry.max_attempts {
                        self.transition(ConnectionState::Disconnected);
                        return Err(HubError::NegotiationFailure(e.to_string()));
                    }
                    let delay = self
                        .cfg
                        .negotiate_retry
                        .delay_for_attempt(negotiate_attempt);
                    negotiate_attempt += 1;
                    warn!(attempt = negotiate_attempt, ?delay, error = %e, "negotiate failed, retrying");
                    self.transition(ConnectionState::Reconnecting);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(ConnectAttemptError::Fatal(e)) => {
                    self.transition(ConnectionState::Disconnected);
                    return Err(e);
                }
                Err(ConnectAttemptError::SocketOpen(e)) => {
                    let delay = socket_backoff.next_delay();
                    warn!(?delay, error = %e, "socket open failed, backing off");
                    self.transition(ConnectionState::Reconnecting);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            negotiate_attempt = 0;
            socket_backoff.reset();
            self.transition(ConnectionState::Connected);
            if let Some(cb) = &on_open {
                cb().await;
            }
            self.ready.notify_waiters();

            let serve_result = self.serve(socket, on_message.clone()).await;

            *self.write_tx.lock().unwrap() = None;
            self.transition(ConnectionState::Reconnecting);
            let close_err = serve_result.err().map(|e| e.to_string());
            if let Some(cb) = &on_close {
                cb(close_err.clone()).await;
            }
            if let Some(msg) = close_err {
                info!(error = %msg, "connection closed, reconnecting");
            }
        }
    }

    async fn connect_once(&self) -> std::result::Result<WsStream, ConnectAttemptError> {
        let mut socket_url = self.cfg.url.clone();
        let mut bearer: Option<String> = None;

        if let Some(factory) = &self.cfg.access_token_factory {
            bearer = Some(factory().await);
        }

        if !self.cfg.skip_negotiation {
            let negotiated = self.negotiate().await.map_err(ConnectAttemptError::from_negotiate)?;
            if let Some(redirect_url) = negotiated.url {
                socket_url = url::replace_scheme(&redirect_url, true)
                    .map_err(|e| ConnectAttemptError::Fatal(e.into()))?;
            } else if let Some(id) = negotiated.connection_id {
                socket_url = url::connection_url(&socket_url, &[id])
                    .map_err(|e| ConnectAttemptError::Fatal(e.into()))?;
            }
            if let Some(token) = negotiated.access_token {
                bearer = Some(token);
            }
        } else {
            socket_url = url::replace_scheme(&socket_url, true)
                .map_err(|e| ConnectAttemptError::Fatal(e.into()))?;
        }

        let mut request = socket_url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectAttemptError::Fatal(HubError::Ws(e)))?;
        for (k, v) in &self.cfg.headers {
            if let Ok(name) = k.parse::<tokio_tungstenite::tungstenite::http::HeaderName>() {
                if let Ok(value) = v.parse() {
                    request.headers_mut().insert(name, value);
                }
            }
        }
        if let Some(token) = bearer {
            if let Ok(value) = format!("Bearer {token}").parse() {
                request
                    .headers_mut()
                    .insert(tokio_tungstenite::tungstenite::http::header::AUTHORIZATION, value);
            }
        }

        let ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default()
            .max_message_size(Some(self.cfg.max_size))
            .max_frame_size(Some(self.cfg.max_size));
        let connect = tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false);
        let (mut socket, _resp) = tokio::time::timeout(self.cfg.connection_timeout, connect)
            .await
            .map_err(|_| ConnectAttemptError::SocketOpen(HubError::NotReady))?
            .map_err(|e| ConnectAttemptError::SocketOpen(HubError::Ws(e)))?;

        self.handshake(&mut socket)
            .await
            .map_err(ConnectAttemptError::Fatal)?;

        Ok(socket)
    }

    async fn negotiate(&self) -> Result<NegotiateResponse> {
        let negotiate_url = url::negotiate_url(&self.cfg.url)?;
        let client = reqwest::Client::new();
        let mut req = client.post(&negotiate_url);
        for (k, v) in &self.cfg.headers {
            req = req.header(k, v);
        }
        let resp = tokio::time::timeout(self.cfg.connection_timeout, req.send())
            .await
            .map_err(|_| HubError::NegotiationFailure("connect timed out".into()))??;

        match resp.status().as_u16() {
            200 => Ok(resp.json::<NegotiateResponse>().await?),
            401 => Err(HubError::AuthorizationError),
            status => Err(HubError::ConnectionError { status }),
        }
    }

    async fn handshake(&self, socket: &mut WsStream) -> Result<()> {
        let req = self.cfg.protocol.handshake_message();
        let bytes = crate::protocol::json::encode_handshake(&req)?;
        socket.send(WsFrame::text(String::from_utf8_lossy(&bytes).into_owned())).await?;

        let frame = socket
            .next()
            .await
            .ok_or_else(|| HubError::ServerError {
                message: "socket closed during handshake".into(),
            })??;
        let raw = match frame {
            WsFrame::Text(t) => t.as_bytes().to_vec(),
            WsFrame::Binary(b) => b.to_vec(),
            other => {
                return Err(HubError::ServerError {
                    message: format!("unexpected handshake frame: {other:?}"),
                })
            }
        };

        let (response, _trailing) = self.cfg.protocol.decode_handshake(&raw)?;
        if let Some(err) = response.error {
            return Err(HubError::ServerError { message: err });
        }
        Ok(())
    }

    async fn serve(&self, socket: WsStream, on_message: MessageSink) -> Result<()> {
        let (mut write, mut read) = socket.split();
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let write_tx_for_ping = write_tx.clone();
        *self.write_tx.lock().unwrap() = Some(write_tx);

        let binary = self.cfg.protocol.is_binary();
        let writer = tokio::spawn(async move {
            while let Some(bytes) = write_rx.recv().await {
                let frame = if binary {
                    WsFrame::Binary(bytes.into())
                } else {
                    WsFrame::text(String::from_utf8_lossy(&bytes).into_owned())
                };
                if write.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let protocol = self.cfg.protocol.clone();
        let mut ping_timer = tokio::time::interval(KEEPALIVE_INTERVAL);

        let result = loop {
            tokio::select! {
                biased;
                frame = read.next() => {
                    match frame {
                        Some(Ok(WsFrame::Text(t))) => {
                            let mut fatal = None;
                            for msg in protocol.decode(t.as_bytes())? {
                                if let Err(e) = on_message(msg).await {
                                    fatal = Some(e);
                                    break;
                                }
                            }
                            if let Some(e) = fatal {
                                break Err(e);
                            }
                        }
                        Some(Ok(WsFrame::Binary(b))) => {
                            let mut fatal = None;
                            for msg in protocol.decode(&b)? {
                                if let Err(e) = on_message(msg).await {
                                    fatal = Some(e);
                                    break;
                                }
                            }
                            if let Some(e) = fatal {
                                break Err(e);
                            }
                        }
                        Some(Ok(WsFrame::Close(_))) | None => {
                            break Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(HubError::Ws(e)),
                    }
                }
                _ = ping_timer.tick() => {
                    let ping = protocol.encode(&Message::Ping)?;
                    if write_tx_for_ping.send(ping).is_err() {
                        break Ok(());
                    }
                }
            }
        };

        writer.abort();
        result
    }
}

enum ConnectAttemptError {
    Negotiate(HubError),
    SocketOpen(HubError),
    Fatal(HubError),
}

impl ConnectAttemptError {
    fn from_negotiate(e: HubError) -> Self {
        match e {
            HubError::AuthorizationError | HubError::ConnectionError { .. } => {
                ConnectAttemptError::Fatal(e)
            }
            other => ConnectAttemptError::Negotiate(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_rejects_illegal_transitions() {
        assert!(ConnectionState::Disconnected.can_transition_to(ConnectionState::Connecting));
        assert!(!ConnectionState::Disconnected.can_transition_to(ConnectionState::Connected));
        assert!(ConnectionState::Connected.can_transition_to(ConnectionState::Reconnecting));
        assert!(!ConnectionState::Connected.can_transition_to(ConnectionState::Connecting));
    }

    #[test]
    fn socket_backoff_first_delay_is_bounded_jitter() {
        let mut b = SocketBackoff::default();
        let d = b.next_delay();
        assert!(d < Duration::from_secs(5));
    }

    #[test]
    fn socket_backoff_grows_geometrically_then_caps() {
        let mut b = SocketBackoff::default();
        let _ = b.next_delay(); // consume the jitter attempt
        let second = b.next_delay();
        let third = b.next_delay();
        assert!(second.as_secs_f64() > 3.0 && second.as_secs_f64() < 3.2);
        assert!(third > second);
        for _ in 0..20 {
            let _ = b.next_delay();
        }
        let capped = b.next_delay();
        assert!(capped <= Duration::from_secs(60));
    }

    #[test]
    fn socket_backoff_resets() {
        let mut b = SocketBackoff::default();
        let _ = b.next_delay();
        let _ = b.next_delay();
        b.reset();
        assert_eq!(b.attempt, 0);
    }
}
