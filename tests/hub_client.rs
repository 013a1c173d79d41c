//! End-to-end tests against an in-process mock hub server.
//!
//! The mock server accepts a single connection, completes the JSON
//! handshake, then echoes invocations back as completions and periodically
//! answers pings — enough surface to exercise negotiate-skip connect,
//! handshake, send, and dispatch without a real ASP.NET Core hub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message as WsFrame;

use signalr_client::SignalRClient;

const RECORD_SEPARATOR: u8 = 0x1E;

struct MockHub {
    addr: SocketAddr,
    _task: tokio::task::JoinHandle<()>,
}

impl MockHub {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let _ = Self::handle(stream).await;
            }
        });
        MockHub { addr, _task: task }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/hub", self.addr)
    }

    async fn handle(stream: tokio::net::TcpStream) -> Result<(), Box<dyn std::error::Error>> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws.split();

        // Handshake: first frame is the client's HandshakeRequest.
        match read.next().await {
            Some(Ok(WsFrame::Text(_))) => {
                let mut ack = serde_json::to_vec(&json!({})).unwrap();
                ack.push(RECORD_SEPARATOR);
                write.send(WsFrame::Text(String::from_utf8(ack).unwrap().into())).await?;
            }
            _ => return Ok(()),
        }

        while let Some(Ok(frame)) = read.next().await {
            match frame {
                WsFrame::Text(t) => {
                    for raw in t.as_bytes().split(|&b| b == RECORD_SEPARATOR).filter(|s| !s.is_empty()) {
                        let v: serde_json::Value = serde_json::from_slice(raw)?;
                        if v.get("type").and_then(serde_json::Value::as_i64) == Some(1) {
                            if let Some(id) = v.get("invocationId").and_then(|x| x.as_str()) {
                                let reply = json!({
                                    "type": 3,
                                    "invocationId": id,
                                    "result": v.get("arguments").cloned().unwrap_or(json!([])),
                                });
                                let mut bytes = serde_json::to_vec(&reply).unwrap();
                                bytes.push(RECORD_SEPARATOR);
                                write.send(WsFrame::Text(String::from_utf8(bytes).unwrap().into())).await?;
                            }
                        }
                    }
                }
                WsFrame::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn invocation_round_trips_through_a_real_socket() {
    let hub = MockHub::start().await;
    let client = SignalRClient::builder(hub.ws_url())
        .skip_negotiation(true)
        .build();

    let received = Arc::new(AtomicUsize::new(0));
    let r = received.clone();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let run_client = client.clone();
    let handle = tokio::spawn(async move {
        let _ = run_client.run().await;
    });

    // give the run loop a moment to connect and complete the handshake
    tokio::time::sleep(Duration::from_millis(100)).await;

    client
        .invoke("Echo", vec![json!("hello")], move |msg| {
            r.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(msg);
        })
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("completion should arrive")
        .expect("channel should not close");

    match reply {
        signalr_client::Message::Completion { result, .. } => {
            assert_eq!(result, Some(json!("hello")));
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert_eq!(received.load(Ordering::SeqCst), 1);

    handle.abort();
}

#[tokio::test]
async fn on_open_fires_once_connected() {
    let hub = MockHub::start().await;
    let client = SignalRClient::builder(hub.ws_url())
        .skip_negotiation(true)
        .build();

    let opened = Arc::new(tokio::sync::Notify::new());
    let o = opened.clone();
    client.on_open(move || {
        let o = o.clone();
        async move {
            o.notify_one();
        }
    });

    let run_client = client.clone();
    let handle = tokio::spawn(async move {
        let _ = run_client.run().await;
    });

    tokio::time::timeout(Duration::from_secs(2), opened.notified())
        .await
        .expect("on_open should fire");

    handle.abort();
}
