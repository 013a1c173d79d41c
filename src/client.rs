//! The public client facade: event registration, invocation/stream
//! correlation, and the `_on_message` dispatch table.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::messages::Message;
use crate::protocol::json::JsonProtocol;
use crate::protocol::Protocol;
use crate::registry::{HandlerTable, InvocationCallback, InvocationRegistry, ResultHandler, StreamObserver};
use crate::transport::{
    CloseCallback, MessageSink, NegotiateRetryPolicy, OpenCallback, TokenFactory, Transport,
    TransportConfig,
};

type ErrorSink = Arc<dyn Fn(String) + Send + Sync>;

/// Builder for [`SignalRClient`], mirroring the options table every
/// constructor option maps to.
pub struct SignalRClientBuilder {
    url: String,
    protocol: Arc<dyn Protocol>,
    headers: Vec<(String, String)>,
    ping_interval: Duration,
    connection_timeout: Duration,
    max_size: usize,
    access_token_factory: Option<TokenFactory>,
    skip_negotiation: bool,
    negotiate_retry: NegotiateRetryPolicy,
    client_results: bool,
}

impl SignalRClientBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        SignalRClientBuilder {
            url: url.into(),
            protocol: Arc::new(JsonProtocol),
            headers: Vec::new(),
            ping_interval: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(10),
            max_size: 1 << 20,
            access_token_factory: None,
            skip_negotiation: false,
            negotiate_retry: NegotiateRetryPolicy::default(),
            client_results: false,
        }
    }

    pub fn protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn ping_interval(mut self, d: Duration) -> Self {
        self.ping_interval = d;
        self
    }

    pub fn connection_timeout(mut self, d: Duration) -> Self {
        self.connection_timeout = d;
        self
    }

    pub fn max_size(mut self, n: usize) -> Self {
        self.max_size = n;
        self
    }

    pub fn access_token_factory<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = String> + Send + 'static,
    {
        self.access_token_factory = Some(Arc::new(move || f().boxed()));
        self
    }

    pub fn skip_negotiation(mut self, skip: bool) -> Self {
        self.skip_negotiation = skip;
        self
    }

    pub fn negotiate_retry(mut self, policy: NegotiateRetryPolicy) -> Self {
        self.negotiate_retry = policy;
        self
    }

    /// Opt into the "client results" extension: invocation handlers
    /// registered through [`SignalRClient::on_invocation`] may return a
    /// value, which is sent back to the server as a `Completion`.
    pub fn client_results(mut self, enabled: bool) -> Self {
        self.client_results = enabled;
        self
    }

    pub fn build(self) -> SignalRClient {
        let cfg = TransportConfig {
            url: self.url,
            protocol: self.protocol,
            headers: self.headers,
            ping_interval: self.ping_interval,
            connection_timeout: self.connection_timeout,
            max_size: self.max_size,
            access_token_factory: self.access_token_factory,
            skip_negotiation: self.skip_negotiation,
            negotiate_retry: self.negotiate_retry,
        };
        SignalRClient {
            transport: Arc::new(Transport::new(cfg)),
            handlers: Arc::new(StdMutex::new(HandlerTable::new())),
            registry: Arc::new(StdMutex::new(InvocationRegistry::new())),
            error_sink: Arc::new(StdMutex::new(None)),
            on_open: Arc::new(StdMutex::new(None)),
            on_close: Arc::new(StdMutex::new(None)),
            client_results: self.client_results,
        }
    }
}

/// A scoped client-to-server stream, acquired through
/// [`SignalRClient::client_stream`]. A completion message is guaranteed to
/// be sent on every exit path, whether through the explicit `complete()` or
/// the `Drop` guard.
pub struct ClientStream {
    id: String,
    client: SignalRClient,
    completed: bool,
}

impl ClientStream {
    pub async fn send(&self, item: Value) -> Result<()> {
        self.client
            .send_message(&Message::StreamItem {
                invocation_id: self.id.clone(),
                item,
                headers: None,
            })
            .await
    }

    /// Explicitly terminate the stream. Idempotent with the `Drop` guard —
    /// calling this makes `Drop` a no-op.
    pub async fn complete(mut self) -> Result<()> {
        self.completed = true;
        self.client
            .send_message(&Message::CompletionClientStream {
                invocation_id: self.id.clone(),
                headers: None,
            })
            .await
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        if !self.completed {
            let client = self.client.clone();
            let id = self.id.clone();
            tokio::spawn(async move {
                let _ = client
                    .send_message(&Message::CompletionClientStream {
                        invocation_id: id,
                        headers: None,
                    })
                    .await;
            });
        }
    }
}

/// The SignalR hub client. Cheaply cloneable — every clone shares the same
/// transport, registries, and handler table.
#[derive(Clone)]
pub struct SignalRClient {
    transport: Arc<Transport>,
    handlers: Arc<StdMutex<HandlerTable>>,
    registry: Arc<StdMutex<InvocationRegistry>>,
    error_sink: Arc<StdMutex<Option<ErrorSink>>>,
    on_open: Arc<StdMutex<Option<OpenCallback>>>,
    on_close: Arc<StdMutex<Option<CloseCallback>>>,
    client_results: bool,
}

impl SignalRClient {
    pub fn builder(url: impl Into<String>) -> SignalRClientBuilder {
        SignalRClientBuilder::new(url)
    }

    /// Register a handler for invocations whose `target == event`. Multiple
    /// handlers may be registered; they fire in registration order.
    pub fn on<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .on(event, Box::new(move |args| handler(args).boxed()));
    }

    /// Register a client-results handler (see [`SignalRClientBuilder::client_results`]).
    pub fn on_invocation<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        let boxed: ResultHandler = Box::new(move |args| handler(args).boxed());
        self.handlers.lock().unwrap().on_invocation(event, boxed);
    }

    pub fn on_open<F, Fut>(&self, cb: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cb: OpenCallback = Arc::new(move || cb().boxed());
        *self.on_open.lock().unwrap() = Some(cb);
    }

    pub fn on_close<F, Fut>(&self, cb: F)
    where
        F: Fn(Option<String>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cb: CloseCallback = Arc::new(move |err| cb(err).boxed());
        *self.on_close.lock().unwrap() = Some(cb);
    }

    /// Register the sink invoked when a `Completion` error arrives. Exactly
    /// one sink may be registered; receiving a completion error with none
    /// registered is a fatal runtime error.
    pub fn on_error<F>(&self, cb: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        *self.error_sink.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Fire-and-forget invocation.
    pub async fn send(&self, target: &str, arguments: Vec<Value>) -> Result<()> {
        self.send_message(&Message::Invocation {
            invocation_id: None,
            target: target.to_string(),
            arguments,
            headers: None,
        })
        .await
    }

    /// Invoke `target` and run `on_invocation` once when the server replies.
    pub async fn invoke<F>(
        &self,
        target: &str,
        arguments: Vec<Value>,
        on_invocation: F,
    ) -> Result<()>
    where
        F: FnOnce(Message) + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let cb: InvocationCallback = Box::new(on_invocation);
        self.registry.lock().unwrap().register_invocation(id.clone(), cb);
        self.send_message(&Message::Invocation {
            invocation_id: Some(id),
            target: target.to_string(),
            arguments,
            headers: None,
        })
        .await
    }

    /// Open a server stream.
    pub async fn stream(
        &self,
        target: &str,
        arguments: Vec<Value>,
        on_next: impl FnMut(Value) + Send + 'static,
        on_complete: impl FnOnce() + Send + 'static,
        on_error: impl FnOnce(Message) + Send + 'static,
    ) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        self.registry.lock().unwrap().register_stream(
            id.clone(),
            StreamObserver {
                on_next: Some(Box::new(on_next)),
                on_complete: Some(Box::new(on_complete)),
                on_error: Some(Box::new(on_error)),
            },
        );
        self.send_message(&Message::StreamInvocation {
            invocation_id: id,
            target: target.to_string(),
            arguments,
            headers: None,
        })
        .await
    }

    /// Acquire a client-to-server stream. `complete()` (or the returned
    /// guard's drop) always sends a termination message.
    pub async fn client_stream(&self, target: &str) -> Result<ClientStream> {
        let id = Uuid::new_v4().to_string();
        self.send_message(&Message::InvocationClientStream {
            stream_ids: vec![id.clone()],
            target: target.to_string(),
            arguments: vec![],
            headers: None,
        })
        .await?;
        Ok(ClientStream {
            id,
            client: self.clone(),
            completed: false,
        })
    }

    /// Send is called from the dispatch path (client-results replies,
    /// `ClientStream`) as well as directly by callers, concurrently with the
    /// receive/keepalive loop driven by `run` — `Transport` guards its own
    /// mutable state internally so neither side blocks the other.
    async fn send_message(&self, msg: &Message) -> Result<()> {
        self.transport.send(msg).await
    }

    /// Run the transport until it terminates (fatal error, or cancellation).
    pub async fn run(&self) -> Result<()> {
        let handlers = self.handlers.clone();
        let registry = self.registry.clone();
        let error_sink = self.error_sink.clone();
        let client_results = self.client_results;
        let self_for_dispatch = self.clone();

        let sink: MessageSink = Arc::new(move |msg: Message| {
            let handlers = handlers.clone();
            let registry = registry.clone();
            let error_sink = error_sink.clone();
            let client = self_for_dispatch.clone();
            async move {
                dispatch(msg, &handlers, &registry, &error_sink, client_results, &client).await
            }
            .boxed()
        });

        let on_open = self.on_open.lock().unwrap().clone();
        let on_close = self.on_close.lock().unwrap().clone();
        self.transport.run(sink, on_open, on_close).await
    }
}

async fn dispatch(
    msg: Message,
    handlers: &Arc<StdMutex<HandlerTable>>,
    registry: &Arc<StdMutex<InvocationRegistry>>,
    error_sink: &Arc<StdMutex<Option<ErrorSink>>>,
    client_results: bool,
    client: &SignalRClient,
) -> Result<()> {
    match msg {
        Message::InvocationBindingFailure { target, detail } => {
            return Err(crate::error::HubError::ServerError {
                message: format!("invocation binding failure for {target}: {detail}"),
            });
        }
        Message::Ping => {}
        Message::Invocation {
            invocation_id,
            target,
            arguments,
            ..
        } => {
            if client_results {
                let fut = {
                    let table = handlers.lock().unwrap();
                    table.result_handler_for(&target).map(|h| h(arguments.clone()))
                };
                if let Some(fut) = fut {
                    let result = fut.await;
                    if let Some(id) = invocation_id {
                        let msg = match result {
                            Ok(value) => Message::Completion {
                                invocation_id: id,
                                result: Some(value),
                                error: None,
                                headers: None,
                            },
                            Err(e) => Message::Completion {
                                invocation_id: id,
                                result: None,
                                error: Some(e),
                                headers: None,
                            },
                        };
                        let _ = client.send_message(&msg).await;
                    }
                    return Ok(());
                }
            }
            // Invoke handlers one at a time, each fully awaited before the
            // next, preserving registration order; the handler table lock
            // is not held across the await.
            let count = handlers.lock().unwrap().handlers_for(&target).len();
            for i in 0..count {
                let fut = {
                    let table = handlers.lock().unwrap();
                    table.handlers_for(&target).get(i).map(|h| h(arguments.clone()))
                };
                if let Some(fut) = fut {
                    fut.await;
                }
            }
        }
        Message::StreamInvocation { .. } => {
            warn!("server sent a StreamInvocation; servers should not send these to clients");
        }
        Message::StreamItem {
            invocation_id, item, ..
        } => {
            registry.lock().unwrap().stream_item(&invocation_id, item);
        }
        Message::CancelInvocation { invocation_id, .. } => {
            registry.lock().unwrap().stream_error(
                &invocation_id,
                Message::CancelInvocation {
                    invocation_id: invocation_id.clone(),
                    headers: None,
                },
            );
        }
        Message::Completion {
            invocation_id,
            result,
            error,
            headers,
        } => {
            if let Some(err) = &error {
                let sink = error_sink.lock().unwrap().clone();
                match sink {
                    Some(sink) => sink(err.clone()),
                    None => {
                        return Err(crate::error::HubError::UnhandledCompletionError(err.clone()));
                    }
                }
            }
            let full = Message::Completion {
                invocation_id: invocation_id.clone(),
                result,
                error,
                headers,
            };
            let completed = registry.lock().unwrap().complete_invocation(&invocation_id, full);
            if !completed {
                return Err(crate::error::HubError::ServerError {
                    message: format!(
                        "completion for unknown or already-completed invocation {invocation_id}"
                    ),
                });
            }
        }
        Message::Close { error, .. } => {
            if let Some(err) = error {
                return Err(crate::error::HubError::ServerError { message: err });
            }
        }
        Message::InvocationClientStream { .. } | Message::CompletionClientStream { .. } => {
            // Client-originated variants; a conforming server never sends these.
        }
    }
    Ok(())
}
