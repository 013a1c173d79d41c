//! Correlation state for in-flight invocations, streams, and registered
//! event handlers.
//!
//! These types hold no lock of their own; [`crate::client::SignalRClient`]
//! wraps each in a `std::sync::Mutex` since every access is a short,
//! synchronous lookup or insert with no `.await` in between.

use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;

use crate::messages::Message;

pub type InvocationCallback = Box<dyn FnOnce(Message) + Send>;

pub struct StreamObserver {
    pub on_next: Option<Box<dyn FnMut(Value) + Send>>,
    pub on_complete: Option<Box<dyn FnOnce() + Send>>,
    pub on_error: Option<Box<dyn FnOnce(Message) + Send>>,
}

pub type InvocationHandler = Box<dyn Fn(Vec<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

/// `event -> target` followed by result: a handler that may produce a
/// return value for the opt-in "client results" feature (see `SPEC_FULL.md`
/// §9).
pub type ResultHandler =
    Box<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

#[derive(Default)]
pub struct InvocationRegistry {
    pending_invocations: HashMap<String, InvocationCallback>,
    pending_streams: HashMap<String, StreamObserver>,
}

impl InvocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_invocation(&mut self, id: String, cb: InvocationCallback) {
        self.pending_invocations.insert(id, cb);
    }

    pub fn register_stream(&mut self, id: String, observer: StreamObserver) {
        self.pending_streams.insert(id, observer);
    }

    /// Pop and invoke the callback for `id`, if one is registered. Returns
    /// `true` if a callback was found.
    pub fn complete_invocation(&mut self, id: &str, msg: Message) -> bool {
        match self.pending_invocations.remove(id) {
            Some(cb) => {
                cb(msg);
                true
            }
            None => false,
        }
    }

    pub fn stream_item(&mut self, id: &str, item: Value) {
        if let Some(observer) = self.pending_streams.get_mut(id) {
            if let Some(on_next) = observer.on_next.as_mut() {
                on_next(item);
            }
        }
    }

    pub fn stream_error(&mut self, id: &str, msg: Message) {
        if let Some(observer) = self.pending_streams.remove(id) {
            if let Some(on_error) = observer.on_error {
                on_error(msg);
            }
        }
    }

    pub fn stream_complete(&mut self, id: &str) {
        if let Some(observer) = self.pending_streams.remove(id) {
            if let Some(on_complete) = observer.on_complete {
                on_complete();
            }
        }
    }

    pub fn clear(&mut self) {
        self.pending_invocations.clear();
        self.pending_streams.clear();
    }
}

/// `event_name -> ordered handlers`, invoked in registration order.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Vec<InvocationHandler>>,
    result_handlers: HashMap<String, ResultHandler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, event: &str, handler: InvocationHandler) {
        self.handlers.entry(event.to_string()).or_default().push(handler);
    }

    pub fn on_invocation(&mut self, event: &str, handler: ResultHandler) {
        self.result_handlers.insert(event.to_string(), handler);
    }

    pub fn handlers_for<'a>(&'a self, event: &str) -> &'a [InvocationHandler] {
        self.handlers.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn result_handler_for(&self, event: &str) -> Option<&ResultHandler> {
        self.result_handlers.get(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn handlers_fire_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut table = HandlerTable::new();

        let o1 = order.clone();
        table.on(
            "ev",
            Box::new(move |_| {
                o1.lock().unwrap().push(1);
                Box::pin(async {})
            }),
        );
        let o2 = order.clone();
        table.on(
            "ev",
            Box::new(move |_| {
                o2.lock().unwrap().push(2);
                Box::pin(async {})
            }),
        );

        for h in table.handlers_for("ev") {
            let _ = h(vec![]);
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn completion_pops_and_invokes_once() {
        let called = Arc::new(AtomicUsize::new(0));
        let mut reg = InvocationRegistry::new();
        let c = called.clone();
        reg.register_invocation(
            "x".into(),
            Box::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(reg.complete_invocation(
            "x",
            Message::Completion {
                invocation_id: "x".into(),
                result: None,
                error: None,
                headers: None,
            }
        ));
        assert_eq!(called.load(Ordering::SeqCst), 1);
        // second completion for the same id finds nothing registered
        assert!(!reg.complete_invocation(
            "x",
            Message::Completion {
                invocation_id: "x".into(),
                result: None,
                error: None,
                headers: None,
            }
        ));
    }
}
