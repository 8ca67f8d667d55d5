//! Fan-out of one stream connection to many handlers.
//!
//! An [`EventMultiplexer`] attaches one low-level listener per event name to
//! its connection and feeds everything it receives through a single queue, so
//! events are decoded, intercepted and delivered strictly in arrival order.
//! The handle outlives individual connections: the client re-binds it after a
//! reconnect and detaches it for good when the subscription ends.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::types::{decode_payload, is_falsy, Interceptor, StreamKey};
use crate::error::{Result, SseError};
use crate::transport::{EventSource, Listener, MessageEvent, DEFAULT_EVENT};

/// Event name that matches every event
pub const WILDCARD: &str = "*";

/// Handler for the payload of one event name
pub type MessageHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handler receiving every event together with its name
pub type WildcardHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Called with the stream key for every message as it arrives from the connection
pub(crate) type ActivityHook = Arc<dyn Fn(&StreamKey) + Send + Sync>;

/// Called every time a bound connection reports open
pub(crate) type OpenHook = Box<dyn Fn() + Send + Sync>;

#[derive(Clone)]
enum WildcardEntry {
    Payload(MessageHandler),
    Named(WildcardHandler),
}

#[derive(Default)]
struct MuxState {
    handlers: HashMap<String, Vec<MessageHandler>>,
    wildcard: Vec<WildcardEntry>,
    /// One transport listener per non-reserved event name
    listeners: HashMap<String, Listener>,
    source: Option<Arc<dyn EventSource>>,
}

/// Receiving end of every transport listener: records activity, then queues
struct Intake {
    key: StreamKey,
    on_message: Option<ActivityHook>,
    queue: mpsc::UnboundedSender<MessageEvent>,
    detached: CancellationToken,
}

impl Intake {
    fn accept(&self, event: MessageEvent) {
        if self.detached.is_cancelled() {
            return;
        }
        if let Some(hook) = &self.on_message {
            hook(&self.key);
        }
        let _ = self.queue.send(event);
    }

    fn listener(self: &Arc<Self>) -> Listener {
        let intake = Arc::clone(self);
        Arc::new(move |event: MessageEvent| intake.accept(event))
    }
}

struct Inner {
    key: StreamKey,
    interceptor: Option<Arc<dyn Interceptor>>,
    state: Mutex<MuxState>,
    intake: Arc<Intake>,
    default_listener: Listener,
    opened: watch::Sender<bool>,
    detached: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.detached.cancel();
    }
}

/// Handle through which callers attach handlers to one subscribed stream
///
/// Cloning is cheap; clones refer to the same multiplexer and compare equal.
#[derive(Clone)]
pub struct EventMultiplexer {
    inner: Arc<Inner>,
}

impl PartialEq for EventMultiplexer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EventMultiplexer {}

impl std::fmt::Debug for EventMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMultiplexer")
            .field("key", &self.inner.key)
            .field("opened", &self.is_opened())
            .field("active", &self.is_active())
            .finish()
    }
}

impl EventMultiplexer {
    pub(crate) fn new(
        key: StreamKey,
        interceptor: Option<Arc<dyn Interceptor>>,
        on_message: Option<ActivityHook>,
        runtime: &Handle,
    ) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let detached = CancellationToken::new();
        let intake = Arc::new(Intake {
            key: key.clone(),
            on_message,
            queue,
            detached: detached.clone(),
        });
        let default_listener = intake.listener();
        let (opened, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            key,
            interceptor,
            state: Mutex::new(MuxState::default()),
            intake,
            default_listener,
            opened,
            detached,
        });

        runtime.spawn(run_dispatch(
            Arc::downgrade(&inner),
            rx,
            inner.detached.clone(),
        ));

        Self { inner }
    }

    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &StreamKey {
        &self.inner.key
    }

    /// Register a payload handler for `event`
    ///
    /// `"message"` is the stream's unnamed event and `"*"` receives the
    /// payload of every event.
    pub fn on<F>(&self, event: &str, handler: F) -> &Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.add_handler(event, Arc::new(handler));
        self
    }

    /// Register a handler that receives the payload deserialized into `T`
    ///
    /// Payloads that do not match `T` are skipped.
    pub fn on_typed<T, F>(&self, event: &str, handler: F) -> &Self
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let key = self.inner.key.clone();
        let name = event.to_string();
        self.on(event, move |payload| match T::deserialize(payload) {
            Ok(value) => handler(value),
            Err(e) => log::warn!(
                "Skipping {} event on stream {}: payload does not match: {}",
                name,
                key,
                e
            ),
        })
    }

    /// Register a handler receiving every event name with its payload
    pub fn on_any<F>(&self, handler: F) -> &Self
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.add_wildcard_handler(Arc::new(handler));
        self
    }

    /// Register a handler and return it, for a later targeted [`off`](Self::off)
    pub fn add_handler(&self, event: &str, handler: MessageHandler) -> MessageHandler {
        let mut state = self.lock();
        if event == WILDCARD {
            state.wildcard.push(WildcardEntry::Payload(Arc::clone(&handler)));
            return handler;
        }

        state
            .handlers
            .entry(event.to_string())
            .or_default()
            .push(Arc::clone(&handler));

        if event != DEFAULT_EVENT && !state.listeners.contains_key(event) {
            let listener = self.inner.intake.listener();
            if let Some(source) = &state.source {
                source.add_event_listener(event, Arc::clone(&listener));
            }
            state.listeners.insert(event.to_string(), listener);
        }
        handler
    }

    /// Register a name-aware wildcard handler and return it
    pub fn add_wildcard_handler(&self, handler: WildcardHandler) -> WildcardHandler {
        self.lock()
            .wildcard
            .push(WildcardEntry::Named(Arc::clone(&handler)));
        handler
    }

    /// Remove one handler, or every handler when `handler` is `None`
    ///
    /// Once no handler remains for a named event its transport listener is
    /// detached as well.
    pub fn off(&self, event: &str, handler: Option<&MessageHandler>) -> &Self {
        let mut state = self.lock();
        if event == WILDCARD {
            state.wildcard.retain(|entry| match (entry, handler) {
                (_, None) => false,
                (WildcardEntry::Payload(h), Some(target)) => !Arc::ptr_eq(h, target),
                (WildcardEntry::Named(_), Some(_)) => true,
            });
            return self;
        }

        let now_empty = match state.handlers.get_mut(event) {
            Some(list) => {
                match handler {
                    Some(target) => list.retain(|h| !Arc::ptr_eq(h, target)),
                    None => list.clear(),
                }
                list.is_empty()
            }
            None => true,
        };
        if now_empty {
            state.handlers.remove(event);
            if let Some(listener) = state.listeners.remove(event) {
                if let Some(source) = &state.source {
                    source.remove_event_listener(event, &listener);
                }
            }
        }
        self
    }

    /// Remove name-aware wildcard handlers (all of them when `handler` is `None`)
    pub fn off_any(&self, handler: Option<&WildcardHandler>) -> &Self {
        self.lock().wildcard.retain(|entry| match (entry, handler) {
            (_, None) => false,
            (WildcardEntry::Named(h), Some(target)) => !Arc::ptr_eq(h, target),
            (WildcardEntry::Payload(_), Some(_)) => true,
        });
        self
    }

    /// Remove every handler and detach every named transport listener
    pub fn off_all(&self) {
        let mut state = self.lock();
        state.handlers.clear();
        state.wildcard.clear();
        let listeners = std::mem::take(&mut state.listeners);
        if let Some(source) = &state.source {
            for (event, listener) in &listeners {
                source.remove_event_listener(event, listener);
            }
        }
    }

    /// Wait until the stream reports open for the first time
    ///
    /// Returns immediately once it has opened. Fails with
    /// [`SseError::SubscriptionClosed`] if the subscription ends first.
    pub async fn wait_until_opened(&self) -> Result<()> {
        let mut opened = self.inner.opened.subscribe();
        let detached = self.inner.detached.clone();

        tokio::select! {
            biased;
            res = opened.wait_for(|open| *open) => {
                res.map(|_| ()).map_err(|_| SseError::SubscriptionClosed)
            }
            _ = detached.cancelled() => {
                if self.is_opened() {
                    Ok(())
                } else {
                    Err(SseError::SubscriptionClosed)
                }
            }
        }
    }

    /// Whether the stream has reported open at least once
    pub fn is_opened(&self) -> bool {
        *self.inner.opened.borrow()
    }

    /// Whether this multiplexer still belongs to a live subscription
    pub fn is_active(&self) -> bool {
        !self.inner.detached.is_cancelled()
    }

    /// Event names with a transport listener, besides `"message"`
    pub fn listened_events(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().listeners.keys().cloned().collect();
        names.sort();
        names
    }

    /// Attach to a new connection, re-attaching every listener exactly once
    pub(crate) fn bind(&self, source: Arc<dyn EventSource>, on_open: OpenHook) {
        {
            let mut state = self.lock();
            if !self.is_active() {
                return;
            }
            source.add_event_listener(DEFAULT_EVENT, Arc::clone(&self.inner.default_listener));
            for (event, listener) in &state.listeners {
                source.add_event_listener(event, Arc::clone(listener));
            }
            state.source = Some(Arc::clone(&source));
        }

        let weak = Arc::downgrade(&self.inner);
        source.set_on_open(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.opened.send_replace(true);
            }
            on_open();
        }));
    }

    /// Drop the current connection without detaching for good
    pub(crate) fn unbind(&self) {
        self.lock().source = None;
    }

    /// Permanently disconnect this multiplexer from the client
    pub(crate) fn detach(&self) {
        let source = {
            let mut state = self.lock();
            state.source.take()
        };
        self.inner.detached.cancel();
        if let Some(source) = source {
            source.remove_event_listener(DEFAULT_EVENT, &self.inner.default_listener);
        }
    }
}

async fn run_dispatch(
    inner: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<MessageEvent>,
    detached: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = detached.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.process(event).await;
    }
}

impl Inner {
    async fn process(&self, event: MessageEvent) {
        if self.detached.is_cancelled() {
            return;
        }

        let mut payload = decode_payload(&event.data);

        if let Some(interceptor) = &self.interceptor {
            let intercepted = AssertUnwindSafe(interceptor.intercept(&self.key, &event.event, payload))
                .catch_unwind()
                .await;
            match intercepted {
                Ok(Some(value)) if !is_falsy(&value) => payload = value,
                Ok(_) => {
                    log::trace!("Interceptor dropped {} event on stream {}", event.event, self.key);
                    return;
                }
                Err(_) => {
                    log::error!(
                        "Interceptor panicked on {} event for stream {}, dropping it",
                        event.event,
                        self.key
                    );
                    return;
                }
            }
        }

        // The subscription may have ended while the interceptor ran
        if self.detached.is_cancelled() {
            log::debug!("Dropping stale {} event for stream {}", event.event, self.key);
            return;
        }

        self.emit(&event.event, &payload);
    }

    fn emit(&self, event: &str, payload: &Value) {
        let (named, wildcard) = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            (
                state.handlers.get(event).cloned().unwrap_or_default(),
                state.wildcard.clone(),
            )
        };

        for handler in named {
            self.guarded(event, || handler(payload));
        }
        for entry in wildcard {
            match entry {
                WildcardEntry::Payload(handler) => self.guarded(event, || handler(payload)),
                WildcardEntry::Named(handler) => self.guarded(event, || handler(event, payload)),
            }
        }
    }

    fn guarded(&self, event: &str, f: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            log::error!("Handler for {} event on stream {} panicked", event, self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::types::sync_interceptor;
    use crate::transport::{MemoryEventSource, MemoryTransport, Transport};
    use serde_json::json;
    use std::time::Duration;

    fn bound(interceptor: Option<Arc<dyn Interceptor>>) -> (EventMultiplexer, Arc<MemoryEventSource>) {
        let transport = MemoryTransport::new();
        let mux = EventMultiplexer::new(StreamKey::from("/s"), interceptor, None, &Handle::current());
        mux.bind(transport.connect("/s"), Box::new(|| {}));
        let source = transport.latest("/s").unwrap();
        source.open();
        (mux, source)
    }

    fn recorder() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&Value) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: &Value| sink.lock().unwrap().push(v.clone()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_payloads_are_decoded_before_delivery() {
        let (mux, source) = bound(None);
        let (seen, handler) = recorder();
        mux.on("message", handler);

        source.emit("message", r#"{"n": 1}"#);
        source.emit("message", "plain text");
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![json!({"n": 1}), json!("plain text")]);
    }

    #[tokio::test]
    async fn test_named_listener_is_attached_once() {
        let (mux, source) = bound(None);
        mux.on("update", |_| {}).on("update", |_| {});

        assert_eq!(source.attach_count("update"), 1);
        assert_eq!(source.listener_count("update"), 1);
        assert_eq!(source.attach_count("message"), 1);
        assert_eq!(mux.listened_events(), vec!["update".to_string()]);
    }

    #[tokio::test]
    async fn test_off_detaches_listener_when_last_handler_goes() {
        let (mux, source) = bound(None);
        let first = mux.add_handler("update", Arc::new(|_| {}));
        let second = mux.add_handler("update", Arc::new(|_| {}));

        mux.off("update", Some(&first));
        assert_eq!(source.listener_count("update"), 1);
        mux.off("update", Some(&second));
        assert_eq!(source.listener_count("update"), 0);

        // Removing "message" handlers never detaches the default listener
        mux.on("message", |_| {});
        mux.off("message", None);
        assert_eq!(source.listener_count("message"), 1);
    }

    #[tokio::test]
    async fn test_wildcards_see_named_events_after_named_handlers() {
        let (mux, source) = bound(None);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        mux.on_any(move |event, payload| o.lock().unwrap().push(format!("any:{}:{}", event, payload)));
        let o = Arc::clone(&order);
        mux.on("*", move |payload| o.lock().unwrap().push(format!("star:{}", payload)));
        let o = Arc::clone(&order);
        mux.on("tick", move |payload| o.lock().unwrap().push(format!("tick:{}", payload)));

        source.emit("tick", "1");
        settle().await;

        assert_eq!(
            *order.lock().unwrap(),
            vec!["tick:1".to_string(), "any:tick:1".to_string(), "star:1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_falsy_interceptor_result_suppresses_delivery() {
        let interceptor = sync_interceptor(|_key, _event, payload| {
            if payload == json!("drop") {
                Some(json!(0))
            } else {
                Some(json!({ "wrapped": payload }))
            }
        });
        let (mux, source) = bound(Some(interceptor));
        let (seen, handler) = recorder();
        let (any_seen, any_handler) = recorder();
        mux.on("message", handler).on("*", any_handler);

        source.emit("message", "keep");
        source.emit("message", "drop");
        source.emit("message", "again");
        settle().await;

        let expected = vec![json!({"wrapped": "keep"}), json!({"wrapped": "again"})];
        assert_eq!(*seen.lock().unwrap(), expected);
        assert_eq!(*any_seen.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_others() {
        let (mux, source) = bound(None);
        let (seen, handler) = recorder();
        mux.on("message", |_| panic!("handler failure")).on("message", handler);

        source.emit("message", "1");
        source.emit("message", "2");
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_typed_handler_skips_mismatched_payloads() {
        #[derive(serde::Deserialize)]
        struct Price {
            amount: u32,
        }

        let (mux, source) = bound(None);
        let amounts = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&amounts);
        mux.on_typed("price", move |p: Price| sink.lock().unwrap().push(p.amount));

        source.emit("price", r#"{"amount": 5}"#);
        source.emit("price", "not a price");
        source.emit("price", r#"{"amount": 7}"#);
        settle().await;

        assert_eq!(*amounts.lock().unwrap(), vec![5, 7]);
    }

    #[tokio::test]
    async fn test_wait_until_opened() {
        let transport = MemoryTransport::new();
        let mux = EventMultiplexer::new(StreamKey::from("/w"), None, None, &Handle::current());
        mux.bind(transport.connect("/w"), Box::new(|| {}));

        let waiter = {
            let mux = mux.clone();
            tokio::spawn(async move { mux.wait_until_opened().await })
        };
        settle().await;
        assert!(!waiter.is_finished());

        transport.latest("/w").unwrap().open();
        assert!(waiter.await.unwrap().is_ok());
        assert!(mux.wait_until_opened().await.is_ok());
        assert!(mux.is_opened());
    }

    #[tokio::test]
    async fn test_wait_fails_when_detached_before_open() {
        let transport = MemoryTransport::new();
        let mux = EventMultiplexer::new(StreamKey::from("/d"), None, None, &Handle::current());
        mux.bind(transport.connect("/d"), Box::new(|| {}));

        mux.detach();

        assert!(matches!(mux.wait_until_opened().await, Err(SseError::SubscriptionClosed)));
        assert!(!mux.is_active());
    }

    #[tokio::test]
    async fn test_rebind_reattaches_each_listener_once() {
        let transport = MemoryTransport::new();
        let mux = EventMultiplexer::new(StreamKey::from("/r"), None, None, &Handle::current());
        mux.bind(transport.connect("/r"), Box::new(|| {}));
        mux.on("a", |_| {}).on("b", |_| {}).on("b", |_| {});

        let first = transport.latest("/r").unwrap();
        first.close();
        mux.unbind();
        mux.bind(transport.connect("/r"), Box::new(|| {}));

        let second = transport.latest("/r").unwrap();
        assert_eq!(second.attach_count("a"), 1);
        assert_eq!(second.attach_count("b"), 1);
        assert_eq!(second.attach_count("message"), 1);
    }

    #[tokio::test]
    async fn test_stale_events_are_dropped_after_detach() {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        let interceptor: Arc<dyn Interceptor> = Arc::new(move |_key: StreamKey, _event: String, payload: Value| {
            let release_rx = Arc::clone(&release_rx);
            async move {
                if let Some(rx) = release_rx.lock().await.take() {
                    let _ = rx.await;
                }
                Some(payload)
            }
        });
        let (mux, source) = bound(Some(interceptor));
        let (seen, handler) = recorder();
        mux.on("message", handler);

        source.emit("message", "late");
        settle().await;
        mux.detach();
        let _ = release_tx.send(());
        settle().await;

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_activity_is_recorded_on_arrival_not_delivery() {
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&arrivals);
        let hook: ActivityHook = Arc::new(move |key: &StreamKey| sink.lock().unwrap().push(key.clone()));
        let interceptor: Arc<dyn Interceptor> = Arc::new(|_key: StreamKey, _event: String, payload: Value| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Some(payload)
        });

        let transport = MemoryTransport::new();
        let mux = EventMultiplexer::new(StreamKey::from("/busy"), Some(interceptor), Some(hook), &Handle::current());
        mux.bind(transport.connect("/busy"), Box::new(|| {}));
        let source = transport.latest("/busy").unwrap();
        source.open();

        // The first event is stuck in the interceptor; the rest wait in the queue
        for _ in 0..3 {
            source.emit("message", "tick");
        }
        settle().await;
        assert_eq!(arrivals.lock().unwrap().len(), 3);

        mux.detach();
        source.emit("message", "after");
        assert_eq!(arrivals.lock().unwrap().len(), 3);
    }
}
