//! In-process transport driven by the caller.
//!
//! Each `connect` creates a [`MemoryEventSource`] that stays silent until the
//! owner calls [`open`](MemoryEventSource::open), [`emit`](MemoryEventSource::emit)
//! or [`fail`](MemoryEventSource::fail). The transport keeps every source it
//! created so tests can inspect connection counts and listener attachments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    ErrorHandler, EventSource, Listener, ListenerTable, MessageEvent, OpenHandler, Transport,
    TransportError,
};

/// What happens to a connection as soon as it is created
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    /// Stay connecting until driven manually
    #[default]
    Manual,
    /// Report open immediately
    Open,
    /// Report the given error immediately
    Fail(TransportError),
}

#[derive(Default)]
struct MemoryState {
    behavior: ConnectBehavior,
    sources: Vec<Arc<MemoryEventSource>>,
}

/// Test double implementing [`Transport`]
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_behavior(behavior: ConnectBehavior) -> Arc<Self> {
        let transport = Self::default();
        transport.lock().behavior = behavior;
        Arc::new(transport)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the behavior applied to connections created from now on
    pub fn set_behavior(&self, behavior: ConnectBehavior) {
        self.lock().behavior = behavior;
    }

    /// Every source created so far, oldest first
    pub fn sources(&self) -> Vec<Arc<MemoryEventSource>> {
        self.lock().sources.clone()
    }

    /// Number of connections opened for `url`
    pub fn connect_count(&self, url: &str) -> usize {
        self.lock().sources.iter().filter(|s| s.url == url).count()
    }

    /// Most recent source created for `url`
    pub fn latest(&self, url: &str) -> Option<Arc<MemoryEventSource>> {
        self.lock().sources.iter().rev().find(|s| s.url == url).cloned()
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, url: &str) -> Arc<dyn EventSource> {
        let source = Arc::new(MemoryEventSource {
            url: url.to_string(),
            table: ListenerTable::new(),
            attach_counts: Mutex::new(HashMap::new()),
        });

        let behavior = {
            let mut state = self.lock();
            state.sources.push(Arc::clone(&source));
            state.behavior.clone()
        };
        match behavior {
            ConnectBehavior::Manual => {}
            ConnectBehavior::Open => source.open(),
            ConnectBehavior::Fail(err) => source.fail(err),
        }
        source
    }
}

/// Source created by [`MemoryTransport`]
pub struct MemoryEventSource {
    url: String,
    table: ListenerTable,
    attach_counts: Mutex<HashMap<String, usize>>,
}

impl MemoryEventSource {
    /// Report the open condition
    pub fn open(&self) {
        self.table.open();
    }

    /// Deliver an event to the listeners attached for `event`
    pub fn emit(&self, event: &str, data: &str) {
        self.table.dispatch(MessageEvent::new(event, data));
    }

    /// Report a terminal error
    pub fn fail(&self, err: TransportError) {
        self.table.fail(err);
    }

    /// Listeners currently attached for `event`
    pub fn listener_count(&self, event: &str) -> usize {
        self.table.listener_count(event)
    }

    /// Total `add_event_listener` calls ever made for `event`
    pub fn attach_count(&self, event: &str) -> usize {
        self.attach_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_open(&self) -> bool {
        self.table.is_open()
    }
}

impl EventSource for MemoryEventSource {
    fn url(&self) -> &str {
        &self.url
    }

    fn add_event_listener(&self, event: &str, listener: Listener) {
        *self
            .attach_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default() += 1;
        self.table.add_listener(event, listener);
    }

    fn remove_event_listener(&self, event: &str, listener: &Listener) {
        self.table.remove_listener(event, listener);
    }

    fn set_on_open(&self, handler: OpenHandler) {
        self.table.set_on_open(handler);
    }

    fn set_on_error(&self, handler: ErrorHandler) {
        self.table.set_on_error(handler);
    }

    fn close(&self) {
        self.table.close();
    }

    fn is_closed(&self) -> bool {
        self.table.is_closed()
    }
}
