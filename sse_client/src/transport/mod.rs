//! Transport capability for long-lived event streams.
//!
//! The subscription layer never talks HTTP directly. It opens connections
//! through a [`Transport`] and observes each one through the [`EventSource`]
//! contract: named listeners, an open handler, an error handler and `close()`.
//!
//! A connection reports at most one error and never reconnects on its own;
//! reconnecting is decided by the client's retry controller.

pub mod http;
pub mod memory;
pub mod parser;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use http::{HttpEventSource, HttpTransport};
pub use memory::{ConnectBehavior, MemoryEventSource, MemoryTransport};
pub use parser::EventParser;

/// Name of the unnamed/default event type
pub const DEFAULT_EVENT: &str = "message";

/// A single event received from a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    /// Event type (`"message"` when the server did not name it)
    pub event: String,
    /// Raw text payload
    pub data: String,
    /// Last event id seen on the stream (empty when none)
    pub last_event_id: String,
}

impl MessageEvent {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            last_event_id: String::new(),
        }
    }
}

/// Error reported by a stream connection
///
/// This is the "raw error event" handed to the error and close callbacks, so it
/// is cheap to clone and carries only rendered messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Unexpected content type: {0}")]
    ContentType(String),

    #[error("Failed to read from stream: {0}")]
    Read(String),

    #[error("Stream ended by server")]
    Ended,

    #[error("Connection closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Read(err.to_string())
        }
    }
}

/// Low-level listener attached to a connection for one event name
///
/// Identity is the `Arc` pointer, which is what `remove_event_listener` matches on.
pub type Listener = Arc<dyn Fn(MessageEvent) + Send + Sync>;

/// Handler invoked when a connection is established
pub type OpenHandler = Box<dyn Fn() + Send + Sync>;

/// Handler invoked when a connection fails
pub type ErrorHandler = Box<dyn Fn(TransportError) + Send + Sync>;

/// One physical stream connection
pub trait EventSource: Send + Sync {
    /// URL this connection was opened for
    fn url(&self) -> &str;

    /// Attach a listener for events of the given name
    fn add_event_listener(&self, event: &str, listener: Listener);

    /// Detach a previously attached listener (matched by pointer identity)
    fn remove_event_listener(&self, event: &str, listener: &Listener);

    /// Assign the open handler, replacing any previous one
    fn set_on_open(&self, handler: OpenHandler);

    /// Assign the error handler, replacing any previous one
    fn set_on_error(&self, handler: ErrorHandler);

    /// Close the connection; no callback fires afterwards
    fn close(&self);

    /// Whether `close()` has been called
    fn is_closed(&self) -> bool;
}

/// Factory for stream connections
///
/// `connect` must not block: the outcome is reported through the handlers
/// assigned on the returned source.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, url: &str) -> Arc<dyn EventSource>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourcePhase {
    Connecting,
    Open,
    Failed,
    Closed,
}

struct TableState {
    phase: SourcePhase,
    listeners: HashMap<String, Vec<Listener>>,
    on_open: Option<Arc<dyn Fn() + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(TransportError) + Send + Sync>>,
    pending_open: bool,
    pending_error: Option<TransportError>,
}

/// Listener bookkeeping shared by the transport implementations
///
/// Open and error conditions that happen before their handler is assigned are
/// replayed on assignment, so callers may wire handlers after `connect` returns.
/// Callbacks are always invoked with the internal lock released.
pub(crate) struct ListenerTable {
    state: Mutex<TableState>,
}

impl ListenerTable {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                phase: SourcePhase::Connecting,
                listeners: HashMap::new(),
                on_open: None,
                on_error: None,
                pending_open: false,
                pending_error: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add_listener(&self, event: &str, listener: Listener) {
        self.lock()
            .listeners
            .entry(event.to_string())
            .or_default()
            .push(listener);
    }

    pub(crate) fn remove_listener(&self, event: &str, listener: &Listener) {
        let mut state = self.lock();
        if let Some(list) = state.listeners.get_mut(event) {
            list.retain(|l| !Arc::ptr_eq(l, listener));
            if list.is_empty() {
                state.listeners.remove(event);
            }
        }
    }

    pub(crate) fn listener_count(&self, event: &str) -> usize {
        self.lock().listeners.get(event).map_or(0, Vec::len)
    }

    pub(crate) fn set_on_open(&self, handler: OpenHandler) {
        let handler: Arc<dyn Fn() + Send + Sync> = Arc::from(handler);
        let replay = {
            let mut state = self.lock();
            state.on_open = Some(Arc::clone(&handler));
            std::mem::take(&mut state.pending_open)
        };
        if replay {
            handler();
        }
    }

    pub(crate) fn set_on_error(&self, handler: ErrorHandler) {
        let handler: Arc<dyn Fn(TransportError) + Send + Sync> = Arc::from(handler);
        let replay = {
            let mut state = self.lock();
            state.on_error = Some(Arc::clone(&handler));
            state.pending_error.take()
        };
        if let Some(err) = replay {
            handler(err);
        }
    }

    /// Transition to open; returns false if the source is already failed or closed
    pub(crate) fn open(&self) -> bool {
        let handler = {
            let mut state = self.lock();
            if state.phase != SourcePhase::Connecting {
                return false;
            }
            state.phase = SourcePhase::Open;
            match &state.on_open {
                Some(h) => Some(Arc::clone(h)),
                None => {
                    state.pending_open = true;
                    None
                }
            }
        };
        if let Some(handler) = handler {
            handler();
        }
        true
    }

    /// Report the terminal error; later calls are ignored
    pub(crate) fn fail(&self, err: TransportError) {
        let handler = {
            let mut state = self.lock();
            if matches!(state.phase, SourcePhase::Failed | SourcePhase::Closed) {
                return;
            }
            state.phase = SourcePhase::Failed;
            state.pending_open = false;
            match &state.on_error {
                Some(h) => Some(Arc::clone(h)),
                None => {
                    state.pending_error = Some(err.clone());
                    None
                }
            }
        };
        if let Some(handler) = handler {
            handler(err);
        }
    }

    /// Hand an event to every listener attached for its name
    pub(crate) fn dispatch(&self, event: MessageEvent) {
        let listeners = {
            let state = self.lock();
            if state.phase != SourcePhase::Open {
                return;
            }
            match state.listeners.get(&event.event) {
                Some(list) => list.clone(),
                None => return,
            }
        };
        for listener in listeners {
            listener(event.clone());
        }
    }

    /// Mark closed and drop every handler; returns false if already closed
    pub(crate) fn close(&self) -> bool {
        let mut state = self.lock();
        if state.phase == SourcePhase::Closed {
            return false;
        }
        state.phase = SourcePhase::Closed;
        state.listeners.clear();
        state.on_open = None;
        state.on_error = None;
        state.pending_open = false;
        state.pending_error = None;
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().phase == SourcePhase::Closed
    }

    pub(crate) fn is_open(&self) -> bool {
        self.lock().phase == SourcePhase::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_open_before_handler_is_replayed() {
        let table = ListenerTable::new();
        assert!(table.open());

        let opened = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        table.set_on_open(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        // Replacing the handler must not replay again
        let counter = Arc::clone(&opened);
        table.set_on_open(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_is_reported_once() {
        let table = ListenerTable::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        table.set_on_error(Box::new(move |e| sink.lock().unwrap().push(e)));

        table.fail(TransportError::Status(500));
        table.fail(TransportError::Ended);

        assert_eq!(*errors.lock().unwrap(), vec![TransportError::Status(500)]);
    }

    #[test]
    fn test_dispatch_only_reaches_matching_listeners() {
        let table = ListenerTable::new();
        table.open();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Listener = Arc::new(move |e: MessageEvent| sink.lock().unwrap().push(e.data));
        table.add_listener("update", Arc::clone(&listener));

        table.dispatch(MessageEvent::new("update", "a"));
        table.dispatch(MessageEvent::new("other", "b"));
        table.remove_listener("update", &listener);
        table.dispatch(MessageEvent::new("update", "c"));

        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string()]);
        assert_eq!(table.listener_count("update"), 0);
    }

    #[test]
    fn test_nothing_fires_after_close() {
        let table = ListenerTable::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        table.set_on_error(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(table.close());
        assert!(!table.close());
        table.fail(TransportError::Ended);
        assert!(!table.open());

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(table.is_closed());
    }
}
