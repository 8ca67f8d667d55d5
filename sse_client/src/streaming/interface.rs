use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use super::types::{CloseReason, StreamKey};
use crate::transport::TransportError;

pub type ErrorCallback = Arc<dyn Fn(&StreamKey, &TransportError) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&StreamKey, &CloseReason) + Send + Sync>;
pub type TimeoutCallback = Arc<dyn Fn(&StreamKey) + Send + Sync>;

/// Caller-visible lifecycle callbacks
///
/// Each kind holds at most one handler; registering a new one replaces the
/// previous handler. A missing handler is a no-op.
#[derive(Default, Clone)]
pub struct LifecycleHandlers {
    /// Called for every transport error, before the retry decision
    pub on_error: Option<ErrorCallback>,

    /// Called when a subscription is torn down, with the reason
    pub on_close: Option<CloseCallback>,

    /// Called when a stream stays silent longer than the idle window
    pub on_timeout: Option<TimeoutCallback>,
}

impl LifecycleHandlers {
    /// Create a new empty set of lifecycle handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the error handler
    pub fn with_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&StreamKey, &TransportError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Set the close handler
    pub fn with_close<F>(mut self, handler: F) -> Self
    where
        F: Fn(&StreamKey, &CloseReason) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(handler));
        self
    }

    /// Set the timeout handler
    pub fn with_timeout<F>(mut self, handler: F) -> Self
    where
        F: Fn(&StreamKey) + Send + Sync + 'static,
    {
        self.on_timeout = Some(Arc::new(handler));
        self
    }

    pub(crate) fn emit_error(&self, key: &StreamKey, err: &TransportError) {
        if let Some(handler) = &self.on_error {
            guarded("error", key, || handler(key, err));
        }
    }

    pub(crate) fn emit_close(&self, key: &StreamKey, reason: &CloseReason) {
        if let Some(handler) = &self.on_close {
            guarded("close", key, || handler(key, reason));
        }
    }

    pub(crate) fn emit_timeout(&self, key: &StreamKey) {
        if let Some(handler) = &self.on_timeout {
            guarded("timeout", key, || handler(key));
        }
    }
}

impl std::fmt::Debug for LifecycleHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHandlers")
            .field("on_error", &self.on_error.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_timeout", &self.on_timeout.is_some())
            .finish()
    }
}

fn guarded(kind: &str, key: &StreamKey, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("The {} handler for stream {} panicked", kind, key);
    }
}

/// Statistics about the client's subscriptions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Stream keys currently subscribed, including those waiting to reconnect
    pub active_subscriptions: usize,

    /// Stream keys waiting for a reconnect attempt
    pub reconnecting: usize,

    /// Messages received on subscribed streams, before interception
    pub events_delivered: u64,

    /// Transport errors observed on current connections
    pub transport_errors: u64,

    /// Reconnect attempts scheduled
    pub reconnects: u64,

    /// Streams closed by the idle check
    pub timeouts: u64,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if any stream is subscribed
    pub fn is_active(&self) -> bool {
        self.active_subscriptions > 0
    }

    /// Subscriptions with a live connection
    pub fn connected(&self) -> usize {
        self.active_subscriptions.saturating_sub(self.reconnecting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_missing_handlers_are_noops() {
        let handlers = LifecycleHandlers::new();
        let key = StreamKey::from("/quiet");
        handlers.emit_error(&key, &TransportError::Ended);
        handlers.emit_close(&key, &CloseReason::Unsubscribed);
        handlers.emit_timeout(&key);
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let handlers = LifecycleHandlers::new().with_timeout(|_| panic!("boom"));
        handlers.emit_timeout(&StreamKey::from("/loud"));
    }

    #[test]
    fn test_handlers_receive_arguments() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handlers = LifecycleHandlers::new().with_close(move |key, reason| {
            sink.lock().unwrap().push((key.to_string(), reason.clone()));
        });

        handlers.emit_close(&StreamKey::from("/a"), &CloseReason::IdleTimeout);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("/a".to_string(), CloseReason::IdleTimeout)]
        );
    }

    #[test]
    fn test_stats_helpers() {
        let stats = ClientStats {
            active_subscriptions: 3,
            reconnecting: 1,
            ..ClientStats::new()
        };
        assert!(stats.is_active());
        assert_eq!(stats.connected(), 2);
        assert!(!ClientStats::default().is_active());
    }
}
