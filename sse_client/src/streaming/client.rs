//! Subscription registry.
//!
//! [`SseClient`] maps stream keys to one live connection and one
//! [`EventMultiplexer`] each. Transport errors go through the
//! [`RetryController`]; silent streams are closed by the
//! [`IdleTimeoutMonitor`]. Caller callbacks are never invoked while the
//! registry lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::config::{ClientConfig, RetryConfig};
use super::idle::{ActivityTracker, IdleTimeoutMonitor};
use super::interface::{ClientStats, LifecycleHandlers};
use super::multiplexer::{ActivityHook, EventMultiplexer};
use super::retry::{RetryController, RetryDecision, RetryState};
use super::types::{CloseReason, ConnectionId, Interceptor, StreamKey};
use crate::error::{Result, SseError};
use crate::transport::{EventSource, HttpTransport, Transport, TransportError};

enum Link {
    Connected {
        id: ConnectionId,
        source: Arc<dyn EventSource>,
    },
    /// Waiting to open connection `next`
    Reconnecting {
        next: ConnectionId,
        attempt: u32,
        cancel: CancellationToken,
    },
}

struct Subscription {
    multiplexer: EventMultiplexer,
    link: Link,
}

impl Subscription {
    fn close(self) {
        match self.link {
            Link::Connected { source, .. } => source.close(),
            Link::Reconnecting { cancel, .. } => cancel.cancel(),
        }
        self.multiplexer.detach();
    }
}

enum AfterFailure {
    Reconnect {
        attempt: u32,
        delay: Duration,
        next: ConnectionId,
        cancel: CancellationToken,
    },
    GiveUp {
        attempts: u32,
        subscription: Option<Subscription>,
    },
}

#[derive(Default)]
struct Counters {
    events_delivered: AtomicU64,
    transport_errors: AtomicU64,
    reconnects: AtomicU64,
    timeouts: AtomicU64,
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    interceptor: Option<Arc<dyn Interceptor>>,
    subscriptions: Mutex<HashMap<StreamKey, Subscription>>,
    retry: Mutex<RetryController>,
    activity: Arc<ActivityTracker>,
    handlers: RwLock<LifecycleHandlers>,
    counters: Arc<Counters>,
    runtime: Handle,
    monitor: Mutex<Option<IdleTimeoutMonitor>>,
}

/// Subscription-style client for server-sent event streams
///
/// Cloning is cheap and every clone manages the same subscriptions. When the
/// last handle is dropped the idle monitor stops and every connection closes
/// without invoking callbacks; call [`shutdown`](Self::shutdown) for a
/// teardown that reports each closure.
#[derive(Clone)]
pub struct SseClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for SseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseClient")
            .field("config", &self.inner.config)
            .field("subscriptions", &self.subscriptions())
            .finish_non_exhaustive()
    }
}

impl SseClient {
    pub fn builder() -> SseClientBuilder {
        SseClientBuilder::new()
    }

    /// Build a client over HTTP with the given configuration
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Subscribe to `key`, or return the existing multiplexer if already subscribed
    ///
    /// Never fails: connection problems are reported through the lifecycle
    /// callbacks.
    pub fn subscribe(&self, key: impl Into<StreamKey>) -> EventMultiplexer {
        let key = key.into();
        let (multiplexer, id, source) = {
            let mut subscriptions = self.inner.lock_subscriptions();
            if let Some(existing) = subscriptions.get(&key) {
                return existing.multiplexer.clone();
            }

            let multiplexer = EventMultiplexer::new(
                key.clone(),
                self.inner.interceptor.clone(),
                Some(self.inner.activity_hook()),
                &self.inner.runtime,
            );
            let id = ConnectionId::new();
            let source = self.inner.transport.connect(&self.inner.config.url_for(key.as_str()));
            log::debug!("Subscribing to {} ({})", source.url(), id);

            subscriptions.insert(
                key.clone(),
                Subscription {
                    multiplexer: multiplexer.clone(),
                    link: Link::Connected {
                        id,
                        source: Arc::clone(&source),
                    },
                },
            );
            (multiplexer, id, source)
        };

        // The idle window starts with the connection, not with its open
        self.inner.activity.touch(&key);
        self.inner.wire(&key, id, &source, &multiplexer);
        multiplexer
    }

    /// Close the subscription for `key`; a no-op when it is not subscribed
    pub fn unsubscribe(&self, key: impl Into<StreamKey>) {
        self.inner.remove(&key.into(), CloseReason::Unsubscribed);
    }

    /// Register the error callback, replacing the previous one
    pub fn on_error<F>(&self, handler: F) -> &Self
    where
        F: Fn(&StreamKey, &TransportError) + Send + Sync + 'static,
    {
        self.inner.write_handlers().on_error = Some(Arc::new(handler));
        self
    }

    /// Register the close callback, replacing the previous one
    pub fn on_close<F>(&self, handler: F) -> &Self
    where
        F: Fn(&StreamKey, &CloseReason) + Send + Sync + 'static,
    {
        self.inner.write_handlers().on_close = Some(Arc::new(handler));
        self
    }

    /// Register the timeout callback, replacing the previous one
    pub fn on_timeout<F>(&self, handler: F) -> &Self
    where
        F: Fn(&StreamKey) + Send + Sync + 'static,
    {
        self.inner.write_handlers().on_timeout = Some(Arc::new(handler));
        self
    }

    /// Replace all three lifecycle callbacks at once
    pub fn set_lifecycle_handlers(&self, handlers: LifecycleHandlers) {
        *self.inner.write_handlers() = handlers;
    }

    pub fn is_subscribed(&self, key: impl Into<StreamKey>) -> bool {
        self.inner.lock_subscriptions().contains_key(&key.into())
    }

    /// Subscribed keys, sorted
    pub fn subscriptions(&self) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> = self.inner.lock_subscriptions().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Retry position of a subscribed key, `None` when it is not subscribed
    pub fn retry_state(&self, key: impl Into<StreamKey>) -> Option<RetryState> {
        let key = key.into();
        let reconnecting = match &self.inner.lock_subscriptions().get(&key)?.link {
            Link::Reconnecting { attempt, .. } => Some(*attempt),
            Link::Connected { .. } => None,
        };
        Some(match reconnecting {
            Some(attempt) => RetryState::Retrying { attempt },
            None => self.inner.lock_retry().state(&key),
        })
    }

    pub fn stats(&self) -> ClientStats {
        let (active_subscriptions, reconnecting) = {
            let subscriptions = self.inner.lock_subscriptions();
            let reconnecting = subscriptions
                .values()
                .filter(|s| matches!(s.link, Link::Reconnecting { .. }))
                .count();
            (subscriptions.len(), reconnecting)
        };
        let counters = &self.inner.counters;
        ClientStats {
            active_subscriptions,
            reconnecting,
            events_delivered: counters.events_delivered.load(Ordering::Relaxed),
            transport_errors: counters.transport_errors.load(Ordering::Relaxed),
            reconnects: counters.reconnects.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Stop the idle monitor and unsubscribe every key
    pub fn shutdown(&self) {
        if let Some(monitor) = self.inner.lock_monitor().take() {
            monitor.stop();
        }
        for key in self.subscriptions() {
            self.inner.remove(&key, CloseReason::Unsubscribed);
        }
        log::debug!("SSE client shut down");
    }
}

impl ClientInner {
    fn lock_subscriptions(&self) -> MutexGuard<'_, HashMap<StreamKey, Subscription>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_retry(&self) -> MutexGuard<'_, RetryController> {
        self.retry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_monitor(&self) -> MutexGuard<'_, Option<IdleTimeoutMonitor>> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_handlers(&self) -> std::sync::RwLockWriteGuard<'_, LifecycleHandlers> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers(&self) -> LifecycleHandlers {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn activity_hook(&self) -> ActivityHook {
        let activity = Arc::clone(&self.activity);
        let counters = Arc::clone(&self.counters);
        Arc::new(move |key: &StreamKey| {
            activity.touch(key);
            counters.events_delivered.fetch_add(1, Ordering::Relaxed);
        })
    }

    /// Connect the open and error conditions of `source` back to the registry
    fn wire(
        self: &Arc<Self>,
        key: &StreamKey,
        id: ConnectionId,
        source: &Arc<dyn EventSource>,
        multiplexer: &EventMultiplexer,
    ) {
        let weak = Arc::downgrade(self);
        let open_key = key.clone();
        multiplexer.bind(
            Arc::clone(source),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_open(&open_key, id);
                }
            }),
        );

        let weak = Arc::downgrade(self);
        let error_key = key.clone();
        source.set_on_error(Box::new(move |err| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let key = error_key.clone();
            let runtime = inner.runtime.clone();
            runtime.spawn(async move {
                inner.handle_transport_error(&key, id, err);
            });
        }));
    }

    fn is_current(&self, key: &StreamKey, id: ConnectionId) -> bool {
        matches!(
            self.lock_subscriptions().get(key).map(|s| &s.link),
            Some(Link::Connected { id: current, .. }) if *current == id
        )
    }

    fn handle_open(&self, key: &StreamKey, id: ConnectionId) {
        if !self.is_current(key, id) {
            return;
        }
        log::debug!("Stream {} opened ({})", key, id);
        self.lock_retry().record_open(key);
    }

    fn handle_transport_error(self: &Arc<Self>, key: &StreamKey, id: ConnectionId, err: TransportError) {
        let outcome = {
            let mut subscriptions = self.lock_subscriptions();
            let Some(subscription) = subscriptions.get_mut(key) else {
                return;
            };
            match &subscription.link {
                Link::Connected { id: current, source } if *current == id => source.close(),
                _ => {
                    log::debug!("Ignoring error from replaced connection {} of {}", id, key);
                    return;
                }
            }
            subscription.multiplexer.unbind();
            self.activity.forget(key);
            self.counters.transport_errors.fetch_add(1, Ordering::Relaxed);

            let decision = self.lock_retry().record_failure(key);
            match decision {
                RetryDecision::Reconnect { attempt, delay } => {
                    let next = ConnectionId::new();
                    let cancel = CancellationToken::new();
                    subscription.link = Link::Reconnecting {
                        next,
                        attempt,
                        cancel: cancel.clone(),
                    };
                    AfterFailure::Reconnect {
                        attempt,
                        delay,
                        next,
                        cancel,
                    }
                }
                RetryDecision::GiveUp { attempts } => AfterFailure::GiveUp {
                    attempts,
                    subscription: subscriptions.remove(key),
                },
            }
        };

        let handlers = self.handlers();
        handlers.emit_error(key, &err);

        match outcome {
            AfterFailure::GiveUp {
                attempts,
                subscription,
            } => {
                log::error!(
                    "Too many retries ({}), {} is no longer subscribed: {}",
                    attempts,
                    self.config.url_for(key.as_str()),
                    err
                );
                if let Some(subscription) = subscription {
                    subscription.close();
                }
                self.lock_retry().clear(key);
                handlers.emit_close(key, &CloseReason::RetryExhausted(err));
            }
            AfterFailure::Reconnect {
                attempt,
                delay,
                next,
                cancel,
            } => {
                log::info!(
                    "Stream {} failed ({}), reconnecting in {:?} (attempt {}/{})",
                    key,
                    err,
                    delay,
                    attempt,
                    self.config.retry.retries
                );
                self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                self.runtime.spawn(reconnect_after(
                    Arc::downgrade(self),
                    key.clone(),
                    next,
                    cancel,
                    delay,
                ));
            }
        }
    }

    /// Open connection `next` for `key` if the key still expects it
    fn reconnect(self: &Arc<Self>, key: &StreamKey, next: ConnectionId) {
        let (multiplexer, source) = {
            let mut subscriptions = self.lock_subscriptions();
            let Some(subscription) = subscriptions.get_mut(key) else {
                return;
            };
            match &subscription.link {
                Link::Reconnecting { next: expected, cancel, .. }
                    if *expected == next && !cancel.is_cancelled() => {}
                _ => return,
            }

            let source = self.transport.connect(&self.config.url_for(key.as_str()));
            log::debug!("Reconnecting {} ({})", source.url(), next);
            subscription.link = Link::Connected {
                id: next,
                source: Arc::clone(&source),
            };
            (subscription.multiplexer.clone(), source)
        };

        self.activity.touch(key);
        self.wire(key, next, &source, &multiplexer);
    }

    fn handle_idle(&self, key: StreamKey) {
        if !self.lock_subscriptions().contains_key(&key) {
            return;
        }
        log::info!(
            "Stream {} received nothing for {:?}, closing it",
            key,
            self.config.timeout
        );
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        self.handlers().emit_timeout(&key);
        self.remove(&key, CloseReason::IdleTimeout);
    }

    fn remove(&self, key: &StreamKey, reason: CloseReason) -> bool {
        let Some(subscription) = self.lock_subscriptions().remove(key) else {
            return false;
        };
        subscription.close();
        self.lock_retry().clear(key);
        self.activity.forget(key);

        log::debug!("Stream {} closed: {:?}", key, reason);
        self.handlers().emit_close(key, &reason);
        true
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(monitor) = self
            .monitor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            monitor.stop();
        }
        let subscriptions = self
            .subscriptions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, subscription) in subscriptions.drain() {
            subscription.close();
        }
    }
}

async fn reconnect_after(
    client: Weak<ClientInner>,
    key: StreamKey,
    next: ConnectionId,
    cancel: CancellationToken,
    delay: Duration,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }
    if let Some(inner) = client.upgrade() {
        inner.reconnect(&key, next);
    }
}

/// Builder for [`SseClient`]
#[derive(Default)]
pub struct SseClientBuilder {
    config: ClientConfig,
    interceptor: Option<Arc<dyn Interceptor>>,
    transport: Option<Arc<dyn Transport>>,
    handlers: LifecycleHandlers,
}

impl SseClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = base_url.into();
        self
    }

    /// Idle window; checked by [`build`](Self::build)
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Transform applied to every payload before delivery
    pub fn interceptor<I: Interceptor>(mut self, interceptor: I) -> Self {
        self.interceptor = Some(Arc::new(interceptor));
        self
    }

    pub fn shared_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Connection factory; defaults to [`HttpTransport`]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn lifecycle_handlers(mut self, handlers: LifecycleHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Build the client on the current tokio runtime
    ///
    /// # Errors
    ///
    /// Returns [`SseError::InvalidConfiguration`] for an invalid idle timeout,
    /// [`SseError::NoRuntime`] outside a tokio runtime, or [`SseError::Http`]
    /// if the default HTTP client cannot be built.
    pub fn build(self) -> Result<SseClient> {
        self.config
            .validate()
            .map_err(SseError::InvalidConfiguration)?;
        let runtime = Handle::try_current().map_err(|_| SseError::NoRuntime)?;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new()?),
        };

        let inner = Arc::new(ClientInner {
            retry: Mutex::new(RetryController::new(self.config.retry.clone())),
            config: self.config,
            transport,
            interceptor: self.interceptor,
            subscriptions: Mutex::new(HashMap::new()),
            activity: Arc::new(ActivityTracker::new()),
            handlers: RwLock::new(self.handlers),
            counters: Arc::new(Counters::default()),
            runtime,
            monitor: Mutex::new(None),
        });

        if inner.config.idle_check_enabled() {
            let weak = Arc::downgrade(&inner);
            let monitor = IdleTimeoutMonitor::spawn(
                &inner.runtime,
                Arc::clone(&inner.activity),
                inner.config.timeout,
                move |key| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_idle(key);
                    }
                },
            );
            *inner.lock_monitor() = Some(monitor);
        }

        log::debug!(
            "SSE client ready (base url {:?}, timeout {:?}, retries {})",
            inner.config.base_url,
            inner.config.timeout,
            inner.config.retry.retries
        );
        Ok(SseClient { inner })
    }
}
