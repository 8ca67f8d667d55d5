use std::borrow::Borrow;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use uuid::Uuid;

use crate::transport::TransportError;

/// Identifies one logical event stream (typically a URL or URL path)
///
/// The client prepends its base URL to the key when opening a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey(Arc<str>);

impl StreamKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for StreamKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

impl From<&String> for StreamKey {
    fn from(key: &String) -> Self {
        Self::new(key)
    }
}

impl From<&StreamKey> for StreamKey {
    fn from(key: &StreamKey) -> Self {
        key.clone()
    }
}

impl Borrow<str> for StreamKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Unique identifier for one physical connection
///
/// A fresh id is allocated for every connection attempt, so callbacks from a
/// replaced connection can be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decode a raw payload as JSON, keeping the raw text when it is not JSON
pub fn decode_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Whether an interceptor result suppresses delivery
///
/// `null`, `false`, the empty string and numeric zero are falsy.
pub fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::Array(_) | Value::Object(_) => false,
    }
}

/// Transform applied to every decoded payload before fan-out
///
/// Returning `None` (or a falsy value, see [`is_falsy`]) drops the message;
/// any other value replaces the payload. Implemented for async closures taking
/// `(StreamKey, String, Value)`.
pub trait Interceptor: Send + Sync + 'static {
    fn intercept(&self, key: &StreamKey, event: &str, payload: Value) -> BoxFuture<'static, Option<Value>>;
}

impl<F, Fut> Interceptor for F
where
    F: Fn(StreamKey, String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Value>> + Send + 'static,
{
    fn intercept(&self, key: &StreamKey, event: &str, payload: Value) -> BoxFuture<'static, Option<Value>> {
        self(key.clone(), event.to_string(), payload).boxed()
    }
}

struct SyncInterceptor<F>(F);

impl<F> Interceptor for SyncInterceptor<F>
where
    F: Fn(&StreamKey, &str, Value) -> Option<Value> + Send + Sync + 'static,
{
    fn intercept(&self, key: &StreamKey, event: &str, payload: Value) -> BoxFuture<'static, Option<Value>> {
        futures_util::future::ready((self.0)(key, event, payload)).boxed()
    }
}

/// Wrap a synchronous transform as an [`Interceptor`]
pub fn sync_interceptor<F>(f: F) -> Arc<dyn Interceptor>
where
    F: Fn(&StreamKey, &str, Value) -> Option<Value> + Send + Sync + 'static,
{
    Arc::new(SyncInterceptor(f))
}

/// Why a subscription was torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The caller unsubscribed
    Unsubscribed,
    /// No message arrived within the idle window
    IdleTimeout,
    /// The stream kept failing and the retry budget is spent
    RetryExhausted(TransportError),
}

impl CloseReason {
    /// The error that triggered the closure, if any
    pub fn error(&self) -> Option<&TransportError> {
        match self {
            CloseReason::RetryExhausted(err) => Some(err),
            CloseReason::Unsubscribed | CloseReason::IdleTimeout => None,
        }
    }
}
