pub mod types;
pub mod config;
pub mod interface;
pub mod multiplexer;
pub mod retry;
pub mod idle;
pub mod client;

// Re-export key types for easier access
pub use types::{
    decode_payload, is_falsy, sync_interceptor, CloseReason, ConnectionId, Interceptor, StreamKey,
};
pub use config::{ClientConfig, RetryConfig, IDLE_CHECK_INTERVAL};
pub use interface::{ClientStats, LifecycleHandlers};
pub use multiplexer::{EventMultiplexer, MessageHandler, WildcardHandler, WILDCARD};
pub use retry::{RetryController, RetryDecision, RetryState};
pub use idle::{ActivityTracker, IdleTimeoutMonitor};
pub use client::{SseClient, SseClientBuilder};
