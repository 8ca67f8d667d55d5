//! Subscription-style client for server-sent event streams.
//!
//! Subscribe to a stream key, attach handlers per event name, and let the
//! client take care of reconnecting and closing idle streams:
//!
//! ```no_run
//! # async fn run() -> sse_client::Result<()> {
//! use sse_client::{ClientConfig, SseClient};
//!
//! let client = SseClient::new(ClientConfig::new().with_base_url("http://localhost:8080"))?;
//! client.on_close(|key, reason| eprintln!("{} closed: {:?}", key, reason));
//!
//! let stream = client.subscribe("/trigger");
//! stream.on("message", |payload| println!("{}", payload));
//! stream.wait_until_opened().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod streaming;
pub mod transport;

// Re-export key types for easier access
pub use error::{Result, SseError};
pub use streaming::{
    sync_interceptor, ClientConfig, ClientStats, CloseReason, EventMultiplexer, Interceptor,
    LifecycleHandlers, RetryConfig, RetryState, SseClient, SseClientBuilder, StreamKey,
};
pub use transport::{
    EventSource, HttpTransport, MemoryTransport, MessageEvent, Transport, TransportError,
};
