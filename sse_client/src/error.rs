use crate::transport::TransportError;

/// Error type for client construction and configuration
///
/// Runtime stream failures never surface here; they are delivered through the
/// lifecycle callbacks registered on [`SseClient`](crate::SseClient).
#[derive(Debug, thiserror::Error)]
pub enum SseError {
    #[error("Invalid client configuration: {0}")]
    InvalidConfiguration(String),

    #[error("No tokio runtime available; build the client from within a runtime")]
    NoRuntime,

    #[error("Subscription was closed before the stream opened")]
    SubscriptionClosed,

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to read configuration file: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SseError>;
