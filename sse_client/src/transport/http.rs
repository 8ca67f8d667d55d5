use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::{
    ErrorHandler, EventParser, EventSource, Listener, ListenerTable, OpenHandler, Transport,
    TransportError,
};
use crate::error::{Result, SseError};

/// [`Transport`] that opens `text/event-stream` responses over HTTP
///
/// Every connection is driven by its own tokio task on the runtime that was
/// current when the transport was created.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    runtime: Handle,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Create a transport with a default HTTP client
    ///
    /// # Errors
    ///
    /// Returns [`SseError::NoRuntime`] outside a tokio runtime, or
    /// [`SseError::Http`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        Self::with_connect_timeout(None)
    }

    /// Create a transport whose connection attempts give up after `timeout`
    pub fn with_connect_timeout(timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.connect_timeout(timeout);
        }
        Self::with_client(builder.build()?)
    }

    /// Create a transport around a caller-configured HTTP client
    ///
    /// Useful for default headers, proxies or TLS settings.
    pub fn with_client(client: reqwest::Client) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| SseError::NoRuntime)?;
        Ok(Self { client, runtime })
    }
}

impl Transport for HttpTransport {
    fn connect(&self, url: &str) -> Arc<dyn EventSource> {
        let source = Arc::new(HttpEventSource {
            url: url.to_string(),
            table: ListenerTable::new(),
            cancel: CancellationToken::new(),
        });
        self.runtime
            .spawn(drive(Arc::clone(&source), self.client.clone()));
        source
    }
}

/// One HTTP event-stream connection
pub struct HttpEventSource {
    url: String,
    table: ListenerTable,
    cancel: CancellationToken,
}

impl EventSource for HttpEventSource {
    fn url(&self) -> &str {
        &self.url
    }

    fn add_event_listener(&self, event: &str, listener: Listener) {
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
        if self.table.close() {
            log::debug!("Closing event stream {}", self.url);
        }
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.table.is_closed()
    }
}

async fn drive(source: Arc<HttpEventSource>, client: reqwest::Client) {
    let outcome = tokio::select! {
        _ = source.cancel.cancelled() => return,
        outcome = read_stream(&source, &client) => outcome,
    };

    let err = match outcome {
        Ok(()) => TransportError::Ended,
        Err(err) => err,
    };
    log::debug!("Event stream {} failed: {}", source.url, err);
    source.table.fail(err);
}

async fn read_stream(
    source: &HttpEventSource,
    client: &reqwest::Client,
) -> std::result::Result<(), TransportError> {
    let response = client
        .get(&source.url)
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !is_event_stream(content_type) {
        return Err(TransportError::ContentType(content_type.to_string()));
    }

    if !source.table.open() {
        return Ok(());
    }
    log::debug!("Event stream {} opened", source.url);

    let mut parser = EventParser::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| TransportError::Read(e.to_string()))?;
        for event in parser.feed(&chunk) {
            source.table.dispatch(event);
        }
    }
    Ok(())
}

/// Whether a `Content-Type` value announces an event stream; parameters such as `charset` are ignored
fn is_event_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|mime| mime.trim().eq_ignore_ascii_case("text/event-stream"))
        .unwrap_or(false)
}
