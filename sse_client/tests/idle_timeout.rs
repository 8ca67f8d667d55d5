use serde_json::Value;
use sse_client::transport::{ConnectBehavior, EventSource, MemoryTransport};
use sse_client::{CloseReason, SseClient, SseError, StreamKey};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_millis(300);

fn client(transport: &Arc<MemoryTransport>, timeout: Duration) -> (SseClient, Arc<Mutex<Vec<String>>>) {
    let client = SseClient::builder()
        .timeout(timeout)
        .transport(transport.clone())
        .build()
        .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    client.on_timeout(move |key| sink.lock().unwrap().push(format!("timeout {}", key)));
    let sink = Arc::clone(&log);
    client.on_close(move |key, reason| {
        let reason = match reason {
            CloseReason::Unsubscribed => "unsubscribed",
            CloseReason::IdleTimeout => "idle",
            CloseReason::RetryExhausted(_) => "exhausted",
        };
        sink.lock().unwrap().push(format!("close {} {}", key, reason));
    });
    (client, log)
}

/// Test 1: A stream that goes silent after a message is timed out, then closed
#[tokio::test]
async fn test_silent_stream_times_out_once() {
    let transport = MemoryTransport::with_behavior(ConnectBehavior::Open);
    let (client, log) = client(&transport, TIMEOUT);

    let stream = client.subscribe("/quiet");
    transport.latest("/quiet").unwrap().emit("message", "hello");

    tokio::time::sleep(TIMEOUT + Duration::from_millis(400)).await;

    assert_eq!(
        *log.lock().unwrap(),
        vec!["timeout /quiet".to_string(), "close /quiet idle".to_string()]
    );
    assert!(!client.is_subscribed("/quiet"));
    assert!(!stream.is_active());
    assert!(transport.latest("/quiet").unwrap().is_closed());
    assert_eq!(client.stats().timeouts, 1);
}

/// Test 2: Regular messages keep the stream alive
#[tokio::test]
async fn test_messages_refresh_the_idle_window() {
    let transport = MemoryTransport::with_behavior(ConnectBehavior::Open);
    let (client, log) = client(&transport, TIMEOUT);

    client.subscribe("/heartbeat");
    let source = transport.latest("/heartbeat").unwrap();
    for _ in 0..8 {
        source.emit("message", "ping");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(client.is_subscribed("/heartbeat"));
    assert!(log.lock().unwrap().is_empty());
}

/// Test 3: A stream that opens but never sends a message is still timed out
#[tokio::test]
async fn test_open_without_messages_times_out() {
    let transport = MemoryTransport::with_behavior(ConnectBehavior::Open);
    let (client, log) = client(&transport, TIMEOUT);

    let stream = client.subscribe("/mute");
    stream.wait_until_opened().await.unwrap();

    tokio::time::sleep(TIMEOUT + Duration::from_millis(400)).await;

    assert_eq!(
        *log.lock().unwrap(),
        vec!["timeout /mute".to_string(), "close /mute idle".to_string()]
    );
}

/// Test 4: A zero timeout disables the idle check
#[tokio::test]
async fn test_zero_timeout_disables_monitor() {
    let transport = MemoryTransport::with_behavior(ConnectBehavior::Open);
    let (client, log) = client(&transport, Duration::ZERO);

    client.subscribe("/forever");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(client.is_subscribed("/forever"));
    assert!(log.lock().unwrap().is_empty());
}

/// Test 5: Waiting on a stream that times out before opening fails
#[tokio::test]
async fn test_wait_fails_when_timed_out_before_open() {
    let transport = MemoryTransport::new();
    let (client, _log) = client(&transport, TIMEOUT);

    let stream = client.subscribe("/never-opens");
    let result = tokio::time::timeout(Duration::from_secs(2), stream.wait_until_opened())
        .await
        .unwrap();

    assert!(matches!(result, Err(SseError::SubscriptionClosed)));
    assert!(!client.is_subscribed("/never-opens"));
}

/// Test 6: A busy stream stays subscribed while a slow interceptor holds deliveries back
#[tokio::test]
async fn test_slow_interceptor_does_not_starve_activity() {
    let transport = MemoryTransport::with_behavior(ConnectBehavior::Open);
    let client = SseClient::builder()
        .timeout(TIMEOUT)
        .transport(transport.clone())
        .interceptor(|_key: StreamKey, _event: String, payload: Value| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Some(payload)
        })
        .build()
        .unwrap();
    let timeouts = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&timeouts);
    client.on_timeout(move |_| *sink.lock().unwrap() += 1);

    client.subscribe("/busy");
    let source = transport.latest("/busy").unwrap();
    for _ in 0..24 {
        source.emit("message", "tick");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(*timeouts.lock().unwrap(), 0);
    assert_eq!(client.stats().timeouts, 0);
    assert!(client.is_subscribed("/busy"));
}
