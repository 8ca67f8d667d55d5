//! `sse-watch`: subscribe to server-sent event streams and print every event.
//!
//! ```bash
//! sse-watch --base-url http://localhost:8080 /trigger /prices --event quote -v
//! ```
//!
//! Each delivered event is printed to stdout as `<key> <event> <payload-json>`.
//! Lifecycle notices go to stderr. The watcher exits once every stream has
//! closed, or on Ctrl-C.

use std::collections::BTreeSet;
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use serde_json::Value;
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};
use sse_client::{ClientConfig, CloseReason, SseClient, StreamKey};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(
    name = "sse-watch",
    about = "Watch server-sent event streams",
    long_about = "Subscribe to one or more event streams, reconnecting on errors, and print every delivered event"
)]
struct Args {
    /// Stream keys to subscribe to, appended to the base URL
    #[arg(required = true)]
    keys: Vec<String>,

    /// Prefix prepended to every stream key
    #[arg(long)]
    base_url: Option<String>,

    /// Close a stream after this many milliseconds without a message (0 disables)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Reconnect attempts after a stream fails (0 never reconnects)
    #[arg(long)]
    retries: Option<u32>,

    /// Delay between reconnect attempts in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// JSON configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Named event to print in addition to `message` (repeatable)
    #[arg(long = "event", value_name = "NAME")]
    events: Vec<String>,

    /// Print every delivered event through the wildcard channel
    #[arg(long)]
    all: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn client_config(&self) -> Result<ClientConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_json_file(path)?,
            None => ClientConfig::default(),
        };

        if let Some(base_url) = &self.base_url {
            config = config.with_base_url(base_url.clone());
        }
        if let Some(timeout) = self.timeout_ms {
            config = config.with_timeout(Duration::from_millis(timeout))?;
        }
        if let Some(retries) = self.retries {
            config.retry = config.retry.with_retries(retries);
        }
        if let Some(interval) = self.interval_ms {
            config.retry = config.retry.with_interval(Duration::from_millis(interval));
        }
        Ok(config)
    }

    fn unique_keys(&self) -> BTreeSet<String> {
        self.keys.iter().cloned().collect()
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let config = ConfigBuilder::new()
        .add_filter_ignore_str("reqwest")
        .build();
    if TermLogger::init(level, config, TerminalMode::Stderr, ColorChoice::Auto).is_err() {
        eprintln!("Logger already initialized");
    }
}

fn print_event(key: &str, event: &str, payload: &Value) {
    println!("{} {} {}", key, event, payload);
}

fn describe(reason: &CloseReason) -> String {
    match reason {
        CloseReason::Unsubscribed => "unsubscribed".to_string(),
        CloseReason::IdleTimeout => "closed after idle timeout".to_string(),
        CloseReason::RetryExhausted(err) => format!("gave up after repeated errors: {}", err),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(args.verbose);

    let client = SseClient::new(args.client_config()?)?;
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<StreamKey>();

    client
        .on_error(|key, err| eprintln!("{}: error: {}", key, err))
        .on_timeout(|key| eprintln!("{}: no message within the idle window", key))
        .on_close(move |key, reason| {
            eprintln!("{}: {}", key, describe(reason));
            let _ = closed_tx.send(key.clone());
        });

    let keys = args.unique_keys();
    for key in &keys {
        let stream = client.subscribe(key.as_str());
        if args.all {
            let k = key.clone();
            stream.on_any(move |event, payload| print_event(&k, event, payload));
            // Named events only reach the wildcard once something listens for them
            for event in &args.events {
                stream.on(event, |_| {});
            }
        } else {
            let k = key.clone();
            stream.on("message", move |payload| print_event(&k, "message", payload));
            for event in &args.events {
                let k = key.clone();
                let name = event.clone();
                stream.on(event, move |payload| print_event(&k, &name, payload));
            }
        }
        log::info!("Watching {}", client.config().url_for(key));
    }

    let mut remaining = keys.len();
    while remaining > 0 {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down");
                client.shutdown();
                break;
            }
            closed = closed_rx.recv() => match closed {
                Some(key) => {
                    log::debug!("{} finished", key);
                    remaining -= 1;
                }
                None => break,
            },
        }
    }

    Ok(())
}
