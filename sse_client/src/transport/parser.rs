//! Incremental parser for the `text/event-stream` wire format.
//!
//! Follows the event stream interpretation rules of the
//! [HTML Living Standard](https://html.spec.whatwg.org/multipage/server-sent-events.html):
//! LF, CR and CRLF line endings, `:` comments, `event`/`data`/`id`/`retry`
//! fields, and dispatch on a blank line.

use std::time::Duration;

use bytes::{Buf, BytesMut};

use super::{MessageEvent, DEFAULT_EVENT};

const LF: u8 = b'\n';
const CR: u8 = b'\r';
const BOM: &[u8] = "\u{FEFF}".as_bytes();

/// Converts arbitrary byte chunks into [`MessageEvent`]s
#[derive(Debug, Default)]
pub struct EventParser {
    buffer: BytesMut,
    started: bool,
    event: String,
    data: Option<String>,
    last_event_id: String,
    retry: Option<Duration>,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconnection delay most recently advertised by the server
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    /// Last event id seen on the stream
    pub fn last_event_id(&self) -> &str {
        &self.last_event_id
    }

    /// Feed a chunk and collect every event it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<MessageEvent> {
        self.buffer.extend_from_slice(chunk);

        if !self.started {
            if self.buffer.len() < BOM.len() && BOM.starts_with(&self.buffer) {
                return Vec::new();
            }
            if self.buffer.starts_with(BOM) {
                self.buffer.advance(BOM.len());
            }
            self.started = true;
        }

        let mut events = Vec::new();
        while let Some((line_end, rem_start)) = find_eol(&self.buffer) {
            let line = self.buffer.split_to(line_end).freeze();
            self.buffer.advance(rem_start - line_end);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &[u8]) -> Option<MessageEvent> {
        if line.is_empty() {
            return self.dispatch();
        }

        let (name, value) = match line.iter().position(|b| *b == b':') {
            Some(0) => return None,
            Some(pos) => {
                let value = &line[pos + 1..];
                let value = value.strip_prefix(b" ").unwrap_or(value);
                (&line[..pos], value)
            }
            None => (line, &[][..]),
        };
        let value = String::from_utf8_lossy(value);

        match name {
            b"event" => self.event = value.into_owned(),
            b"data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(&value);
                }
                None => self.data = Some(value.into_owned()),
            },
            b"id" => {
                if !value.contains('\0') {
                    self.last_event_id = value.into_owned();
                }
            }
            b"retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<MessageEvent> {
        let event = std::mem::take(&mut self.event);
        let data = self.data.take()?;

        Some(MessageEvent {
            event: if event.is_empty() {
                DEFAULT_EVENT.to_string()
            } else {
                event
            },
            data,
            last_event_id: self.last_event_id.clone(),
        })
    }
}

/// Returns `(line_end, remainder_start)`, or `None` if more data is needed.
///
/// A buffer ending in a lone CR waits for the next chunk, since it may be the
/// first half of a CRLF pair.
fn find_eol(bytes: &[u8]) -> Option<(usize, usize)> {
    let pos = bytes.iter().position(|b| *b == LF || *b == CR)?;
    if bytes[pos] == LF {
        return Some((pos, pos + 1));
    }
    match bytes.get(pos + 1) {
        None => None,
        Some(&LF) => Some((pos, pos + 2)),
        Some(_) => Some((pos, pos + 1)),
    }
}
