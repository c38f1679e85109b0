//! Incremental `text/event-stream` decoder.
//!
//! Bytes arrive in arbitrary chunks; lines may end in `\n`, `\r\n` or a bare
//! `\r`, including a `\r\n` pair split across two chunks. A frame is
//! dispatched on a blank line. Anything left unterminated when the stream ends
//! is discarded.

use std::time::Duration;

use bytes::{Buf, BytesMut};

use crate::stream::proto::{MessageEvent, DEFAULT_EVENT_TYPE};

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Stateful decoder for one response body.
///
/// Events carry `origin` and the last event id seen at dispatch time.
#[derive(Debug)]
pub struct EventStreamDecoder {
    origin: String,
    buf: BytesMut,
    data: String,
    event_type: String,
    last_event_id: Option<String>,
    retry: Option<Duration>,
    bom_checked: bool,
    pending_cr: bool,
}

impl EventStreamDecoder {
    /// Decoder for a body served from `origin`.
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            buf: BytesMut::new(),
            data: String::new(),
            event_type: String::new(),
            last_event_id: None,
            retry: None,
            bom_checked: false,
            pending_cr: false,
        }
    }

    /// Feeds a chunk and returns every event it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<MessageEvent> {
        self.buf.extend_from_slice(chunk);

        if !self.bom_checked {
            if self.buf.len() < BOM.len() && BOM.starts_with(&self.buf) {
                return Vec::new();
            }
            if self.buf.starts_with(BOM) {
                self.buf.advance(BOM.len());
            }
            self.bom_checked = true;
        }

        let mut events = Vec::new();
        loop {
            if self.pending_cr && !self.buf.is_empty() {
                if self.buf[0] == b'\n' {
                    self.buf.advance(1);
                }
                self.pending_cr = false;
            }

            let Some(line_end) = self.buf.iter().position(|b| *b == b'\n' || *b == b'\r') else {
                break;
            };

            let line = self.buf.split_to(line_end);
            let terminator = self.buf[0];
            self.buf.advance(1);
            if terminator == b'\r' {
                if self.buf.is_empty() {
                    self.pending_cr = true;
                } else if self.buf[0] == b'\n' {
                    self.buf.advance(1);
                }
            }

            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Last event id seen so far, carried across dispatches.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnection delay advertised by the server, if any.
    ///
    /// Parsed for completeness; the client never reconnects on its own.
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    fn process_line(&mut self, line: &str) -> Option<MessageEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_type = value.to_string(),
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = (!value.is_empty()).then(|| value.to_string());
                }
            }
            "retry" => {
                if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(millis) = value.parse::<u64>() {
                        self.retry = Some(Duration::from_millis(millis));
                    }
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<MessageEvent> {
        let event_type = std::mem::take(&mut self.event_type);
        if self.data.is_empty() {
            return None;
        }

        let mut data = std::mem::take(&mut self.data);
        if data.ends_with('\n') {
            data.pop();
        }

        Some(MessageEvent {
            event_type: if event_type.is_empty() {
                DEFAULT_EVENT_TYPE.to_string()
            } else {
                event_type
            },
            data,
            last_event_id: self.last_event_id.clone(),
            origin: self.origin.clone(),
        })
    }
}
