use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Event type assigned to frames that carry no `event:` field.
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// Connection state shared by transports and the client.
///
/// Numbering follows the `EventSource` constants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ReadyState {
    /// A connect attempt is outstanding.
    Connecting = 0,
    /// The stream is open and delivering events.
    Open = 1,
    /// No transport, or the last one has terminated.
    #[default]
    Closed = 2,
}

impl ReadyState {
    /// Encoding used by the transports' atomic state.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Unknown values map to `Closed`.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }

    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Value of the `event:` field, `message` when absent.
    pub event_type: String,
    /// Joined `data:` lines.
    pub data: String,
    /// Last event id seen on the stream at dispatch time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
    /// Origin of the stream the event arrived on.
    pub origin: String,
}

impl MessageEvent {
    /// Builds a default-typed event with no id.
    pub fn new(data: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            event_type: DEFAULT_EVENT_TYPE.to_string(),
            data: data.into(),
            last_event_id: None,
            origin: origin.into(),
        }
    }

    /// Deserializes `data` as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

/// Why a transport reported an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "status")]
pub enum EventReason {
    /// Shutdown requested through the client.
    Requested,
    /// The server ended the response body.
    Ended,
    /// The server answered with a non-success status.
    Status(u16),
    /// The response was not `text/event-stream`.
    ContentType,
    /// Network or protocol failure.
    Io,
}

/// Payload of a transport error notification.
///
/// The same value resolves a pending close and rejects a pending connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportEvent {
    pub reason: EventReason,
    /// Human-readable context, e.g. the status text or the content type seen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TransportEvent {
    /// Event without detail.
    pub fn new(reason: EventReason) -> Self {
        Self {
            reason,
            detail: None,
        }
    }

    pub fn with_detail(reason: EventReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: Some(detail.into()),
        }
    }
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            EventReason::Requested => f.write_str("closed by client")?,
            EventReason::Ended => f.write_str("stream ended by server")?,
            EventReason::Status(status) => write!(f, "unexpected http status {status}")?,
            EventReason::ContentType => f.write_str("response is not text/event-stream")?,
            EventReason::Io => f.write_str("transport failure")?,
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}
