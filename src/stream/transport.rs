//! Transport seam between the client state machine and a concrete
//! push-stream implementation.
//!
//! A [`Connector`] builds one [`Transport`] per connect attempt and hands it a
//! [`NotificationSink`]. The transport reports `open`, `message` and `error`
//! through the sink, in the order they happen on the wire. The sink is tagged
//! with the attempt's generation so the client can drop notifications from a
//! transport it has already released.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::stream::client::StreamClientError;
use crate::stream::proto::{MessageEvent, ReadyState, TransportEvent};

/// Push notification emitted by a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// The stream is open; the transport already reports `Open`.
    Open,
    /// One dispatched event.
    Message(MessageEvent),
    /// Error-shaped notification. Terminal when the transport reports
    /// [`ReadyState::Closed`] at delivery time.
    Error(TransportEvent),
}

/// A live push-stream connection.
pub trait Transport: Send + Sync {
    /// Current state as seen by the transport itself.
    fn ready_state(&self) -> ReadyState;

    /// Begins connecting. Called once, after the client has recorded the
    /// transport and run `on_connect`.
    fn start(&self);

    /// Requests shutdown. Completion is reported through an error
    /// notification once the state is `Closed`.
    fn close(&self);

    /// Address the transport connects to.
    fn url(&self) -> &str;
}

/// Everything a connector needs to open one transport.
#[derive(Clone)]
pub struct ConnectRequest {
    /// Stream address, already validated.
    pub url: Url,
    /// Send ambient credentials (cookies) with the request.
    pub with_credentials: bool,
    /// Sent as `x-api-key` when set.
    pub api_key: Option<SecretString>,
    /// Extra request headers, in insertion order.
    pub headers: Vec<(String, String)>,
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("url", &self.url.as_str())
            .field("with_credentials", &self.with_credentials)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("headers", &self.headers)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Factory for transports.
pub trait Connector: Send + Sync {
    /// Creates a transport in the `Connecting` state.
    ///
    /// No notification may be delivered before [`Transport::start`] runs.
    fn open(
        &self,
        request: &ConnectRequest,
        sink: NotificationSink,
    ) -> Result<Arc<dyn Transport>, StreamClientError>;
}

pub(crate) trait NotificationHandler: Send + Sync {
    fn handle(&self, generation: u64, notification: Notification);
}

/// Delivery handle given to a transport.
///
/// Holds the client weakly; once the client is gone, notifications are
/// discarded and [`NotificationSink::notify`] returns `false`.
#[derive(Clone)]
pub struct NotificationSink {
    generation: u64,
    handler: Weak<dyn NotificationHandler>,
}

impl NotificationSink {
    pub(crate) fn new(generation: u64, handler: Weak<dyn NotificationHandler>) -> Self {
        Self {
            generation,
            handler,
        }
    }

    /// Generation of the connect attempt this sink belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Delivers `notification` to the client. Returns `false` once the
    /// client is gone, which tells the transport to stop.
    pub fn notify(&self, notification: Notification) -> bool {
        match self.handler.upgrade() {
            Some(handler) => {
                handler.handle(self.generation, notification);
                true
            }
            None => false,
        }
    }

    pub fn open(&self) -> bool {
        self.notify(Notification::Open)
    }

    pub fn message(&self, event: MessageEvent) -> bool {
        self.notify(Notification::Message(event))
    }

    pub fn error(&self, event: TransportEvent) -> bool {
        self.notify(Notification::Error(event))
    }
}

impl fmt::Debug for NotificationSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationSink")
            .field("generation", &self.generation)
            .field("attached", &(self.handler.strong_count() > 0))
            .finish()
    }
}

/// Cloneable reference to the transport a connect resolved with.
#[derive(Clone)]
pub struct TransportHandle {
    id: u64,
    transport: Arc<dyn Transport>,
}

impl TransportHandle {
    pub(crate) fn new(id: u64, transport: Arc<dyn Transport>) -> Self {
        Self { id, transport }
    }

    /// Generation number, unique per client.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// State as reported by the transport itself.
    pub fn ready_state(&self) -> ReadyState {
        self.transport.ready_state()
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    /// Whether both handles refer to the same connect attempt.
    pub fn same_instance(&self, other: &TransportHandle) -> bool {
        self.id == other.id
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

#[cfg(test)]
impl PartialEq for TransportHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_instance(other)
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("id", &self.id)
            .field("url", &self.transport.url())
            .field("ready_state", &self.transport.ready_state())
            .finish()
    }
}
