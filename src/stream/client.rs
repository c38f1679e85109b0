//! Event stream client with coalescing connect and close.
//!
//! The client owns at most one transport at a time. Concurrent `connect()`
//! calls share one pending future, as do concurrent `close()` calls. All
//! transport notifications go through a single handler that ignores anything
//! coming from a transport the client has already released.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use url::Url;

use crate::retry::{retry_async, with_timeout, RetryPolicy};
use crate::stream::proto::{EventReason, MessageEvent, ReadyState, TransportEvent};
use crate::stream::transport::{
    ConnectRequest, Connector, Notification, NotificationHandler, NotificationSink,
    TransportHandle,
};

/// Shared outcome of a connect attempt.
pub type ConnectFuture = Shared<BoxFuture<'static, Result<TransportHandle, StreamClientError>>>;

/// Shared outcome of a close request.
pub type CloseFuture = Shared<BoxFuture<'static, Result<TransportEvent, StreamClientError>>>;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Default values used by [`StreamClientOptions::default`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    /// Connect when the owning [`StreamScope`](crate::StreamScope) is entered.
    pub const AUTO_CONNECT: bool = true;
    /// TCP/TLS connect timeout of the built-in HTTP transport.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

#[derive(Clone, Default)]
struct Callbacks {
    on_open: Option<Callback<TransportHandle>>,
    on_close: Option<Callback<TransportEvent>>,
    on_message: Option<Callback<MessageEvent>>,
    on_connect: Option<Callback<TransportHandle>>,
}

/// Construction-time configuration. Nothing here can change afterwards.
#[derive(Clone)]
pub struct StreamClientOptions {
    /// Connect once when the owning scope activates.
    pub auto_connect: bool,
    /// Send cookies with the stream request.
    pub with_credentials: bool,
    /// Sent as `x-api-key` when set.
    pub api_key: Option<SecretString>,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
    /// TCP/TLS connect timeout for the built-in HTTP transport.
    pub connect_timeout: Duration,
    callbacks: Callbacks,
}

impl Default for StreamClientOptions {
    fn default() -> Self {
        Self {
            auto_connect: StreamDefaults::AUTO_CONNECT,
            with_credentials: false,
            api_key: None,
            headers: Vec::new(),
            connect_timeout: StreamDefaults::CONNECT_TIMEOUT,
            callbacks: Callbacks::default(),
        }
    }
}

impl StreamClientOptions {
    /// Sets whether entering a scope connects automatically.
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Sends and stores cookies for the stream request.
    pub fn with_credentials(mut self, with_credentials: bool) -> Self {
        self.with_credentials = with_credentials;
        self
    }

    /// Sets the API key sent as `x-api-key`.
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Adds a request header. Repeated names are sent repeatedly.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Overrides [`StreamDefaults::CONNECT_TIMEOUT`].
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Called when the transport reports open, before the connect future
    /// resolves.
    pub fn on_open<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TransportHandle) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(callback));
        self
    }

    /// Called on every terminal notification, caller-initiated or not.
    pub fn on_close<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(callback));
        self
    }

    /// Called for every dispatched event, named events included.
    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MessageEvent) + Send + Sync + 'static,
    {
        self.callbacks.on_message = Some(Arc::new(callback));
        self
    }

    /// Called synchronously with each newly created transport.
    pub fn on_connect<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TransportHandle) + Send + Sync + 'static,
    {
        self.callbacks.on_connect = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for StreamClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClientOptions")
            .field("auto_connect", &self.auto_connect)
            .field("with_credentials", &self.with_credentials)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("headers", &self.headers)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// Errors produced by the stream client.
///
/// Cloneable so that one outcome can be handed to every coalesced caller.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamClientError {
    /// `close()` was called without an open transport.
    #[error("event stream is not connected")]
    NotConnected,

    /// No push-stream transport exists in this build or runtime.
    #[error("event stream transport unavailable: {0}")]
    UnsupportedEnvironment(String),

    /// The stream address did not parse as a URL.
    #[error("invalid stream url: {0}")]
    InvalidUrl(String),

    /// Terminal notification received while connecting.
    #[error("transport error: {0}")]
    Transport(TransportEvent),

    /// The connector refused to create a transport.
    #[error("failed to open transport: {0}")]
    Connect(String),

    /// [`StreamClient::connect_timeout`] elapsed before the stream opened.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// The client was torn down while this operation was pending.
    #[error("event stream client was disposed")]
    Disposed,
}

impl StreamClientError {
    /// Whether an explicit new connect attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(event) => match event.reason {
                EventReason::Ended | EventReason::Io => true,
                EventReason::Status(status) => status == 429 || status >= 500,
                EventReason::ContentType | EventReason::Requested => false,
            },
            Self::Timeout(_) => true,
            _ => false,
        }
    }
}

struct PendingConnect {
    generation: u64,
    resolver: oneshot::Sender<Result<TransportHandle, StreamClientError>>,
    future: ConnectFuture,
}

struct PendingClose {
    generation: u64,
    resolver: oneshot::Sender<Result<TransportEvent, StreamClientError>>,
    future: CloseFuture,
}

#[derive(Default)]
struct Slots {
    next_generation: u64,
    /// Generation whose notifications are still honoured.
    current: Option<u64>,
    transport: Option<TransportHandle>,
    connect: Option<PendingConnect>,
    close: Option<PendingClose>,
}

impl Slots {
    fn take_connect(&mut self, generation: u64) -> Option<PendingConnect> {
        if self.connect.as_ref()?.generation == generation {
            self.connect.take()
        } else {
            None
        }
    }

    fn take_close(&mut self, generation: u64) -> Option<PendingClose> {
        if self.close.as_ref()?.generation == generation {
            self.close.take()
        } else {
            None
        }
    }

    fn open_transport(&self) -> Option<&TransportHandle> {
        self.transport
            .as_ref()
            .filter(|handle| handle.ready_state().is_open())
    }
}

struct ClientCore {
    request: ConnectRequest,
    connector: Arc<dyn Connector>,
    callbacks: Callbacks,
    auto_connect: bool,
    slots: Mutex<Slots>,
    state_tx: watch::Sender<ReadyState>,
    message_tx: watch::Sender<Option<MessageEvent>>,
}

impl ClientCore {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_state(&self, state: ReadyState) {
        self.state_tx.send_replace(state);
    }

    fn handle_open(&self, generation: u64) {
        let (handle, pending) = {
            let mut slots = self.lock();
            if slots.current != Some(generation) {
                debug!(event = "stream_stale_notification", generation, kind = "open");
                return;
            }
            let Some(handle) = slots.transport.clone() else {
                return;
            };
            let pending = slots.take_connect(generation);
            self.publish_state(ReadyState::Open);
            (handle, pending)
        };

        info!(event = "stream_open", generation, url = handle.url());
        if let Some(callback) = &self.callbacks.on_open {
            callback(&handle);
        }
        if let Some(pending) = pending {
            let _ = pending.resolver.send(Ok(handle));
        }
    }

    fn handle_message(&self, generation: u64, message: MessageEvent) {
        {
            let slots = self.lock();
            if slots.current != Some(generation) {
                debug!(event = "stream_stale_notification", generation, kind = "message");
                return;
            }
            self.message_tx.send_replace(Some(message.clone()));
        }

        if let Some(callback) = &self.callbacks.on_message {
            callback(&message);
        }
    }

    fn handle_error(&self, generation: u64, event: TransportEvent) {
        let (close, connect) = {
            let mut slots = self.lock();
            if slots.current != Some(generation) {
                debug!(event = "stream_stale_notification", generation, kind = "error");
                return;
            }
            let Some(handle) = slots.transport.as_ref() else {
                return;
            };
            let state = handle.ready_state();
            if !state.is_closed() {
                warn!(event = "stream_transient_error", generation, %state, error = %event);
                return;
            }

            slots.current = None;
            slots.transport = None;
            self.publish_state(ReadyState::Closed);
            (slots.take_close(generation), slots.take_connect(generation))
        };

        info!(event = "stream_closed", generation, reason = %event);
        if let Some(close) = close {
            let _ = close.resolver.send(Ok(event.clone()));
        }
        if let Some(callback) = &self.callbacks.on_close {
            callback(&event);
        }
        if let Some(connect) = connect {
            let _ = connect.resolver.send(Err(StreamClientError::Transport(event)));
        }
    }

    /// Ends the cycle of a transport that already reports `Closed` but whose
    /// terminal notification has not been handled yet. The cycle finishes as
    /// a requested close: state `Closed`, pending close resolved, `on_close`
    /// run. The late notification is then dropped as stale.
    fn release_superseded(&self, mut slots: MutexGuard<'_, Slots>) {
        let Some(old) = slots.transport.take() else {
            return;
        };
        let generation = old.id();
        slots.current = None;
        self.publish_state(ReadyState::Closed);
        let close = slots.close.take();
        drop(slots);

        let event = TransportEvent::new(EventReason::Requested);
        debug!(event = "stream_transport_superseded", generation);
        old.transport().close();
        if let Some(close) = close {
            let _ = close.resolver.send(Ok(event.clone()));
        }
        if let Some(callback) = &self.callbacks.on_close {
            callback(&event);
        }
    }
}

impl NotificationHandler for ClientCore {
    fn handle(&self, generation: u64, notification: Notification) {
        match notification {
            Notification::Open => self.handle_open(generation),
            Notification::Message(message) => self.handle_message(generation, message),
            Notification::Error(event) => self.handle_error(generation, event),
        }
    }
}

/// Controller for one long-lived event stream.
///
/// Cloning is cheap; clones drive the same connection.
#[derive(Clone)]
pub struct StreamClient {
    core: Arc<ClientCore>,
}

impl StreamClient {
    /// Creates a client backed by the built-in HTTP transport.
    ///
    /// Fails with [`StreamClientError::UnsupportedEnvironment`] when the crate
    /// was built without the `http` feature.
    pub fn new(
        url: impl AsRef<str>,
        options: StreamClientOptions,
    ) -> Result<Self, StreamClientError> {
        let connector = default_connector(&options)?;
        Self::with_connector(url, options, connector)
    }

    /// Creates a client that opens transports through `connector`.
    pub fn with_connector(
        url: impl AsRef<str>,
        options: StreamClientOptions,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, StreamClientError> {
        let url = Url::parse(url.as_ref().trim())
            .map_err(|err| StreamClientError::InvalidUrl(err.to_string()))?;

        let (state_tx, _) = watch::channel(ReadyState::Closed);
        let (message_tx, _) = watch::channel(None);

        let request = ConnectRequest {
            url,
            with_credentials: options.with_credentials,
            api_key: options.api_key,
            headers: options.headers,
            connect_timeout: options.connect_timeout,
        };

        Ok(Self {
            core: Arc::new(ClientCore {
                request,
                connector,
                callbacks: options.callbacks,
                auto_connect: options.auto_connect,
                slots: Mutex::new(Slots::default()),
                state_tx,
                message_tx,
            }),
        })
    }

    /// Normalized stream address.
    pub fn url(&self) -> &str {
        self.core.request.url.as_str()
    }

    /// Whether a [`StreamScope`](crate::StreamScope) connects on entry.
    pub fn auto_connect(&self) -> bool {
        self.core.auto_connect
    }

    /// Opens the stream, or joins the attempt already in flight.
    ///
    /// Resolves immediately when a transport is already open. Never opens two
    /// transports at once.
    pub fn connect(&self) -> ConnectFuture {
        let core = &self.core;
        let mut slots = loop {
            let slots = core.lock();
            if let Some(handle) = slots.open_transport() {
                return settled(Ok(handle.clone()));
            }
            if let Some(pending) = &slots.connect {
                return pending.future.clone();
            }
            if slots.transport.is_none() {
                break slots;
            }
            core.release_superseded(slots);
        };

        slots.next_generation += 1;
        let generation = slots.next_generation;
        let (resolver, receiver) = oneshot::channel();
        let future = pending(receiver);
        slots.current = Some(generation);
        slots.connect = Some(PendingConnect {
            generation,
            resolver,
            future: future.clone(),
        });
        core.publish_state(ReadyState::Connecting);

        let handler: Arc<dyn NotificationHandler> = core.clone();
        let sink = NotificationSink::new(generation, Arc::downgrade(&handler));
        let opened = core.connector.open(&core.request, sink);

        let handle = match opened {
            Ok(transport) => {
                let handle = TransportHandle::new(generation, transport);
                slots.transport = Some(handle.clone());
                Some(handle)
            }
            Err(err) => {
                warn!(event = "stream_connect_failed", generation, error = %err);
                slots.current = None;
                core.publish_state(ReadyState::Closed);
                if let Some(pending) = slots.take_connect(generation) {
                    let _ = pending.resolver.send(Err(err));
                }
                None
            }
        };
        drop(slots);

        if let Some(handle) = handle {
            debug!(event = "stream_connecting", generation, url = handle.url());
            if let Some(callback) = &core.callbacks.on_connect {
                callback(&handle);
            }
            if core.lock().current == Some(generation) {
                handle.transport().start();
            }
        }

        future
    }

    /// Requests shutdown of the open transport, or joins the request already
    /// in flight.
    ///
    /// Fails with [`StreamClientError::NotConnected`] when nothing is open,
    /// including while a connect is still pending: a pending connect cannot
    /// be aborted through `close()`.
    pub fn close(&self) -> CloseFuture {
        let (handle, future) = {
            let mut slots = self.core.lock();
            if let Some(pending) = &slots.close {
                return pending.future.clone();
            }
            let Some(handle) = slots.open_transport().cloned() else {
                return settled(Err(StreamClientError::NotConnected));
            };

            let (resolver, receiver) = oneshot::channel();
            let future = pending(receiver);
            slots.close = Some(PendingClose {
                generation: handle.id(),
                resolver,
                future: future.clone(),
            });
            (handle, future)
        };

        debug!(event = "stream_close_requested", generation = handle.id());
        handle.transport().close();
        future
    }

    /// `connect()` bounded by `timeout`.
    ///
    /// On timeout the underlying attempt stays pending; later `connect()`
    /// calls still join it.
    pub async fn connect_timeout(
        &self,
        timeout: Duration,
    ) -> Result<TransportHandle, StreamClientError> {
        with_timeout(timeout, self.connect())
            .await
            .unwrap_or(Err(StreamClientError::Timeout(timeout)))
    }

    /// Repeats `connect()` per `policy` while the failure is retryable.
    ///
    /// Only runs when called; the client never reconnects by itself.
    pub async fn connect_with_retry(
        &self,
        policy: &RetryPolicy,
    ) -> Result<TransportHandle, StreamClientError> {
        retry_async(policy, |_| self.connect(), StreamClientError::is_retryable).await
    }

    /// Tears the client down. Safe to call any number of times.
    ///
    /// An open transport is closed normally. A transport that is still
    /// connecting is released without further callbacks and its pending
    /// connect settles with [`StreamClientError::Disposed`].
    pub fn dispose(&self) {
        let released = {
            let mut slots = self.core.lock();
            let closing = slots.close.is_some() || slots.open_transport().is_some();
            if !closing && (slots.transport.is_some() || slots.connect.is_some()) {
                slots.current = None;
                self.core.publish_state(ReadyState::Closed);
                Some((slots.transport.take(), slots.connect.take()))
            } else {
                None
            }
        };

        if let Some((transport, connect)) = released {
            debug!(event = "stream_disposed_while_connecting");
            if let Some(handle) = transport {
                handle.transport().close();
            }
            if let Some(connect) = connect {
                let _ = connect.resolver.send(Err(StreamClientError::Disposed));
            }
        }

        let _ = self.close();
    }

    /// Current connection state.
    pub fn state(&self) -> ReadyState {
        *self.core.state_tx.borrow()
    }

    /// Receiver that observes every published state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ReadyState> {
        self.core.state_tx.subscribe()
    }

    /// Most recent message, kept across closes.
    pub fn last_message(&self) -> Option<MessageEvent> {
        self.core.message_tx.borrow().clone()
    }

    /// Payload of the most recent message.
    pub fn last_data(&self) -> Option<String> {
        self.core
            .message_tx
            .borrow()
            .as_ref()
            .map(|message| message.data.clone())
    }

    /// Payload of the most recent message decoded as JSON.
    pub fn last_message_json<T: DeserializeOwned>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        self.core
            .message_tx
            .borrow()
            .as_ref()
            .map(MessageEvent::json)
            .transpose()
    }

    /// Receiver that observes the latest message; intermediate values may be
    /// skipped by a slow reader.
    pub fn subscribe_messages(&self) -> watch::Receiver<Option<MessageEvent>> {
        self.core.message_tx.subscribe()
    }
}

impl fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClient")
            .field("url", &self.url())
            .field("state", &self.state())
            .field("auto_connect", &self.core.auto_connect)
            .finish_non_exhaustive()
    }
}

fn settled<T>(
    value: Result<T, StreamClientError>,
) -> Shared<BoxFuture<'static, Result<T, StreamClientError>>>
where
    T: Clone + Send + 'static,
{
    future::ready(value).boxed().shared()
}

fn pending<T>(
    receiver: oneshot::Receiver<Result<T, StreamClientError>>,
) -> Shared<BoxFuture<'static, Result<T, StreamClientError>>>
where
    T: Clone + Send + 'static,
{
    async move { receiver.await.unwrap_or(Err(StreamClientError::Disposed)) }
        .boxed()
        .shared()
}

#[cfg(feature = "http")]
fn default_connector(
    options: &StreamClientOptions,
) -> Result<Arc<dyn Connector>, StreamClientError> {
    let connector = crate::stream::http::HttpConnector::new(options.connect_timeout)?;
    Ok(Arc::new(connector))
}

#[cfg(not(feature = "http"))]
fn default_connector(
    _options: &StreamClientOptions,
) -> Result<Arc<dyn Connector>, StreamClientError> {
    Err(StreamClientError::UnsupportedEnvironment(
        "built without the `http` feature and no connector was supplied".to_string(),
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use futures_util::FutureExt;
    use serde::Deserialize;

    use super::{StreamClient, StreamClientError, StreamClientOptions};
    use crate::stream::proto::{EventReason, MessageEvent, ReadyState, TransportEvent};
    use crate::stream::transport::{ConnectRequest, Connector, NotificationSink, Transport};

    pub(crate) const TEST_URL: &str = "http://127.0.0.1:9/events";

    /// Transport whose notifications are fired by the test.
    pub(crate) struct ScriptedTransport {
        url: String,
        state: AtomicU8,
        sink: NotificationSink,
        pub(crate) close_requests: AtomicUsize,
        pub(crate) started: AtomicBool,
    }

    impl ScriptedTransport {
        pub(crate) fn emit_open(&self) {
            self.state.store(ReadyState::Open.as_u8(), Ordering::SeqCst);
            self.sink.open();
        }

        pub(crate) fn emit_message(&self, data: &str) {
            self.sink.message(MessageEvent::new(data, TEST_URL));
        }

        pub(crate) fn emit_closed(&self, reason: EventReason) {
            self.state.store(ReadyState::Closed.as_u8(), Ordering::SeqCst);
            self.sink.error(TransportEvent::new(reason));
        }

        pub(crate) fn emit_transient_error(&self) {
            self.sink.error(TransportEvent::new(EventReason::Io));
        }

        /// Flips to `Closed` without delivering the terminal notification.
        pub(crate) fn mark_closed(&self) {
            self.state.store(ReadyState::Closed.as_u8(), Ordering::SeqCst);
        }
    }

    impl Transport for ScriptedTransport {
        fn ready_state(&self) -> ReadyState {
            ReadyState::from_u8(self.state.load(Ordering::SeqCst))
        }

        fn close(&self) {
            self.close_requests.fetch_add(1, Ordering::SeqCst);
        }

        fn start(&self) {
            self.started.store(true, Ordering::SeqCst);
        }

        fn url(&self) -> &str {
            &self.url
        }
    }

    #[derive(Default)]
    pub(crate) struct ScriptedConnector {
        opened: Mutex<Vec<Arc<ScriptedTransport>>>,
        refuse: AtomicBool,
    }

    impl ScriptedConnector {
        pub(crate) fn opened(&self) -> usize {
            self.opened.lock().expect("opened lock").len()
        }

        pub(crate) fn last(&self) -> Arc<ScriptedTransport> {
            self.opened
                .lock()
                .expect("opened lock")
                .last()
                .cloned()
                .expect("a transport was opened")
        }
    }

    impl Connector for ScriptedConnector {
        fn open(
            &self,
            request: &ConnectRequest,
            sink: NotificationSink,
        ) -> Result<Arc<dyn Transport>, StreamClientError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(StreamClientError::Connect("refused".to_string()));
            }
            let transport = Arc::new(ScriptedTransport {
                url: request.url.to_string(),
                state: AtomicU8::new(ReadyState::Connecting.as_u8()),
                sink,
                close_requests: AtomicUsize::new(0),
                started: AtomicBool::new(false),
            });
            self.opened
                .lock()
                .expect("opened lock")
                .push(Arc::clone(&transport));
            Ok(transport)
        }
    }

    pub(crate) fn scripted_client(
        options: StreamClientOptions,
    ) -> (StreamClient, Arc<ScriptedConnector>) {
        let connector = Arc::new(ScriptedConnector::default());
        let client = StreamClient::with_connector(TEST_URL, options, connector.clone())
            .expect("valid test url");
        (client, connector)
    }

    fn manual() -> StreamClientOptions {
        StreamClientOptions::default().with_auto_connect(false)
    }

    #[test]
    fn coalesces_connect_calls_into_one_transport() {
        let (client, connector) = scripted_client(manual());

        let first = client.connect();
        let second = client.connect();
        assert_eq!(connector.opened(), 1);
        assert_eq!(client.state(), ReadyState::Connecting);
        assert!(first.clone().now_or_never().is_none());
        assert!(connector.last().started.load(Ordering::SeqCst));

        connector.last().emit_open();

        let a = first.now_or_never().expect("settled").expect("connected");
        let b = second.now_or_never().expect("settled").expect("connected");
        assert!(a.same_instance(&b));
        assert_eq!(client.state(), ReadyState::Open);

        let again = client
            .connect()
            .now_or_never()
            .expect("already open resolves immediately")
            .expect("connected");
        assert!(again.same_instance(&a));
        assert_eq!(connector.opened(), 1);
    }

    #[test]
    fn coalesces_close_calls_into_one_shutdown() {
        let (client, connector) = scripted_client(manual());
        let connecting = client.connect();
        connector.last().emit_open();
        connecting.now_or_never().expect("settled").expect("connected");

        let first = client.close();
        let second = client.close();
        let transport = connector.last();
        assert_eq!(transport.close_requests.load(Ordering::SeqCst), 1);
        assert!(first.clone().now_or_never().is_none());

        transport.emit_closed(EventReason::Requested);

        let a = first.now_or_never().expect("settled").expect("closed");
        let b = second.now_or_never().expect("settled").expect("closed");
        assert_eq!(a, b);
        assert_eq!(a.reason, EventReason::Requested);
        assert_eq!(client.state(), ReadyState::Closed);

        let _ = client.connect();
        assert_eq!(connector.opened(), 2);
    }

    #[test]
    fn coalesced_connect_failure_settles_identically() {
        let (client, connector) = scripted_client(manual());

        let first = client.connect();
        let second = client.connect();
        assert_eq!(connector.opened(), 1);
        connector.last().emit_closed(EventReason::Status(502));

        let a = first.now_or_never().expect("settled");
        let b = second.now_or_never().expect("settled");
        assert_eq!(
            a,
            Err(StreamClientError::Transport(TransportEvent::new(
                EventReason::Status(502)
            )))
        );
        assert_eq!(a, b);
        assert_eq!(connector.opened(), 1);
        assert_eq!(client.state(), ReadyState::Closed);
    }

    #[test]
    fn close_before_connect_is_not_connected() {
        let (client, connector) = scripted_client(manual());

        let result = client.close().now_or_never().expect("rejected immediately");
        assert_eq!(result, Err(StreamClientError::NotConnected));
        assert_eq!(client.state(), ReadyState::Closed);
        assert_eq!(connector.opened(), 0);
    }

    #[test]
    fn close_while_connecting_does_not_abort_connect() {
        let (client, connector) = scripted_client(manual());
        let connecting = client.connect();

        let result = client.close().now_or_never().expect("rejected immediately");
        assert_eq!(result, Err(StreamClientError::NotConnected));
        assert_eq!(connector.last().close_requests.load(Ordering::SeqCst), 0);

        connector.last().emit_open();
        assert!(connecting.now_or_never().expect("settled").is_ok());
    }

    #[test]
    fn message_survives_close() {
        let (client, connector) = scripted_client(manual());
        let _ = client.connect();
        let transport = connector.last();
        transport.emit_open();
        transport.emit_message("hello");
        assert_eq!(client.last_data().as_deref(), Some("hello"));
        assert_eq!(client.state(), ReadyState::Open);

        let closing = client.close();
        transport.emit_closed(EventReason::Requested);
        closing.now_or_never().expect("settled").expect("closed");
        assert_eq!(client.last_data().as_deref(), Some("hello"));
    }

    #[test]
    fn messages_overwrite_in_delivery_order() {
        let (client, connector) = scripted_client(manual());
        let mut messages = client.subscribe_messages();
        let _ = client.connect();
        let transport = connector.last();
        transport.emit_open();
        transport.emit_message("one");
        transport.emit_message("two");
        assert_eq!(client.last_data().as_deref(), Some("two"));
        assert!(messages.has_changed().expect("sender alive"));
        assert_eq!(
            messages.borrow_and_update().as_ref().map(|m| m.data.clone()),
            Some("two".to_string())
        );
    }

    #[test]
    fn terminal_error_while_connecting_rejects_connect() {
        let closes = Arc::new(AtomicUsize::new(0));
        let (client, connector) = scripted_client(manual().on_close({
            let closes = Arc::clone(&closes);
            move |_| {
                closes.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let connecting = client.connect();
        connector.last().emit_closed(EventReason::Status(503));

        let err = connecting
            .now_or_never()
            .expect("settled")
            .expect_err("connect should fail");
        assert_eq!(
            err,
            StreamClientError::Transport(TransportEvent::new(EventReason::Status(503)))
        );
        assert!(err.is_retryable());
        assert_eq!(client.state(), ReadyState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let _ = client.connect();
        assert_eq!(connector.opened(), 2);
    }

    #[test]
    fn transient_error_keeps_state() {
        let (client, connector) = scripted_client(manual());
        let connecting = client.connect();
        let transport = connector.last();

        transport.emit_transient_error();
        assert_eq!(client.state(), ReadyState::Connecting);
        assert!(connecting.clone().now_or_never().is_none());

        transport.emit_open();
        transport.emit_transient_error();
        assert_eq!(client.state(), ReadyState::Open);
        assert!(connecting.now_or_never().expect("settled").is_ok());
    }

    #[test]
    fn unsolicited_close_releases_transport() {
        let (client, connector) = scripted_client(manual());
        let _ = client.connect();
        let transport = connector.last();
        transport.emit_open();
        transport.emit_closed(EventReason::Ended);

        assert_eq!(client.state(), ReadyState::Closed);
        assert_eq!(
            client.close().now_or_never().expect("settled"),
            Err(StreamClientError::NotConnected)
        );
    }

    #[test]
    fn ignores_notifications_from_released_transport() {
        let opens = Arc::new(AtomicUsize::new(0));
        let (client, connector) = scripted_client(manual().on_open({
            let opens = Arc::clone(&opens);
            move |_| {
                opens.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let _ = client.connect();
        let old = connector.last();
        old.emit_open();
        old.emit_message("kept");
        old.emit_closed(EventReason::Ended);

        let connecting = client.connect();
        old.emit_open();
        old.emit_message("late");
        old.emit_closed(EventReason::Ended);

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(client.last_data().as_deref(), Some("kept"));
        assert_eq!(client.state(), ReadyState::Connecting);
        assert!(connecting.now_or_never().is_none());
    }

    #[test]
    fn callbacks_fire_in_lifecycle_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let record = |label: &'static str| {
            let log = Arc::clone(&log);
            move || log.lock().expect("log lock").push(label.to_string())
        };
        let on_connect = record("connect");
        let on_open = record("open");
        let on_close = record("close");
        let message_log = Arc::clone(&log);

        let (client, connector) = scripted_client(
            manual()
                .on_connect(move |_| on_connect())
                .on_open(move |_| on_open())
                .on_message(move |message| {
                    message_log
                        .lock()
                        .expect("log lock")
                        .push(format!("message:{}", message.data))
                })
                .on_close(move |_| on_close()),
        );

        let _ = client.connect();
        let transport = connector.last();
        transport.emit_open();
        transport.emit_message("a");
        let _ = client.close();
        transport.emit_closed(EventReason::Requested);

        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["connect", "open", "message:a", "close"]
        );
    }

    #[test]
    fn callbacks_may_reenter_the_client() {
        let slot: Arc<Mutex<Option<StreamClient>>> = Arc::new(Mutex::new(None));
        let (client, connector) = scripted_client(manual().on_close({
            let slot = Arc::clone(&slot);
            move |_| {
                if let Some(client) = slot.lock().expect("slot lock").as_ref() {
                    let _ = client.connect();
                }
            }
        }));
        *slot.lock().expect("slot lock") = Some(client.clone());

        let _ = client.connect();
        connector.last().emit_open();
        connector.last().emit_closed(EventReason::Ended);

        assert_eq!(connector.opened(), 2);
        assert_eq!(client.state(), ReadyState::Connecting);
        slot.lock().expect("slot lock").take();
    }

    #[test]
    fn reconnect_before_close_notification_finishes_old_cycle() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let slot: Arc<Mutex<Option<StreamClient>>> = Arc::new(Mutex::new(None));
        let (client, connector) = scripted_client(
            manual()
                .on_connect({
                    let log = Arc::clone(&log);
                    move |_| log.lock().expect("log lock").push("connect".to_string())
                })
                .on_close({
                    let log = Arc::clone(&log);
                    let slot = Arc::clone(&slot);
                    move |event| {
                        let state = slot
                            .lock()
                            .expect("slot lock")
                            .as_ref()
                            .map(StreamClient::state);
                        log.lock()
                            .expect("log lock")
                            .push(format!("close:{:?}:{:?}", event.reason, state));
                    }
                }),
        );
        *slot.lock().expect("slot lock") = Some(client.clone());

        let _ = client.connect();
        let old = connector.last();
        old.emit_open();
        let closing = client.close();
        old.mark_closed();

        let reconnecting = client.connect();
        assert_eq!(connector.opened(), 2);
        assert_eq!(
            closing.now_or_never().expect("settled"),
            Ok(TransportEvent::new(EventReason::Requested))
        );
        assert_eq!(client.state(), ReadyState::Connecting);

        old.emit_closed(EventReason::Ended);
        assert_eq!(client.state(), ReadyState::Connecting);
        assert!(reconnecting.now_or_never().is_none());
        assert_eq!(
            *log.lock().expect("log lock"),
            vec![
                "connect".to_string(),
                format!("close:{:?}:{:?}", EventReason::Requested, Some(ReadyState::Closed)),
                "connect".to_string(),
            ]
        );
        slot.lock().expect("slot lock").take();
    }

    #[test]
    fn refused_connect_settles_and_allows_retry() {
        let (client, connector) = scripted_client(manual());
        connector.refuse.store(true, Ordering::SeqCst);

        let err = client
            .connect()
            .now_or_never()
            .expect("settled")
            .expect_err("refused");
        assert_eq!(err, StreamClientError::Connect("refused".to_string()));
        assert_eq!(client.state(), ReadyState::Closed);

        connector.refuse.store(false, Ordering::SeqCst);
        let _ = client.connect();
        assert_eq!(connector.opened(), 1);
    }

    #[test]
    fn dispose_while_connecting_releases_silently() {
        let opens = Arc::new(AtomicUsize::new(0));
        let (client, connector) = scripted_client(manual().on_open({
            let opens = Arc::clone(&opens);
            move |_| {
                opens.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let connecting = client.connect();
        client.dispose();
        client.dispose();

        assert_eq!(
            connecting.now_or_never().expect("settled"),
            Err(StreamClientError::Disposed)
        );
        let transport = connector.last();
        assert_eq!(transport.close_requests.load(Ordering::SeqCst), 1);
        transport.emit_open();
        assert_eq!(opens.load(Ordering::SeqCst), 0);
        assert_eq!(client.state(), ReadyState::Closed);
    }

    #[test]
    fn dispose_without_transport_is_a_no_op() {
        let (client, connector) = scripted_client(manual());
        client.dispose();
        assert_eq!(connector.opened(), 0);
        assert_eq!(client.state(), ReadyState::Closed);
    }

    #[test]
    fn typed_last_message() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Price {
            cents: u64,
        }

        let (client, connector) = scripted_client(manual());
        assert_eq!(client.last_message_json::<Price>().expect("no message"), None);

        let _ = client.connect();
        connector.last().emit_open();
        connector.last().emit_message(r#"{"cents":1250}"#);
        assert_eq!(
            client.last_message_json::<Price>().expect("valid json"),
            Some(Price { cents: 1250 })
        );
    }

    #[test]
    fn rejects_invalid_url() {
        let connector = Arc::new(ScriptedConnector::default());
        let err = StreamClient::with_connector("not a url", manual(), connector)
            .expect_err("invalid url");
        assert!(matches!(err, StreamClientError::InvalidUrl(_)));
    }

    #[cfg(feature = "http")]
    #[test]
    fn connect_without_runtime_is_unsupported() {
        let client = StreamClient::new(TEST_URL, manual()).expect("client should build");
        let states = client.subscribe_state();

        let err = client
            .connect()
            .now_or_never()
            .expect("settled immediately")
            .expect_err("no runtime");
        assert!(matches!(err, StreamClientError::UnsupportedEnvironment(_)));
        assert!(!err.is_retryable());
        assert_eq!(*states.borrow(), ReadyState::Closed);
        assert_eq!(
            client.close().now_or_never().expect("settled"),
            Err(StreamClientError::NotConnected)
        );
    }

    #[tokio::test]
    async fn connect_with_retry_stops_on_refusal() {
        let (client, connector) = scripted_client(manual());
        connector.refuse.store(true, Ordering::SeqCst);

        let err = client
            .connect_with_retry(&crate::retry::RetryPolicy::for_connect())
            .await
            .expect_err("refused");
        assert!(!err.is_retryable());
        assert_eq!(connector.opened(), 0);
    }

    #[tokio::test]
    async fn connect_timeout_leaves_attempt_pending() {
        let (client, connector) = scripted_client(manual());
        let err = client
            .connect_timeout(std::time::Duration::from_millis(10))
            .await
            .expect_err("never opens");
        assert!(matches!(err, StreamClientError::Timeout(_)));

        let joined = client.connect();
        assert_eq!(connector.opened(), 1);
        connector.last().emit_open();
        assert!(joined.await.is_ok());
    }
}
