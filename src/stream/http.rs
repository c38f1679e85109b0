//! HTTP transport over a streaming `reqwest` response.
//!
//! One GET per transport. The transport opens on a `200` with a
//! `text/event-stream` body; any other response, a read error, or the end of
//! the body is terminal. There is no reconnect: the client decides whether to
//! connect again.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::debug;

use crate::stream::client::StreamClientError;
use crate::stream::decoder::EventStreamDecoder;
use crate::stream::proto::{EventReason, ReadyState, TransportEvent};
use crate::stream::transport::{ConnectRequest, Connector, NotificationSink, Transport};

pub const EVENT_STREAM_MIME: &str = "text/event-stream";
const API_KEY_HEADER: &str = "x-api-key";

/// Connector that opens event streams with `reqwest`.
///
/// Credentialed requests share one cookie jar for the connector's lifetime.
#[derive(Clone, Debug)]
pub struct HttpConnector {
    plain: Client,
    credentialed: Client,
}

impl HttpConnector {
    /// Fails with [`StreamClientError::UnsupportedEnvironment`] when the HTTP
    /// stack cannot be initialised.
    pub fn new(connect_timeout: Duration) -> Result<Self, StreamClientError> {
        Ok(Self {
            plain: build_client(connect_timeout, false)?,
            credentialed: build_client(connect_timeout, true)?,
        })
    }
}

fn build_client(connect_timeout: Duration, cookies: bool) -> Result<Client, StreamClientError> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .cookie_store(cookies)
        .build()
        .map_err(|err| StreamClientError::UnsupportedEnvironment(err.to_string()))
}

impl Connector for HttpConnector {
    fn open(
        &self,
        request: &ConnectRequest,
        sink: NotificationSink,
    ) -> Result<Arc<dyn Transport>, StreamClientError> {
        let runtime = Handle::try_current()
            .map_err(|err| StreamClientError::UnsupportedEnvironment(err.to_string()))?;
        let headers = request_headers(request)?;
        let client = if request.with_credentials {
            self.credentialed.clone()
        } else {
            self.plain.clone()
        };

        Ok(Arc::new(HttpTransport {
            url: request.url.to_string(),
            state: Arc::new(AtomicU8::new(ReadyState::Connecting.as_u8())),
            shutdown: Arc::new(Notify::new()),
            launch: Mutex::new(Some(Launch {
                client,
                headers,
                sink,
                runtime,
            })),
        }))
    }
}

pub(crate) fn request_headers(request: &ConnectRequest) -> Result<HeaderMap, StreamClientError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(EVENT_STREAM_MIME));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    if let Some(api_key) = &request.api_key {
        let mut value = HeaderValue::from_str(api_key.expose_secret())
            .map_err(|err| StreamClientError::Connect(format!("invalid api-key header: {err}")))?;
        value.set_sensitive(true);
        headers.insert(API_KEY_HEADER, value);
    }

    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
            StreamClientError::Connect(format!("invalid header name {name}: {err}"))
        })?;
        let value = HeaderValue::from_str(value).map_err(|err| {
            StreamClientError::Connect(format!("invalid value for {name}: {err}"))
        })?;
        headers.append(name, value);
    }

    Ok(headers)
}

struct Launch {
    client: Client,
    headers: HeaderMap,
    sink: NotificationSink,
    runtime: Handle,
}

struct HttpTransport {
    url: String,
    state: Arc<AtomicU8>,
    shutdown: Arc<Notify>,
    launch: Mutex<Option<Launch>>,
}

impl HttpTransport {
    fn take_launch(&self) -> Option<Launch> {
        self.launch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Transport for HttpTransport {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn start(&self) {
        let Some(launch) = self.take_launch() else {
            return;
        };
        if self.ready_state().is_closed() {
            return;
        }

        let url = self.url.clone();
        let state = Arc::clone(&self.state);
        let shutdown = Arc::clone(&self.shutdown);
        launch.runtime.spawn(async move {
            let reader = read_stream(&launch.client, &url, launch.headers, &state, &launch.sink);
            let event = tokio::select! {
                _ = shutdown.notified() => TransportEvent::new(EventReason::Requested),
                event = reader => event,
            };
            state.store(ReadyState::Closed.as_u8(), Ordering::SeqCst);
            debug!(event = "http_transport_closed", url = %url, reason = %event);
            launch.sink.error(event);
        });
    }

    fn close(&self) {
        if self.take_launch().is_some() {
            // Never started: nothing to stop and nobody listening.
            self.state.store(ReadyState::Closed.as_u8(), Ordering::SeqCst);
            return;
        }
        self.shutdown.notify_one();
    }

    fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        // The reader task owns no reference back to the transport; stop it
        // so the connection does not outlive every handle.
        self.shutdown.notify_one();
    }
}

async fn read_stream(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    state: &AtomicU8,
    sink: &NotificationSink,
) -> TransportEvent {
    let response = match client.get(url).headers(headers).send().await {
        Ok(response) => response,
        Err(err) => return TransportEvent::with_detail(EventReason::Io, err.to_string()),
    };

    let status = response.status();
    if status != StatusCode::OK {
        let reason = status.canonical_reason().unwrap_or("unknown status");
        return TransportEvent::with_detail(EventReason::Status(status.as_u16()), reason);
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !is_event_stream(&content_type) {
        return TransportEvent::with_detail(EventReason::ContentType, content_type);
    }

    let origin = response.url().origin().ascii_serialization();
    state.store(ReadyState::Open.as_u8(), Ordering::SeqCst);
    if !sink.open() {
        return TransportEvent::new(EventReason::Requested);
    }

    let mut decoder = EventStreamDecoder::new(origin);
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => return TransportEvent::with_detail(EventReason::Io, err.to_string()),
        };
        for message in decoder.push(&chunk) {
            if !sink.message(message) {
                return TransportEvent::new(EventReason::Requested);
            }
        }
    }

    TransportEvent::new(EventReason::Ended)
}

fn is_event_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(EVENT_STREAM_MIME))
}
