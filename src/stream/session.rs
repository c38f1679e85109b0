//! Scoped ownership of a [`StreamClient`].
//!
//! `StreamScope` ties a client to the lifetime of whatever owns it. Entering
//! the scope runs auto-connect when the client is configured for it; leaving
//! the scope, explicitly or by drop, tears the client down exactly once.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::stream::client::StreamClient;

/// Owner of a [`StreamClient`] that disposes it when dropped.
///
/// Dereferences to the client, so `scope.connect()` and `scope.state()` work
/// directly.
#[derive(Debug)]
pub struct StreamScope {
    client: StreamClient,
    disposed: AtomicBool,
}

impl StreamScope {
    /// Activates `client` for the lifetime of the returned scope.
    ///
    /// With auto-connect enabled, one `connect()` is started. Its failure is
    /// only logged; callers that care should await `connect()` themselves.
    pub fn enter(client: StreamClient) -> Self {
        if client.auto_connect() {
            let attempt = client.connect();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(err) = attempt.await {
                        debug!(event = "stream_auto_connect_failed", error = %err);
                    }
                });
            }
        }

        Self {
            client,
            disposed: AtomicBool::new(false),
        }
    }

    /// The scoped client.
    pub fn client(&self) -> &StreamClient {
        &self.client
    }

    /// Runs teardown. Later calls, including the one from `Drop`, do nothing.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(event = "stream_scope_disposed", url = self.client.url());
        self.client.dispose();
    }

    /// Whether teardown has already run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Deref for StreamScope {
    type Target = StreamClient;

    fn deref(&self) -> &StreamClient {
        &self.client
    }
}

impl Drop for StreamScope {
    fn drop(&mut self) {
        self.dispose();
    }
}
