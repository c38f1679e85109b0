//! Client for long-lived server-sent event streams.
//!
//! A [`StreamClient`] owns at most one connection at a time. `connect()` and
//! `close()` may be called repeatedly and concurrently: overlapping calls
//! share one outcome instead of starting new work. The latest message and
//! the connection state are published for observers.
//!
//! The crate is organized as:
//! - `stream`: the controller, transports, and wire decoding.
//! - `retry`: opt-in timeout and retry helpers for explicit reconnects.

/// Timeout and retry helpers.
pub mod retry;
/// Event stream client, transports, and lifecycle scope.
pub mod stream;

pub use stream::client::{
    CloseFuture, ConnectFuture, StreamClient, StreamClientError, StreamClientOptions,
};
pub use stream::proto::{EventReason, MessageEvent, ReadyState, TransportEvent};
pub use stream::session::StreamScope;
