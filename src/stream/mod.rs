//! Event stream modules.
//!
//! - `client`: connect/close controller with shared outcomes.
//! - `transport`: seam between the controller and a concrete transport.
//! - `http`: built-in `reqwest` transport (feature `http`).
//! - `decoder`: incremental `text/event-stream` framing.
//! - `proto`: states and events shared by all of the above.
//! - `session`: scoped lifecycle around a client.

/// Stream controller, options, and errors.
pub mod client;
/// Event-stream wire decoder.
pub mod decoder;
/// HTTP transport.
#[cfg(feature = "http")]
pub mod http;
/// Ready states and event payloads.
pub mod proto;
/// Scope guard that auto-connects and tears down.
pub mod session;
/// Transport and connector traits.
pub mod transport;
