//! QWormhole client: TCP (optionally TLS) connect, reconnect with backoff,
//! heartbeat, and the same length-prefixed framing/flow-control machinery
//! the listener drives, run from the connecting side (component I).
//!
//! [`Client::spawn`] owns the connection lifecycle as a background task;
//! callers push outbound payloads with [`Client::send`] and drain lifecycle
//! events with [`Client::next_event`].

pub mod client;
pub mod error;
pub mod event;
pub mod tls;

pub use client::{Client, ClientConfig, ClientTlsConfig, ReconnectConfig};
pub use error::ClientError;
pub use event::ClientEvent;
pub use tls::ClientStream;
