//! Client lifecycle events (§4.I), delivered to the caller over an
//! unbounded channel as the connection's state changes.

use std::time::Duration;

use bytes::Bytes;
use qwormhole_core::TrustSnapshot;

/// Events emitted by a running [`crate::Client`] as its connection state
/// changes. The caller drains these from [`crate::Client::events`]; nothing
/// about the client's internal loop depends on a caller reading them
/// promptly, since the channel is unbounded.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The TCP (or TLS) socket connected and any configured handshake was
    /// sent.
    Connect,
    /// The handshake round-trip completed (or no protocol version was
    /// configured, skipping it); the connection is ready for application
    /// traffic.
    Ready,
    /// An application message arrived from the peer.
    Message(Bytes),
    /// A reconnect attempt is about to fire after `delay`.
    Reconnecting {
        /// 1-indexed attempt counter, reset on every successful connect.
        attempt: u32,
        /// Backoff delay before this attempt.
        delay: Duration,
    },
    /// A flush hit partial-write backpressure.
    Backpressure,
    /// The socket drained after backpressure.
    Drain,
    /// The connection closed. `had_error` follows the §4.I close
    /// classification: true if a socket error occurred, the handshake was
    /// still pending, or the caller signaled an error; false for a clean
    /// user-initiated `disconnect`.
    Close {
        /// Close classification.
        had_error: bool,
        /// Trust-snapshot diagnostics for the closed connection.
        snapshot: TrustSnapshot,
    },
    /// Reconnect attempts were exhausted (`reconnect.max_attempts` reached)
    /// or reconnect is disabled and the connection failed. Terminal: no
    /// further events follow on this client.
    Error(String),
}
