//! Server-level error type (component H), wrapping connection-layer errors
//! with the accept/bind failures only the server owns.

use qwormhole_core::{ConnectionError, ErrorCode};
use thiserror::Error;

/// Errors raised by the listener, accept loop, or a connection driver.
#[derive(Error, Debug)]
pub enum ServerError {
    /// A connection-layer error (framing, handshake, backpressure).
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// `max_clients` was reached when a new socket was accepted.
    #[error("max_clients reached")]
    MaxClients,

    /// Binding the listener socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the listener attempted to bind.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Loading or generating the TLS server configuration failed.
    #[error("TLS configuration failed: {0}")]
    Tls(String),

    /// Accepting a socket off the listener failed.
    #[error("accept failed: {0}")]
    Accept(std::io::Error),
}

impl ServerError {
    /// Map this error onto the shared §6 error-code alphabet.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Connection(e) => e.code(),
            Self::MaxClients => ErrorCode::MaxClients,
            Self::Bind { .. } | Self::Tls(_) | Self::Accept(_) => ErrorCode::NotConnected,
        }
    }
}
