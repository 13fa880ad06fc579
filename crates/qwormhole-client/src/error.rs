//! Client-level error type (component I), wrapping connection-layer errors
//! with the connect/interface failures only the client owns.

use qwormhole_core::{ConnectionError, ErrorCode};
use thiserror::Error;

/// Errors raised while connecting or driving a client connection.
#[derive(Error, Debug)]
pub enum ClientError {
    /// A connection-layer error (framing, handshake, backpressure).
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// `connect_timeout_ms` elapsed before the socket connected.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// `interface_name` did not resolve to a local address.
    #[error("network interface {0:?} not found")]
    InterfaceNotFound(String),

    /// The underlying TCP connect attempt failed.
    #[error("tcp connect failed: {0}")]
    Connect(std::io::Error),

    /// Loading or negotiating the TLS client configuration failed.
    #[error("TLS configuration failed: {0}")]
    Tls(String),
}

impl ClientError {
    /// Map this error onto the shared §6 error-code alphabet.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Connection(e) => e.code(),
            Self::ConnectTimeout(_) => ErrorCode::ConnectTimeout,
            Self::InterfaceNotFound(_) => ErrorCode::InterfaceNotFound,
            Self::Connect(_) | Self::Tls(_) => ErrorCode::NotConnected,
        }
    }
}
