//! Error types for the transport core.
//!
//! Strongly-typed errors for each layer the core owns: framing (component
//! A/B), handshake validation (component G), and backpressure exhaustion
//! (components B/F). Server- and client-level errors (component H/I) wrap
//! these and add their own variants (`MAX_CLIENTS`, `CONNECT_TIMEOUT`,
//! `INTERFACE_NOT_FOUND`) in their own crates.
//!
//! We avoid leaking `std::io::Error` into protocol logic; it is captured
//! here as a `String` so these types stay `Clone + PartialEq` for test
//! assertions, matching the teacher's `ConnectionError`.

use thiserror::Error;

use crate::ring::SlotRef;

/// The error-code alphabet from §6, shared across core/server/client so
/// callers can match on a stable small set regardless of which layer raised
/// the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// `max_backpressure_bytes` exceeded; connection torn down.
    Backpressure,
    /// Client `connect_timeout_ms` elapsed before the socket connected.
    ConnectTimeout,
    /// Server rejected an accept because `max_clients` was reached.
    MaxClients,
    /// An operation was attempted on a connection with no live socket.
    NotConnected,
    /// Handshake failed verification (external verifier or signature).
    InvalidHandshake,
    /// Signed-negentropic ed25519 signature or negHash check failed.
    InvalidHandshakeSignature,
    /// Handshake payload failed structural/version validation.
    InvalidHandshakePayload,
    /// `interface_name` did not resolve to a local address.
    InterfaceNotFound,
}

/// Errors raised by the ring-buffered batch framer (component B).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramerError {
    /// Inbound frame exceeded `max_frame_length`; the decoder is poisoned.
    #[error(transparent)]
    Protocol(#[from] qwormhole_proto::ProtocolError),

    /// The scatter-gather write returned an error mid-flush. Ring slots for
    /// the in-flight batch are released regardless (see [`SlotRef`]).
    #[error("write failed during flush: {0}")]
    Write(String),

    /// `flush_batch` was called with no socket attached.
    #[error("framer has no socket attached")]
    NotConnected,
}

/// Errors raised while validating and attaching a handshake (component G).
///
/// Every variant here is fatal for the connection it occurred on: the
/// socket is destroyed and no application message is ever delivered
/// upstream for that connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Payload was not valid UTF-8 JSON, or lacked `type = "handshake"`.
    #[error("invalid handshake payload: {0}")]
    InvalidPayload(#[from] qwormhole_proto::ProtocolError),

    /// The payload's `version` did not match the locally configured
    /// `protocol_version`.
    #[error("handshake version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version configured on this side.
        expected: String,
        /// Version reported by the peer.
        actual: String,
    },

    /// A `tls_fingerprint256`/`tls_fingerprint` tag did not match the
    /// observed peer certificate fingerprint.
    #[error("TLS fingerprint mismatch")]
    FingerprintMismatch,

    /// The configured [`HandshakeVerification::External`] verifier returned
    /// `false` (or its future resolved to `false`/rejected).
    ///
    /// [`HandshakeVerification::External`]: crate::handshake::HandshakeVerification::External
    #[error("handshake rejected by verifier")]
    VerifierRejected,

    /// [`HandshakeVerification::SignedNegentropic`] was configured but the
    /// payload did not carry all of `publicKey`, `signature`, and
    /// `negHash`.
    ///
    /// [`HandshakeVerification::SignedNegentropic`]: crate::handshake::HandshakeVerification::SignedNegentropic
    #[error("signed-negentropic verification requires publicKey, signature, and negHash")]
    MissingSignedFields,

    /// ed25519 signature or negHash derivation failed to verify.
    #[error("invalid handshake signature: {0}")]
    InvalidSignature(String),
}

impl HandshakeError {
    /// Map this error onto the shared §6 error-code alphabet.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidPayload(_) | Self::VersionMismatch { .. } => {
                ErrorCode::InvalidHandshakePayload
            },
            Self::FingerprintMismatch | Self::VerifierRejected | Self::MissingSignedFields => {
                ErrorCode::InvalidHandshake
            },
            Self::InvalidSignature(_) => ErrorCode::InvalidHandshakeSignature,
        }
    }
}

impl From<qwormhole_crypto::CryptoError> for HandshakeError {
    fn from(err: qwormhole_crypto::CryptoError) -> Self {
        Self::InvalidSignature(err.to_string())
    }
}

/// Top-level error for a single connection's transport machinery, uniting
/// framing, handshake, and backpressure failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// A framing error (component A/B).
    #[error(transparent)]
    Framer(#[from] FramerError),

    /// A handshake validation error (component G).
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// `socket_writable_length + projected_bytes` exceeded
    /// `max_backpressure_bytes`.
    #[error("backpressure limit exceeded: {queued_bytes} queued bytes")]
    BackpressureLimitExceeded {
        /// Bytes that would be queued had the write proceeded.
        queued_bytes: u64,
    },

    /// An operation requiring a live socket was attempted on a detached
    /// connection.
    #[error("not connected")]
    NotConnected,
}

impl ConnectionError {
    /// Map this error onto the shared §6 error-code alphabet.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Framer(FramerError::NotConnected) | Self::NotConnected => ErrorCode::NotConnected,
            Self::Framer(_) => ErrorCode::InvalidHandshakePayload,
            Self::Handshake(e) => e.code(),
            Self::BackpressureLimitExceeded { .. } => ErrorCode::Backpressure,
        }
    }

    /// Whether this error represents a condition worth local recovery
    /// (reconnect, backoff) rather than surfacing as fatal. Per §7, only
    /// backpressure exhaustion on the client side is ever transient-ish in
    /// this alphabet; everything else here is fatal for the connection.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        false
    }
}

/// A ring slot release that never occupied a real index, used to assert
/// transient buffers are tracked distinctly (§9 resolved design decision).
#[must_use]
pub fn is_transient(slot: &SlotRef) -> bool {
    matches!(slot, SlotRef::Transient(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_errors_map_to_expected_codes() {
        assert_eq!(
            HandshakeError::VersionMismatch { expected: "1".into(), actual: "2".into() }.code(),
            ErrorCode::InvalidHandshakePayload
        );
        assert_eq!(HandshakeError::FingerprintMismatch.code(), ErrorCode::InvalidHandshake);
        assert_eq!(HandshakeError::VerifierRejected.code(), ErrorCode::InvalidHandshake);
        assert_eq!(
            HandshakeError::InvalidSignature("bad sig".into()).code(),
            ErrorCode::InvalidHandshakeSignature
        );
    }

    #[test]
    fn connection_errors_are_never_transient() {
        assert!(!ConnectionError::NotConnected.is_transient());
        assert!(!ConnectionError::BackpressureLimitExceeded { queued_bytes: 10 }.is_transient());
    }

    #[test]
    fn transient_slot_detection() {
        assert!(is_transient(&SlotRef::Transient(bytes::Bytes::new())));
        assert!(!is_transient(&SlotRef::Ring(0)));
    }
}
