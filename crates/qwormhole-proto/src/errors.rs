//! Error types for the wire protocol layer.
//!
//! These are pure parsing/validation errors with no I/O of their own; callers
//! in `qwormhole-core` wrap them into connection-level errors.

use thiserror::Error;

/// Errors produced while framing, decoding, or validating protocol-level data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Inbound frame length prefix exceeded the configured maximum.
    ///
    /// The decoder that raised this is poisoned until `reset`.
    #[error("frame of {size} bytes exceeds max_frame_length {max}")]
    FrameTooLarge {
        /// Length prefix read from the wire.
        size: u32,
        /// Configured `max_frame_length`.
        max: u32,
    },

    /// Handshake payload failed structural validation.
    #[error("invalid handshake payload: {reason}")]
    InvalidHandshakePayload {
        /// Human-readable reason for the failure.
        reason: String,
    },

    /// Handshake protocol version did not match the configured version.
    #[error("handshake version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version configured on this side.
        expected: String,
        /// Version reported by the peer.
        actual: String,
    },

    /// Handshake JSON could not be parsed.
    #[error("handshake JSON decode failed: {0}")]
    Json(String),
}

/// Convenience alias for protocol-layer results.
pub type Result<T> = std::result::Result<T, ProtocolError>;
