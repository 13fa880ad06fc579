//! Handshake JSON payload (§6 normative wire fields).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    errors::{ProtocolError, Result},
    policy::{CoherenceLevel, EntropyVelocity},
};

/// Required discriminator value for a handshake payload.
pub const HANDSHAKE_TYPE: &str = "handshake";

/// A tag value in the handshake's `tags` map: either a string or a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    /// String-valued tag.
    Text(String),
    /// Numeric-valued tag.
    Number(f64),
}

/// The optional `entropyMetrics` sub-object on the wire. All fields are
/// optional because a peer may supply only `nIndex` and let the receiver
/// derive the rest (see [`crate::policy::EntropyMetrics::from_neg_index`]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct WireEntropyMetrics {
    /// Raw entropy estimate, if the peer precomputed it.
    pub entropy: Option<f64>,
    /// Entropy-velocity label, if the peer precomputed it.
    #[serde(rename = "entropyVelocity")]
    pub entropy_velocity: Option<EntropyVelocity>,
    /// Coherence label, if the peer precomputed it.
    pub coherence: Option<CoherenceLevel>,
    /// Negentropic index, if the peer precomputed it.
    #[serde(rename = "negIndex")]
    pub neg_index: Option<f64>,
}

/// The handshake JSON payload exchanged as the first frame on each
/// direction when a protocol version is configured.
///
/// Unknown top-level fields are preserved in `extra` and never inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Discriminator; must equal [`HANDSHAKE_TYPE`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Protocol version string, checked against the local configuration.
    pub version: Option<String>,
    /// Free-form string/number tags, e.g. TLS fingerprints.
    pub tags: Option<HashMap<String, TagValue>>,
    /// Negentropic index in (effectively) `[0, 1]` after clamping.
    #[serde(rename = "nIndex")]
    pub n_index: Option<f64>,
    /// Hex-encoded negHash, present on signed-negentropic handshakes.
    #[serde(rename = "negHash")]
    pub neg_hash: Option<String>,
    /// Precomputed entropy metrics, if the peer supplied them.
    #[serde(rename = "entropyMetrics")]
    pub entropy_metrics: Option<WireEntropyMetrics>,
    /// Base64-encoded ed25519 public key, present on signed handshakes.
    #[serde(rename = "publicKey")]
    pub public_key: Option<String>,
    /// Base64-encoded ed25519 signature, present on signed handshakes.
    pub signature: Option<String>,
    /// Sender-local timestamp, milliseconds since epoch.
    pub ts: Option<i64>,
    /// Base64-encoded nonce.
    pub nonce: Option<String>,
    /// Unknown fields, preserved verbatim and never interpreted.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HandshakePayload {
    /// Construct a minimal handshake payload with only `type` and `version`
    /// set, as the client does when initiating a connection.
    #[must_use]
    pub fn new(version: Option<String>) -> Self {
        Self {
            kind: HANDSHAKE_TYPE.to_string(),
            version,
            tags: None,
            n_index: None,
            neg_hash: None,
            entropy_metrics: None,
            public_key: None,
            signature: None,
            ts: None,
            nonce: None,
            extra: Map::new(),
        }
    }

    /// Validate the structural shape required of any handshake payload
    /// (discriminator present and correct).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidHandshakePayload`] if `type` is not
    /// `"handshake"`.
    pub fn validate_shape(&self) -> Result<()> {
        if self.kind != HANDSHAKE_TYPE {
            return Err(ProtocolError::InvalidHandshakePayload {
                reason: format!("expected type \"{HANDSHAKE_TYPE}\", got {:?}", self.kind),
            });
        }
        Ok(())
    }

    /// Check the handshake's `version` against the locally configured
    /// protocol version, if both sides set one.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::VersionMismatch`] when both are set and
    /// differ. A missing version on either side is not a mismatch.
    pub fn check_version(&self, expected: Option<&str>) -> Result<()> {
        if let (Some(expected), Some(actual)) = (expected, self.version.as_deref()) {
            if expected != actual {
                return Err(ProtocolError::VersionMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether this payload carries every field required for signed
    /// negentropic verification (`publicKey` + `signature` + `negHash`).
    #[must_use]
    pub fn has_signed_negentropic_fields(&self) -> bool {
        self.public_key.is_some() && self.signature.is_some() && self.neg_hash.is_some()
    }

    /// Serialize the canonicalized unsigned form of this payload: identical
    /// to the wire JSON except `signature` is cleared, since the signature
    /// is computed over everything else it attests to. This is the exact
    /// byte string a signed-negentropic handshake's ed25519 signature
    /// covers, on both the signing and verifying side.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Json`] if serialization fails.
    pub fn canonical_unsigned_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        unsigned.to_json_bytes()
    }

    /// Serialize to the canonical JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Json`] if serialization fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Json(e.to_string()))
    }

    /// Parse a handshake payload from raw JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidHandshakePayload`] if the bytes are
    /// not valid UTF-8 JSON or do not match the expected shape, or
    /// [`ProtocolError::Json`] on lower-level decode failure.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        let payload: Self = serde_json::from_slice(bytes).map_err(|e| {
            ProtocolError::InvalidHandshakePayload { reason: format!("malformed JSON: {e}") }
        })?;
        payload.validate_shape()?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_minimal_payload() {
        let payload = HandshakePayload::new(Some("1.0.0".to_string()));
        let bytes = payload.to_json_bytes().unwrap();
        let parsed = HandshakePayload::from_json_bytes(&bytes).unwrap();
        assert_eq!(payload, parsed);
    }

    #[test]
    fn rejects_wrong_discriminator() {
        let bytes = br#"{"type":"not-a-handshake"}"#;
        let err = HandshakePayload::from_json_bytes(bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidHandshakePayload { .. }));
    }

    #[test]
    fn unknown_fields_pass_through() {
        let bytes = br#"{"type":"handshake","unknownField":42}"#;
        let parsed = HandshakePayload::from_json_bytes(bytes).unwrap();
        assert_eq!(parsed.extra.get("unknownField").and_then(Value::as_i64), Some(42));
    }

    #[test]
    fn version_mismatch_detected_only_when_both_present() {
        let payload = HandshakePayload::new(Some("2.0.0".to_string()));
        assert!(payload.check_version(Some("1.0.0")).is_err());
        assert!(payload.check_version(None).is_ok());

        let unversioned = HandshakePayload::new(None);
        assert!(unversioned.check_version(Some("1.0.0")).is_ok());
    }

    #[test]
    fn signed_negentropic_fields_detected() {
        let mut payload = HandshakePayload::new(None);
        assert!(!payload.has_signed_negentropic_fields());
        payload.public_key = Some("abc".to_string());
        payload.signature = Some("def".to_string());
        payload.neg_hash = Some("00".to_string());
        assert!(payload.has_signed_negentropic_fields());
    }

    #[test]
    fn canonical_unsigned_bytes_omits_signature_but_keeps_other_signed_fields() {
        let mut payload = HandshakePayload::new(Some("1.0.0".to_string()));
        payload.public_key = Some("abc".to_string());
        payload.signature = Some("def".to_string());
        payload.neg_hash = Some("00".to_string());
        payload.n_index = Some(0.9);

        let canonical = payload.canonical_unsigned_bytes().unwrap();
        let value: Value = serde_json::from_slice(&canonical).unwrap();
        assert!(value.get("signature").is_none());
        assert_eq!(value.get("publicKey").and_then(Value::as_str), Some("abc"));
        assert_eq!(value.get("negHash").and_then(Value::as_str), Some("00"));
        assert_eq!(value.get("nIndex").and_then(Value::as_f64), Some(0.9));
    }

    #[test]
    fn canonical_unsigned_bytes_is_stable_regardless_of_the_signature_value() {
        let mut a = HandshakePayload::new(None);
        a.public_key = Some("abc".to_string());
        a.neg_hash = Some("00".to_string());
        a.signature = Some("one-signature".to_string());

        let mut b = a.clone();
        b.signature = Some("a-completely-different-signature".to_string());

        assert_eq!(a.canonical_unsigned_bytes().unwrap(), b.canonical_unsigned_bytes().unwrap());
    }
}
