//! Handshake state machine and verification policy (component G).
//!
//! The first inbound frame on a handshake-pending connection is parsed as a
//! JSON [`HandshakePayload`][qwormhole_proto::HandshakePayload] and validated
//! per the caller's [`HandshakeVerification`] policy. There is no implicit
//! "looks signed" fallback: a caller that wants signed-negentropic
//! verification declares it explicitly.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use qwormhole_proto::{
    CoherenceLevel, EntropyMetrics, EntropyPolicy, EntropyVelocity, HandshakePayload, ProtocolError, TagValue,
    WireEntropyMetrics, clamp_unit, derive_policy,
};

use crate::{env::Environment, error::HandshakeError};

/// A boxed future returned by an [`HandshakeVerification::External`] verifier.
pub type VerifierFuture = std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>>;

/// A verifier callback: given the parsed payload, resolves to whether the
/// handshake should be accepted.
pub type VerifierFn = Arc<dyn Fn(&HandshakePayload) -> VerifierFuture + Send + Sync>;

/// How a connection validates an inbound handshake payload, chosen
/// explicitly by the caller at construction time (resolves Open Question 1;
/// see `DESIGN.md`).
#[derive(Clone)]
pub enum HandshakeVerification {
    /// No verification beyond structural/version/fingerprint checks; any
    /// payload shape passes. The explicit way to opt out of verification.
    None,
    /// Invoke the supplied verifier with the parsed payload. `false` (or the
    /// future resolving to `false`) rejects the handshake. Signed-negentropic
    /// fields, if present, are not independently checked in this mode.
    External(VerifierFn),
    /// Require `publicKey`, `signature`, and `negHash` and verify them with
    /// ed25519 + the deterministic negHash derivation. Missing fields are
    /// rejected as an invalid payload, never silently accepted.
    SignedNegentropic,
}

impl fmt::Debug for HandshakeVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "HandshakeVerification::None"),
            Self::External(_) => write!(f, "HandshakeVerification::External(..)"),
            Self::SignedNegentropic => write!(f, "HandshakeVerification::SignedNegentropic"),
        }
    }
}

/// Per-connection handshake configuration.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Locally configured protocol version, checked against the peer's
    /// `version` field when both sides set one.
    pub protocol_version: Option<String>,
    /// Verification policy for inbound payloads.
    pub verification: HandshakeVerification,
    /// The peer certificate's observed fingerprint, when running atop TLS.
    /// Checked against a `tls_fingerprint256`/`tls_fingerprint` tag if the
    /// payload supplies one.
    pub observed_tls_fingerprint: Option<String>,
}

/// What a successful handshake resolves to: entropy metrics, derived policy,
/// and whatever metadata the caller wants recorded on the connection.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    /// Fully-resolved entropy metrics.
    pub metrics: EntropyMetrics,
    /// Derived trust/framing policy.
    pub policy: EntropyPolicy,
    /// `policy.framing == ZeroCopyWritev`.
    pub peer_is_native: bool,
    /// Peer's reported protocol version, if any.
    pub version: Option<String>,
    /// Peer's free-form tags.
    pub tags: HashMap<String, TagValue>,
    /// Peer's reported negHash, if signed-negentropic fields were present.
    pub neg_hash: Option<String>,
}

/// Validate and attach an inbound handshake payload.
///
/// On rejection (fingerprint mismatch, verifier rejection, missing signed
/// fields, or signature failure), records `remote_key` in `ledger` before
/// returning the error.
///
/// # Errors
///
/// See [`HandshakeError`] variants.
pub async fn process_handshake<E: Environment>(
    raw: &[u8],
    config: &HandshakeConfig,
    remote_key: &str,
    ledger: &mut FailedHandshakeLedger<E>,
    env: &E,
) -> Result<HandshakeOutcome, HandshakeError> {
    let payload = HandshakePayload::from_json_bytes(raw)?;
    payload.check_version(config.protocol_version.as_deref()).map_err(|e| match e {
        ProtocolError::VersionMismatch { expected, actual } => HandshakeError::VersionMismatch { expected, actual },
        other => HandshakeError::InvalidPayload(other),
    })?;

    if let (Some(expected_fp), Some(tags)) = (&config.observed_tls_fingerprint, &payload.tags) {
        let claimed = tags.get("tls_fingerprint256").or_else(|| tags.get("tls_fingerprint"));
        if let Some(TagValue::Text(claimed_fp)) = claimed
            && claimed_fp != expected_fp
        {
            ledger.record(remote_key, env);
            return Err(HandshakeError::FingerprintMismatch);
        }
    }

    match &config.verification {
        HandshakeVerification::None => {},
        HandshakeVerification::External(verifier) => {
            if !(verifier)(&payload).await {
                ledger.record(remote_key, env);
                return Err(HandshakeError::VerifierRejected);
            }
        },
        HandshakeVerification::SignedNegentropic => {
            if let Err(e) = verify_signed_negentropic(&payload) {
                ledger.record(remote_key, env);
                return Err(e);
            }
        },
    }

    let neg_index = clamp_unit(payload.n_index.unwrap_or(0.0));
    let metrics = payload
        .entropy_metrics
        .as_ref()
        .map_or_else(|| EntropyMetrics::from_neg_index(neg_index), |wire| resolve_metrics(neg_index, wire));
    let policy = derive_policy(metrics.neg_index);

    Ok(HandshakeOutcome {
        metrics,
        policy,
        peer_is_native: policy.is_native(),
        version: payload.version.clone(),
        tags: payload.tags.clone().unwrap_or_default(),
        neg_hash: payload.neg_hash.clone(),
    })
}

fn resolve_metrics(neg_index: f64, wire: &WireEntropyMetrics) -> EntropyMetrics {
    let n = clamp_unit(wire.neg_index.unwrap_or(neg_index));
    EntropyMetrics {
        entropy: wire.entropy.unwrap_or(8.0 * (1.0 - n)),
        entropy_velocity: wire.entropy_velocity.unwrap_or(EntropyVelocity::Stable),
        coherence: wire.coherence.unwrap_or_else(|| CoherenceLevel::from_neg_index(n)),
        neg_index: n,
    }
}

/// Two independent checks, per the wire format's signed-negentropic
/// contract: `negHash` binds the public key to the claimed `nIndex`, and
/// the ed25519 signature covers the canonicalized unsigned payload (the
/// whole handshake with `signature` itself cleared) — not the `negHash`
/// digest — so a forged `nIndex` can't be papered over by reusing a
/// signature taken from a different handshake that happened to hash the
/// same.
fn verify_signed_negentropic(payload: &HandshakePayload) -> Result<(), HandshakeError> {
    if !payload.has_signed_negentropic_fields() {
        return Err(HandshakeError::MissingSignedFields);
    }
    let n_index = payload.n_index.ok_or(HandshakeError::MissingSignedFields)?;

    let public_key = BASE64
        .decode(payload.public_key.as_deref().unwrap_or_default())
        .map_err(|e| HandshakeError::InvalidSignature(e.to_string()))?;
    let signature = BASE64
        .decode(payload.signature.as_deref().unwrap_or_default())
        .map_err(|e| HandshakeError::InvalidSignature(e.to_string()))?;
    let neg_hash = qwormhole_crypto::decode_hex(payload.neg_hash.as_deref().unwrap_or_default())?;
    let canonical = payload
        .canonical_unsigned_bytes()
        .map_err(|e| HandshakeError::InvalidSignature(e.to_string()))?;

    qwormhole_crypto::verify_neg_hash(&public_key, n_index, &neg_hash)?;
    qwormhole_crypto::verify_signature(&public_key, &signature, &canonical)?;
    Ok(())
}

/// Tracks remote keys with a recent failed handshake, evicted by TTL and
/// bounded by a capacity ceiling (component H).
#[derive(Debug)]
pub struct FailedHandshakeLedger<E: Environment> {
    entries: HashMap<String, E::Instant>,
    ttl: Duration,
    cap: usize,
}

impl<E: Environment> FailedHandshakeLedger<E> {
    /// Construct a ledger that forgets entries older than `ttl` and never
    /// holds more than `cap` entries at once.
    #[must_use]
    pub fn new(ttl: Duration, cap: usize) -> Self {
        Self { entries: HashMap::new(), ttl, cap }
    }

    /// Record a failed handshake for `remote_key`, evicting expired entries
    /// first and, if still at capacity, the oldest remaining entry.
    pub fn record(&mut self, remote_key: &str, env: &E) {
        self.evict_expired(env);
        if self.entries.len() >= self.cap && !self.entries.contains_key(remote_key) {
            if let Some(oldest) = self.entries.iter().min_by_key(|(_, t)| **t).map(|(k, _)| k.clone()) {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(remote_key.to_string(), env.now());
    }

    /// Whether `remote_key` has a recent unexpired failure recorded.
    pub fn is_flagged(&mut self, remote_key: &str, env: &E) -> bool {
        self.evict_expired(env);
        self.entries.contains_key(remote_key)
    }

    /// Number of unexpired entries as of the last mutation (not re-evicted).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&mut self, env: &E) {
        let now = env.now();
        self.entries.retain(|_, t| now - *t < self.ttl);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc as StdArc, atomic::AtomicU64};

    use qwormhole_crypto::derive_neg_hash;

    use super::*;

    #[derive(Clone)]
    struct TestEnv {
        nanos: StdArc<AtomicU64>,
    }

    impl TestEnv {
        fn new() -> Self {
            Self { nanos: StdArc::new(AtomicU64::new(0)) }
        }

        fn advance(&self, d: Duration) {
            self.nanos.fetch_add(u64::try_from(d.as_nanos()).unwrap_or(0), std::sync::atomic::Ordering::Relaxed);
        }
    }

    impl Environment for TestEnv {
        type Instant = Duration;

        fn now(&self) -> Duration {
            Duration::from_nanos(self.nanos.load(std::sync::atomic::Ordering::Relaxed))
        }

        async fn sleep(&self, d: Duration) {
            self.advance(d);
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(3);
        }
    }

    fn handshake_json(extra: &str) -> Vec<u8> {
        format!(r#"{{"type":"handshake","version":"1.0.0"{extra}}}"#).into_bytes()
    }

    #[tokio::test]
    async fn none_mode_accepts_unsigned_payload() {
        let config = HandshakeConfig {
            protocol_version: Some("1.0.0".to_string()),
            verification: HandshakeVerification::None,
            observed_tls_fingerprint: None,
        };
        let env = TestEnv::new();
        let mut ledger = FailedHandshakeLedger::new(Duration::from_secs(60), 100);
        let outcome = process_handshake(&handshake_json(r#","nIndex":0.9"#), &config, "peer-a", &mut ledger, &env)
            .await
            .unwrap();
        assert!(outcome.peer_is_native);
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let config = HandshakeConfig {
            protocol_version: Some("2.0.0".to_string()),
            verification: HandshakeVerification::None,
            observed_tls_fingerprint: None,
        };
        let env = TestEnv::new();
        let mut ledger = FailedHandshakeLedger::new(Duration::from_secs(60), 100);
        let err = process_handshake(&handshake_json(""), &config, "peer-a", &mut ledger, &env).await.unwrap_err();
        assert!(matches!(err, HandshakeError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn signed_negentropic_requires_all_fields() {
        let config = HandshakeConfig {
            protocol_version: None,
            verification: HandshakeVerification::SignedNegentropic,
            observed_tls_fingerprint: None,
        };
        let env = TestEnv::new();
        let mut ledger = FailedHandshakeLedger::new(Duration::from_secs(60), 100);
        let err = process_handshake(&handshake_json(r#","nIndex":0.9"#), &config, "peer-a", &mut ledger, &env)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::MissingSignedFields));
        assert!(ledger.is_flagged("peer-a", &env));
    }

    /// Build a signed-negentropic payload the way a real client would: fill
    /// in every field the signature should cover, sign the canonicalized
    /// unsigned form, then attach the signature.
    fn signed_payload(signing_key: &ed25519_dalek::SigningKey, n_index: f64) -> qwormhole_proto::HandshakePayload {
        use ed25519_dalek::Signer;

        let public_key = signing_key.verifying_key().to_bytes();
        let neg_hash = derive_neg_hash(&public_key, n_index);

        let mut payload = qwormhole_proto::HandshakePayload::new(None);
        payload.n_index = Some(n_index);
        payload.neg_hash = Some(hex::encode(neg_hash));
        payload.public_key = Some(BASE64.encode(public_key));

        let canonical = payload.canonical_unsigned_bytes().unwrap();
        let signature = signing_key.sign(&canonical);
        payload.signature = Some(BASE64.encode(signature.to_bytes()));
        payload
    }

    #[tokio::test]
    async fn signed_negentropic_accepts_valid_signature() {
        use ed25519_dalek::SigningKey;

        let signing_key = SigningKey::from_bytes(&[9u8; 32]);
        let n_index = 0.8_f64;
        let payload = signed_payload(&signing_key, n_index);
        let wire = payload.to_json_bytes().unwrap();

        let config = HandshakeConfig {
            protocol_version: None,
            verification: HandshakeVerification::SignedNegentropic,
            observed_tls_fingerprint: None,
        };
        let env = TestEnv::new();
        let mut ledger = FailedHandshakeLedger::new(Duration::from_secs(60), 100);
        let outcome = process_handshake(&wire, &config, "peer-a", &mut ledger, &env).await.unwrap();
        assert!((outcome.metrics.neg_index - n_index).abs() < 1e-9);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn signed_negentropic_rejects_tampered_signature() {
        use ed25519_dalek::SigningKey;

        let signing_key = SigningKey::from_bytes(&[9u8; 32]);
        let n_index = 0.8_f64;
        let mut payload = signed_payload(&signing_key, n_index);

        let mut signature = BASE64.decode(payload.signature.unwrap()).unwrap();
        signature[0] ^= 0xFF;
        payload.signature = Some(BASE64.encode(signature));
        let wire = payload.to_json_bytes().unwrap();

        let config = HandshakeConfig {
            protocol_version: None,
            verification: HandshakeVerification::SignedNegentropic,
            observed_tls_fingerprint: None,
        };
        let env = TestEnv::new();
        let mut ledger = FailedHandshakeLedger::new(Duration::from_secs(60), 100);
        let err = process_handshake(&wire, &config, "peer-a", &mut ledger, &env).await.unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidSignature(_)));
    }

    #[tokio::test]
    async fn signed_negentropic_rejects_tampering_with_fields_outside_the_neg_hash() {
        use ed25519_dalek::SigningKey;

        let signing_key = SigningKey::from_bytes(&[9u8; 32]);
        let n_index = 0.8_f64;
        let mut payload = signed_payload(&signing_key, n_index);

        // `tags` isn't one of the inputs `negHash` binds (only `publicKey`
        // and `nIndex` are), so a signature scheme that only covered the
        // negHash digest would miss this tamper entirely; the signature
        // over the canonicalized payload must catch it.
        payload.tags = Some(HashMap::from([("tampered".to_string(), TagValue::Text("yes".to_string()))]));
        let wire = payload.to_json_bytes().unwrap();

        let config = HandshakeConfig {
            protocol_version: None,
            verification: HandshakeVerification::SignedNegentropic,
            observed_tls_fingerprint: None,
        };
        let env = TestEnv::new();
        let mut ledger = FailedHandshakeLedger::new(Duration::from_secs(60), 100);
        let err = process_handshake(&wire, &config, "peer-a", &mut ledger, &env).await.unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidSignature(_)));
    }

    #[tokio::test]
    async fn tls_fingerprint_mismatch_is_rejected() {
        let config = HandshakeConfig {
            protocol_version: None,
            verification: HandshakeVerification::None,
            observed_tls_fingerprint: Some("aa:bb".to_string()),
        };
        let env = TestEnv::new();
        let mut ledger = FailedHandshakeLedger::new(Duration::from_secs(60), 100);
        let err = process_handshake(
            &handshake_json(r#","tags":{"tls_fingerprint256":"cc:dd"}"#),
            &config,
            "peer-a",
            &mut ledger,
            &env,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HandshakeError::FingerprintMismatch));
    }

    #[tokio::test]
    async fn external_verifier_rejection_is_recorded() {
        let config = HandshakeConfig {
            protocol_version: None,
            verification: HandshakeVerification::External(Arc::new(|_payload| Box::pin(async { false }))),
            observed_tls_fingerprint: None,
        };
        let env = TestEnv::new();
        let mut ledger = FailedHandshakeLedger::new(Duration::from_secs(60), 100);
        let err = process_handshake(&handshake_json(""), &config, "peer-b", &mut ledger, &env).await.unwrap_err();
        assert!(matches!(err, HandshakeError::VerifierRejected));
        assert!(ledger.is_flagged("peer-b", &env));
    }

    #[test]
    fn ledger_expires_entries_after_ttl() {
        let env = TestEnv::new();
        let mut ledger = FailedHandshakeLedger::new(Duration::from_secs(1), 100);
        ledger.record("peer-a", &env);
        assert!(ledger.is_flagged("peer-a", &env));
        env.advance(Duration::from_secs(2));
        assert!(!ledger.is_flagged("peer-a", &env));
    }

    #[test]
    fn ledger_evicts_oldest_entry_at_capacity() {
        let env = TestEnv::new();
        let mut ledger = FailedHandshakeLedger::new(Duration::from_secs(60), 2);
        ledger.record("peer-a", &env);
        env.advance(Duration::from_millis(1));
        ledger.record("peer-b", &env);
        env.advance(Duration::from_millis(1));
        ledger.record("peer-c", &env);
        assert_eq!(ledger.len(), 2);
        assert!(!ledger.is_flagged("peer-a", &env));
        assert!(ledger.is_flagged("peer-c", &env));
    }
}
