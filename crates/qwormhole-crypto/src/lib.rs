//! QWormhole signed-negentropic handshake verification.
//!
//! Pure functions with deterministic outputs: given the same public key,
//! negentropic index, and signed bytes, verification always produces the
//! same result. No key material is generated or stored here — callers
//! supply the public key and signature bytes taken off the wire.
//!
//! # Security
//!
//! - Signature verification uses the `ed25519-dalek` reference
//!   implementation; failures are reported as [`CryptoError`], never panics.
//! - `negHash` binds a claimed negentropic index to a public key so a peer
//!   cannot present a high-trust index without the key that was used to
//!   derive it.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from signed-negentropic handshake verification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Public key bytes were not a valid ed25519 verifying key.
    #[error("invalid ed25519 public key")]
    InvalidPublicKey,

    /// Signature bytes were not a valid ed25519 signature encoding.
    #[error("invalid ed25519 signature encoding")]
    InvalidSignatureEncoding,

    /// Signature did not verify against the supplied data and public key.
    #[error("ed25519 signature verification failed")]
    SignatureMismatch,

    /// `negHash` did not match the deterministic derivation from the
    /// public key and negentropic index.
    #[error("negHash mismatch")]
    NegHashMismatch,

    /// A hex-encoded field failed to decode.
    #[error("invalid hex encoding: {0}")]
    InvalidHex(String),
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Verify an ed25519 signature over `signed_data` using `public_key_bytes`.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPublicKey`] or
/// [`CryptoError::InvalidSignatureEncoding`] if either input is malformed,
/// or [`CryptoError::SignatureMismatch`] if verification fails.
pub fn verify_signature(
    public_key_bytes: &[u8],
    signature_bytes: &[u8],
    signed_data: &[u8],
) -> Result<()> {
    let key_array: [u8; 32] =
        public_key_bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_array).map_err(|_| CryptoError::InvalidPublicKey)?;

    let sig_array: [u8; 64] =
        signature_bytes.try_into().map_err(|_| CryptoError::InvalidSignatureEncoding)?;
    let signature = Signature::from_bytes(&sig_array);

    verifying_key
        .verify(signed_data, &signature)
        .map_err(|_| CryptoError::SignatureMismatch)
}

/// Derive the deterministic `negHash` for a signed-negentropic handshake:
/// `SHA-256(publicKey || (publicKey XOR byte(floor(clamp(nIndex) * 255))) || nIndex.toFixed(6))`.
///
/// `n_index` is clamped into `[0, 1]` before use, matching
/// [`qwormhole_proto::clamp_unit`].
#[must_use]
pub fn derive_neg_hash(public_key_bytes: &[u8], n_index: f64) -> [u8; 32] {
    let clamped = n_index.clamp(0.0, 1.0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let xor_byte = (clamped * 255.0).floor() as u8;

    let xored: Vec<u8> = public_key_bytes.iter().map(|b| b ^ xor_byte).collect();
    let fixed = format!("{clamped:.6}");

    let mut hasher = Sha256::new();
    hasher.update(public_key_bytes);
    hasher.update(&xored);
    hasher.update(fixed.as_bytes());
    hasher.finalize().into()
}

/// Verify that a claimed `negHash` (raw bytes, already hex-decoded by the
/// caller) matches the deterministic derivation.
///
/// # Errors
///
/// Returns [`CryptoError::NegHashMismatch`] if the derivation does not
/// match `claimed_neg_hash`.
pub fn verify_neg_hash(public_key_bytes: &[u8], n_index: f64, claimed_neg_hash: &[u8]) -> Result<()> {
    let expected = derive_neg_hash(public_key_bytes, n_index);
    if expected.as_slice() == claimed_neg_hash {
        Ok(())
    } else {
        Err(CryptoError::NegHashMismatch)
    }
}

/// Decode a hex string into bytes, wrapping decode errors as
/// [`CryptoError::InvalidHex`].
///
/// # Errors
///
/// Returns [`CryptoError::InvalidHex`] if `s` is not valid hex.
pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|e| CryptoError::InvalidHex(e.to_string()))
}
