//! Entropy-driven policy derivation (components D and E).
//!
//! Every function here is a pure, deterministic step function over a
//! negentropic index; none of it performs I/O.

use serde::{Deserialize, Serialize};

/// Discrete trust/framing posture derived from a negentropic index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    /// `neg_index >= 0.85`.
    TrustZero,
    /// `0.65 <= neg_index < 0.85`.
    TrustLight,
    /// `0.40 <= neg_index < 0.65`.
    Immune,
    /// `neg_index < 0.40`.
    Paranoia,
}

/// Framing strategy a policy selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Trusted peers: vectored writes, no acks or checksums.
    ZeroCopyWritev,
    /// Length-prefixed frames, no acks.
    LengthPrefix,
    /// Length-prefixed frames with required acks.
    LengthAck,
    /// Length-prefixed frames with required acks and checksums.
    LengthAckChecksum,
}

impl Framing {
    /// Whether this framing mode implies the peer is treated as "native"
    /// (fully trusted, eligible for the higher non-native slice cap).
    #[must_use]
    pub fn is_native(self) -> bool {
        matches!(self, Self::ZeroCopyWritev)
    }
}

/// Codec hint attached to a policy tier. Advisory only; this crate does not
/// implement any of these codecs itself (frame payloads stay opaque bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecHint {
    /// Trust-zero tier.
    Flatbuffers,
    /// Trust-light tier.
    Cbor,
    /// Immune tier.
    MessagePack,
    /// Paranoia tier.
    JsonCompressed,
}

/// The closed-form policy for a given negentropic index (see the table in
/// the data model).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntropyPolicy {
    /// Discrete trust tier.
    pub mode: PolicyMode,
    /// Framing strategy for this tier.
    pub framing: Framing,
    /// Preferred batch size (frames per flush) for this tier.
    pub batch_size: u32,
    /// Advisory codec hint for this tier.
    pub codec_hint: CodecHint,
    /// Whether this tier requires per-frame acknowledgement.
    pub require_ack: bool,
    /// Whether this tier requires per-frame checksums.
    pub require_checksum: bool,
    /// Trust multiplier in `[0, 1]` applied to burst/rate budgets.
    pub trust_level: f64,
}

impl EntropyPolicy {
    /// Whether a peer operating under this policy is treated as native.
    #[must_use]
    pub fn is_native(&self) -> bool {
        self.framing.is_native()
    }
}

/// Clamp a raw index into `[0, 1]`.
#[must_use]
pub fn clamp_unit(n: f64) -> f64 {
    n.clamp(0.0, 1.0)
}

/// Derive the policy tier for a negentropic index. Pure step function;
/// breakpoints are 0.40, 0.65, 0.85 and each breakpoint maps to the upper
/// (more trusted) mode.
#[must_use]
pub fn derive_policy(neg_index: f64) -> EntropyPolicy {
    let n = clamp_unit(neg_index);
    if n >= 0.85 {
        EntropyPolicy {
            mode: PolicyMode::TrustZero,
            framing: Framing::ZeroCopyWritev,
            batch_size: 64,
            codec_hint: CodecHint::Flatbuffers,
            require_ack: false,
            require_checksum: false,
            trust_level: 1.00,
        }
    } else if n >= 0.65 {
        EntropyPolicy {
            mode: PolicyMode::TrustLight,
            framing: Framing::LengthPrefix,
            batch_size: 32,
            codec_hint: CodecHint::Cbor,
            require_ack: false,
            require_checksum: false,
            trust_level: 0.75,
        }
    } else if n >= 0.40 {
        EntropyPolicy {
            mode: PolicyMode::Immune,
            framing: Framing::LengthAck,
            batch_size: 8,
            codec_hint: CodecHint::MessagePack,
            require_ack: true,
            require_checksum: false,
            trust_level: 0.50,
        }
    } else {
        EntropyPolicy {
            mode: PolicyMode::Paranoia,
            framing: Framing::LengthAckChecksum,
            batch_size: 1,
            codec_hint: CodecHint::JsonCompressed,
            require_ack: true,
            require_checksum: true,
            trust_level: 0.25,
        }
    }
}

/// Merge two local policies by taking the more conservative negentropic
/// index. Commutative: `merge(a, b) == merge(b, a)`.
#[must_use]
pub fn merge(local_neg_index: f64, peer_neg_index: f64) -> EntropyPolicy {
    derive_policy(local_neg_index.min(peer_neg_index))
}

/// Discrete coherence label, either observed directly or derived from
/// `neg_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoherenceLevel {
    /// Highly ordered signal.
    High,
    /// Moderately ordered signal.
    Medium,
    /// Weakly ordered signal.
    Low,
    /// Unordered / adversarial signal.
    Chaos,
}

impl CoherenceLevel {
    /// Derive a label from a clamped negentropic index using the same
    /// breakpoints as [`derive_policy`].
    #[must_use]
    pub fn from_neg_index(neg_index: f64) -> Self {
        let n = clamp_unit(neg_index);
        if n >= 0.85 {
            Self::High
        } else if n >= 0.65 {
            Self::Medium
        } else if n >= 0.40 {
            Self::Low
        } else {
            Self::Chaos
        }
    }

    /// Numeric weight used by session flow policy derivation.
    #[must_use]
    pub fn numeric(self) -> f64 {
        match self {
            Self::High => 0.9,
            Self::Medium => 0.7,
            Self::Low => 0.4,
            Self::Chaos => 0.1,
        }
    }
}

/// Discrete entropy-velocity label summarizing the rate of change of
/// successive `neg_index` samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntropyVelocity {
    /// Index is changing slower than `0.01` per second.
    Low,
    /// Index is changing at a moderate, unremarkable rate (the default).
    Stable,
    /// Index is changing faster than `0.1` per second.
    Rising,
    /// Index is changing faster than `0.5` per second.
    Spiking,
}

impl EntropyVelocity {
    /// Derive a label from two successive samples and the elapsed wall-clock
    /// time between them, in seconds.
    #[must_use]
    pub fn from_delta(prior_neg_index: f64, current_neg_index: f64, elapsed_secs: f64) -> Self {
        if elapsed_secs <= 0.0 {
            return Self::Stable;
        }
        let rate = (current_neg_index - prior_neg_index).abs() / elapsed_secs;
        if rate > 0.5 {
            Self::Spiking
        } else if rate > 0.1 {
            Self::Rising
        } else if rate < 0.01 {
            Self::Low
        } else {
            Self::Stable
        }
    }

    /// Numeric weight used by session flow policy derivation.
    #[must_use]
    pub fn numeric(self) -> f64 {
        match self {
            Self::Low => 0.1,
            Self::Stable => 0.3,
            Self::Rising => 0.6,
            Self::Spiking => 1.0,
        }
    }
}

/// Fully-resolved entropy metrics, as attached to a connection after
/// handshake processing. Unlike the wire's optional fields, every field here
/// is populated (derived from `neg_index` when the peer did not supply it).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntropyMetrics {
    /// `8 * (1 - neg_index)` unless supplied directly.
    pub entropy: f64,
    /// Rate-of-change label.
    pub entropy_velocity: EntropyVelocity,
    /// Order label.
    pub coherence: CoherenceLevel,
    /// Clamped negentropic index in `[0, 1]`.
    pub neg_index: f64,
}

impl EntropyMetrics {
    /// Derive full metrics from `neg_index` alone, defaulting velocity to
    /// `Stable` (no prior sample to compare against).
    #[must_use]
    pub fn from_neg_index(neg_index: f64) -> Self {
        let n = clamp_unit(neg_index);
        Self {
            entropy: 8.0 * (1.0 - n),
            entropy_velocity: EntropyVelocity::Stable,
            coherence: CoherenceLevel::from_neg_index(n),
            neg_index: n,
        }
    }
}

/// Numeric view of a session's flow policy, consumed by the adaptive flow
/// controller (component F).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionFlowPolicy {
    /// Coherence weight in `[0, 1]`.
    pub coherence: f64,
    /// Entropy-velocity weight in `[0, 1]`.
    pub entropy_velocity: f64,
    /// Preferred batch size from the entropy policy table.
    pub preferred_batch_size: u32,
    /// Lower bound on slice size; always 4.
    pub min_slice: u32,
    /// Upper bound on slice size after peer-kind capping.
    pub max_slice: u32,
    /// Token-bucket burst budget in bytes, scaled by trust level.
    pub burst_budget_bytes: u64,
    /// Token-bucket refill rate in bytes/sec, scaled by trust level.
    pub rate_bytes_per_sec: u64,
    /// Whether the peer is treated as native (zero-copy-writev framing).
    pub peer_is_native: bool,
    /// Clamped negentropic index this policy was derived from.
    pub n_index: f64,
}

const MIN_SLICE: u32 = 4;
const BASE_BURST_BUDGET_BYTES: u64 = 256 * 1024;
const BASE_RATE_BYTES_PER_SEC: u64 = 10 * 1024 * 1024;

/// Cap on `max_slice` for non-native peers below the trust-zero breakpoint.
const NON_NATIVE_CAP_LOW: u32 = 16;
/// Cap on `max_slice` for non-native peers at or above the trust-zero
/// breakpoint.
const NON_NATIVE_CAP_HIGH: u32 = 32;

/// Derive the numeric session flow policy (component E) from entropy
/// metrics and whether the peer is native.
///
/// `coherence_label`/`velocity_label` model the wire's *optional* fields:
/// when present, the label's fixed numeric weight is used; when absent, the
/// raw `neg_index` (for coherence) or the `Stable` default (for velocity)
/// is used instead, exactly mirroring the handshake JSON's optionality.
#[must_use]
pub fn derive_session_flow_policy(
    neg_index: f64,
    coherence_label: Option<CoherenceLevel>,
    velocity_label: Option<EntropyVelocity>,
    peer_is_native: bool,
) -> SessionFlowPolicy {
    let n = clamp_unit(neg_index);
    let policy = derive_policy(n);
    let coherence = coherence_label.map_or(n, CoherenceLevel::numeric);
    let entropy_velocity = velocity_label.map_or(EntropyVelocity::Stable.numeric(), EntropyVelocity::numeric);
    let max_slice = effective_max_slice(policy.batch_size, n, peer_is_native);

    SessionFlowPolicy {
        coherence,
        entropy_velocity,
        preferred_batch_size: policy.batch_size,
        min_slice: MIN_SLICE,
        max_slice,
        burst_budget_bytes: scale(BASE_BURST_BUDGET_BYTES, policy.trust_level),
        rate_bytes_per_sec: scale(BASE_RATE_BYTES_PER_SEC, policy.trust_level),
        peer_is_native,
        n_index: n,
    }
}

/// Convenience entry point for fully-resolved metrics (post-handshake
/// attach), where both labels are always present.
#[must_use]
pub fn derive_session_flow_policy_from_metrics(
    metrics: &EntropyMetrics,
    peer_is_native: bool,
) -> SessionFlowPolicy {
    derive_session_flow_policy(
        metrics.neg_index,
        Some(metrics.coherence),
        Some(metrics.entropy_velocity),
        peer_is_native,
    )
}

fn effective_max_slice(preferred_batch_size: u32, neg_index: f64, peer_is_native: bool) -> u32 {
    if peer_is_native {
        preferred_batch_size
    } else {
        let cap = if neg_index >= 0.85 { NON_NATIVE_CAP_HIGH } else { NON_NATIVE_CAP_LOW };
        preferred_batch_size.min(cap)
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scale(base: u64, trust_level: f64) -> u64 {
    ((base as f64) * trust_level) as u64
}
