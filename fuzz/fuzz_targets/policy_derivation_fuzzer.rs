//! Fuzz target for the entropy-index policy table.
//!
//! `derive_policy`/`merge`/`derive_session_flow_policy` are pure step
//! functions over an `f64` that is expected to arrive already clamped to
//! `[0, 1]`, but the handshake layer derives it from externally supplied
//! metrics — this target throws NaN, infinities, and out-of-range values at
//! them to confirm they never panic and always return a policy whose
//! `trust_level` is itself a finite, in-range number.

#![no_main]

use libfuzzer_sys::fuzz_target;
use qwormhole_proto::policy::{clamp_unit, derive_policy, derive_session_flow_policy, merge};

#[derive(Debug, arbitrary::Arbitrary)]
struct FuzzInput {
    a_bits: u64,
    b_bits: u64,
    peer_is_native: bool,
}

fuzz_target!(|input: FuzzInput| {
    let a = f64::from_bits(input.a_bits);
    let b = f64::from_bits(input.b_bits);

    let policy_a = derive_policy(a);
    assert!(policy_a.trust_level.is_finite());
    assert!((0.0..=1.0).contains(&policy_a.trust_level));

    let merged = merge(a, b);
    assert!(merged.trust_level.is_finite());
    assert!((0.0..=1.0).contains(&merged.trust_level));

    let clamped = clamp_unit(a);
    assert!((0.0..=1.0).contains(&clamped) || clamped.is_nan());

    let flow = derive_session_flow_policy(a, None, None, input.peer_is_native);
    assert!(flow.preferred_batch_size > 0);
    assert!(flow.min_slice <= flow.max_slice);
});
