//! Wire format and pure protocol logic for QWormhole.
//!
//! This crate has no async runtime dependency and performs no I/O: it owns
//! the length-prefixed frame format (component A), the handshake JSON
//! payload type (§6), and the entropy/session-flow policy derivation
//! (components D and E). `qwormhole-core` builds the stateful framer,
//! controller, and handshake state machine on top of these types.

pub mod errors;
pub mod frame;
pub mod handshake;
pub mod policy;

pub use errors::{ProtocolError, Result};
pub use frame::{FrameDecoder, DEFAULT_MAX_FRAME_LENGTH, LENGTH_PREFIX_SIZE, encode_frame};
pub use handshake::{HandshakePayload, TagValue, WireEntropyMetrics, HANDSHAKE_TYPE};
pub use policy::{
    CodecHint, CoherenceLevel, EntropyMetrics, EntropyPolicy, EntropyVelocity, Framing,
    PolicyMode, SessionFlowPolicy, clamp_unit, derive_policy, derive_session_flow_policy,
    derive_session_flow_policy_from_metrics, merge,
};
