//! Stateful transport core for QWormhole: the ring-buffered batch framer,
//! token bucket and priority queue, adaptive flow controller, and handshake
//! state machine. Generic over an `Environment`/`SchedulerTelemetry` pair so
//! `qwormhole-server`/`qwormhole-client` can drive it against a real socket
//! while `qwormhole-harness` drives it against deterministic doubles.
//!
//! This crate performs I/O (it holds the socket and writes to it) but owns
//! no network listener or connect logic of its own; that lives in
//! `qwormhole-server`/`qwormhole-client`.

pub mod env;
pub mod error;
pub mod flow_controller;
pub mod framer;
pub mod handshake;
pub mod priority_queue;
pub mod ring;
pub mod snapshot;
pub mod token_bucket;

pub use env::{AdaptiveMode, EnvOverrides, Environment, SchedulerTelemetry, TokioEnvironment, TokioSchedulerTelemetry};
pub use error::{ConnectionError, ErrorCode, FramerError, HandshakeError};
pub use flow_controller::{
    ControllerDiagnostics, ControllerEvent, ControllerState, FlowController, FlowControllerConfig, SliceDriftReason,
    SliceHistoryEntry,
};
pub use framer::{BatchFramer, BatchFramerConfig, FlushTrigger, FramerEvent, FramerSnapshot, FramerStats};
pub use handshake::{
    FailedHandshakeLedger, HandshakeConfig, HandshakeOutcome, HandshakeVerification, VerifierFn, VerifierFuture,
    process_handshake,
};
pub use priority_queue::{PRIORITY_DEFAULT, PRIORITY_HANDSHAKE, PRIORITY_HEARTBEAT, PriorityQueue};
pub use ring::{DEFAULT_RING_SLOTS, DEFAULT_SLOT_CAPACITY, RingBuffer, SlotRef};
pub use snapshot::{CloseReason, SnapshotDirection, TrustSnapshot};
pub use token_bucket::TokenBucket;
