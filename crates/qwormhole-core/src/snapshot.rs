//! Trust snapshot: the per-close diagnostic record emitted by both
//! `qwormhole-server` and `qwormhole-client` (§4.H/§4.I). Lives here because
//! it composes [`ControllerDiagnostics`] and [`FramerStats`], which this
//! crate already owns; the listener/connect code that decides *when* to
//! build one stays in `qwormhole-server`/`qwormhole-client`.

use std::collections::HashMap;

use qwormhole_proto::{EntropyMetrics, TagValue};

use crate::{flow_controller::ControllerDiagnostics, framer::FramerStats};

/// Which side of the connection emitted a [`TrustSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotDirection {
    /// Emitted by the accepting side.
    Server,
    /// Emitted by the connecting side.
    Client,
}

/// Why a connection closed, carried on the snapshot so a sink can
/// distinguish a graceful shutdown from a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the socket, or the local side closed it gracefully.
    Close,
    /// A socket or protocol error destroyed the connection.
    Error,
    /// The local caller initiated the close (client `disconnect`).
    Disconnect,
}

/// Per-connection diagnostics delivered to a trust-snapshot sink exactly
/// once per close event (§4.H).
#[derive(Debug, Clone)]
pub struct TrustSnapshot {
    /// Which side emitted this snapshot.
    pub direction: SnapshotDirection,
    /// Why the connection closed.
    pub reason: CloseReason,
    /// Remote address as a display string.
    pub remote: String,
    /// Peer identifier, if the handshake carried one in its tags.
    pub peer_id: Option<String>,
    /// Free-form tags from the peer's handshake payload.
    pub handshake_tags: HashMap<String, TagValue>,
    /// Resolved entropy metrics, if the handshake completed.
    pub entropy_metrics: Option<EntropyMetrics>,
    /// The derived policy's trust multiplier, if the handshake completed.
    pub policy_trust_level: Option<f64>,
    /// Flow-controller diagnostics at close, if a controller was attached.
    pub flow_diagnostics: Option<ControllerDiagnostics>,
    /// Framer stats at close (post-flush, pre-reset).
    pub batch_stats: FramerStats,
}
