//! Per-connection driver (component H data path).
//!
//! Generic over the socket, environment, and scheduler-telemetry types so
//! `qwormhole-harness` can drive the exact same state machine against
//! `turmoil` sockets and deterministic doubles instead of real ones. The
//! listener in [`crate::Server`] is the only piece of this crate that knows
//! about `tokio::net::TcpListener`; everything below is generic.

use std::{pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use qwormhole_core::{
    AdaptiveMode, BatchFramer, BatchFramerConfig, CloseReason, ControllerState, Environment, FailedHandshakeLedger,
    FlowController, FlowControllerConfig, FramerEvent, HandshakeConfig, HandshakeOutcome, HandshakeVerification,
    PRIORITY_DEFAULT, PRIORITY_HANDSHAKE, PriorityQueue, SchedulerTelemetry, SnapshotDirection, TrustSnapshot,
};
use qwormhole_proto::{HandshakePayload, derive_session_flow_policy_from_metrics};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    sync::{Mutex, mpsc},
    time::Sleep,
};

/// Default backpressure ceiling (§4.H `max_backpressure_bytes`).
pub const DEFAULT_MAX_BACKPRESSURE_BYTES: u64 = 5 * 1024 * 1024;

/// Size of the read buffer used to pull raw bytes off the socket.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Per-connection configuration, resolved once at accept time from
/// [`crate::ServerConfig`].
#[derive(Clone)]
pub struct ConnectionConfig {
    /// `max_frame_length` enforced on the inbound decoder.
    pub max_frame_length: u32,
    /// Locally configured protocol version.
    pub protocol_version: Option<String>,
    /// How inbound handshake payloads are verified.
    pub handshake_verification: HandshakeVerification,
    /// `max_backpressure_bytes`: destroys the connection when exceeded.
    pub max_backpressure_bytes: u64,
    /// Whether to also deliver the validated handshake payload itself as an
    /// application message (deduped to at most once).
    pub emit_handshake_messages: bool,
    /// Overrides the peer-native default adaptive mode when set.
    pub adaptive_mode: Option<AdaptiveMode>,
    /// `FORCE_SLICE` / explicit pin.
    pub forced_slice: Option<u32>,
    /// `FORCE_RATE_BYTES` / explicit pin.
    pub forced_rate_bytes_per_sec: Option<u64>,
    /// Whether to use vectored writes when a flush batch holds two or more
    /// buffers.
    pub use_writev: bool,
    /// Deferred-flush timer interval; `None` disables it.
    pub flush_interval_ms: Option<u64>,
    /// `idle_timeout_ms`: the connection is torn down after this long with
    /// no inbound bytes.
    pub idle_timeout_ms: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_length: qwormhole_proto::DEFAULT_MAX_FRAME_LENGTH,
            protocol_version: None,
            handshake_verification: HandshakeVerification::None,
            max_backpressure_bytes: DEFAULT_MAX_BACKPRESSURE_BYTES,
            emit_handshake_messages: false,
            adaptive_mode: None,
            forced_slice: None,
            forced_rate_bytes_per_sec: None,
            use_writev: true,
            flush_interval_ms: None,
            idle_timeout_ms: None,
        }
    }
}

/// Handle a caller uses to push outbound application payloads to a live
/// connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    outbound: mpsc::UnboundedSender<Bytes>,
}

impl ConnectionHandle {
    /// This connection's server-assigned id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Enqueue `payload` for delivery at [`PRIORITY_DEFAULT`]. A closed
    /// connection silently drops the payload; callers observe this via the
    /// connection's close event instead of a per-send error.
    pub fn send(&self, payload: Bytes) {
        let _ = self.outbound.send(payload);
    }
}

/// How a connection's driver loop terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOutcome {
    /// Server-assigned connection id.
    pub id: u64,
    /// §4.I close classification: true if any error was observed, or the
    /// handshake was still pending when the socket closed.
    pub had_error: bool,
}

/// Application messages delivered upstream, tagged with their connection id
/// so a multi-connection server can demultiplex a single channel.
pub type InboundMessage = (u64, Bytes);

/// A trust-snapshot sink: an async callback invoked exactly once per closed
/// connection.
pub type TrustSnapshotSink =
    Arc<dyn Fn(TrustSnapshot) -> Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync>;

/// Coarse telemetry events a connection driver reports upstream, independent
/// of the per-connection trust snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTelemetryEvent {
    /// A flush hit partial-write backpressure.
    Backpressure,
    /// The socket drained after backpressure.
    Drain,
}

async fn wait_deferred_flush(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.await,
        None => std::future::pending().await,
    }
}

async fn wait_optional(timer: Option<Sleep>) {
    match timer {
        Some(sleep) => sleep.await,
        None => std::future::pending().await,
    }
}

/// Drive a single accepted connection end to end: handshake validation,
/// inbound message delivery, outbound batching/flow control, and trust
/// snapshot emission on close.
///
/// Owns the socket for the connection's entire lifetime; the caller gets a
/// [`ConnectionHandle`] back out-of-band (via `handle_tx`) to send to it.
#[allow(clippy::too_many_arguments)]
pub async fn drive_connection<S, E, T>(
    id: u64,
    remote: String,
    socket: S,
    config: ConnectionConfig,
    env: E,
    telemetry: T,
    observed_tls_fingerprint: Option<String>,
    ledger: Arc<Mutex<FailedHandshakeLedger<E>>>,
    messages: mpsc::UnboundedSender<InboundMessage>,
    handle_tx: mpsc::UnboundedSender<ConnectionHandle>,
    trust_sink: Option<TrustSnapshotSink>,
    telemetry_events: Option<mpsc::UnboundedSender<ServerTelemetryEvent>>,
) -> ConnectionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: Environment,
    T: SchedulerTelemetry,
{
    let (mut read_half, write_half) = tokio::io::split(socket);

    let (framer_events_tx, mut framer_events_rx) = mpsc::unbounded_channel();
    let framer_config = BatchFramerConfig {
        max_frame_length: config.max_frame_length,
        batch_size: 1,
        flush_interval_ms: config.flush_interval_ms,
        use_writev: config.use_writev,
        ..BatchFramerConfig::default()
    };
    let mut framer = BatchFramer::new(framer_config, framer_events_tx);
    framer.attach_socket(write_half);

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
    let _ = handle_tx.send(ConnectionHandle { id, outbound: outbound_tx });

    let handshake_config = HandshakeConfig {
        protocol_version: config.protocol_version.clone(),
        verification: config.handshake_verification.clone(),
        observed_tls_fingerprint,
    };

    let mut outbound_queue: PriorityQueue<Bytes> = PriorityQueue::new();
    if config.protocol_version.is_some() || !matches!(config.handshake_verification, HandshakeVerification::None) {
        let handshake = HandshakePayload::new(config.protocol_version.clone());
        if let Ok(bytes) = handshake.to_json_bytes() {
            outbound_queue.enqueue(Bytes::from(bytes), PRIORITY_HANDSHAKE);
        }
    }

    let mut controller: Option<FlowController<E>> = None;
    let mut handshake_pending = true;
    let mut handshake_delivered = false;
    let mut outcome_handshake: Option<HandshakeOutcome> = None;
    let mut had_error = false;
    let flush_interval = config.flush_interval_ms.filter(|ms| *ms > 0).map(Duration::from_millis);
    let mut deferred_flush: Option<Pin<Box<Sleep>>> = None;
    let mut read_buf = vec![0u8; READ_BUF_SIZE];

    drain_handshake_queue(&mut outbound_queue, &mut framer).await;

    'driver: loop {
        if deferred_flush.is_none()
            && let Some(interval) = flush_interval
            && controller.as_ref().is_some_and(|c| c.state() == ControllerState::Batching)
        {
            deferred_flush = Some(Box::pin(tokio::time::sleep(interval)));
        }
        let idle_deadline = config.idle_timeout_ms.map(|ms| tokio::time::sleep(Duration::from_millis(ms)));

        tokio::select! {
            biased;

            read_result = read_half.read(&mut read_buf) => {
                match read_result {
                    Ok(0) => break 'driver,
                    Ok(n) => {
                        if framer.push_inbound(&read_buf[..n]).is_err() {
                            had_error = true;
                            break 'driver;
                        }
                    },
                    Err(_) => {
                        had_error = true;
                        break 'driver;
                    },
                }
            },

            Some(payload) = outbound_rx.recv() => {
                outbound_queue.enqueue(payload, PRIORITY_DEFAULT);
                if !handshake_pending {
                    drain_application_queue(&mut outbound_queue, &mut controller, &mut framer, &env, &telemetry).await;
                }
            },

            Some(event) = framer_events_rx.recv() => {
                match event {
                    FramerEvent::Message(payload) => {
                        if handshake_pending {
                            let mut ledger_guard = ledger.lock().await;
                            match qwormhole_core::process_handshake(&payload, &handshake_config, &remote, &mut ledger_guard, &env).await {
                                Ok(resolved) => {
                                    drop(ledger_guard);
                                    let flow_policy = derive_session_flow_policy_from_metrics(&resolved.metrics, resolved.peer_is_native);
                                    let adaptive_mode = config.adaptive_mode.unwrap_or_else(|| AdaptiveMode::default_for_peer(resolved.peer_is_native));
                                    let (controller_events_tx, _controller_events_rx) = mpsc::unbounded_channel();
                                    let mut new_controller = FlowController::new(
                                        FlowControllerConfig {
                                            preferred_batch_size: flow_policy.preferred_batch_size,
                                            min_slice: flow_policy.min_slice,
                                            max_slice: flow_policy.max_slice,
                                            burst_budget_bytes: flow_policy.burst_budget_bytes,
                                            rate_bytes_per_sec: flow_policy.rate_bytes_per_sec,
                                            peer_is_native: flow_policy.peer_is_native,
                                            neg_index: flow_policy.n_index,
                                            forced_slice: config.forced_slice,
                                            adaptive_mode,
                                        },
                                        controller_events_tx,
                                    );
                                    if let Some(rate) = config.forced_rate_bytes_per_sec {
                                        new_controller.override_rate_bytes_per_sec(rate);
                                    }
                                    framer.set_batch_size(new_controller.slice_size());
                                    handshake_pending = false;
                                    if config.emit_handshake_messages && !handshake_delivered {
                                        handshake_delivered = true;
                                        let _ = messages.send((id, payload));
                                    }
                                    controller = Some(new_controller);
                                    outcome_handshake = Some(resolved);
                                    drain_application_queue(&mut outbound_queue, &mut controller, &mut framer, &env, &telemetry).await;
                                },
                                Err(_) => {
                                    had_error = true;
                                    break 'driver;
                                },
                            }
                        } else {
                            let _ = messages.send((id, payload));
                        }
                    },
                    FramerEvent::Backpressure { queued_bytes } => {
                        if let Some(c) = controller.as_mut() {
                            c.on_backpressure();
                        }
                        if let Some(tx) = &telemetry_events {
                            let _ = tx.send(ServerTelemetryEvent::Backpressure);
                        }
                        if queued_bytes > config.max_backpressure_bytes {
                            had_error = true;
                            break 'driver;
                        }
                    },
                    FramerEvent::Drain => {
                        if let Some(c) = controller.as_mut() {
                            c.on_drain();
                        }
                        if let Some(tx) = &telemetry_events {
                            let _ = tx.send(ServerTelemetryEvent::Drain);
                        }
                    },
                    FramerEvent::Flush { .. } => {},
                    FramerEvent::Error(_) => {
                        had_error = true;
                        break 'driver;
                    },
                }
            },

            () = wait_deferred_flush(&mut deferred_flush) => {
                deferred_flush = None;
                if let Some(c) = controller.as_mut() {
                    let _ = c.force_flush(&mut framer, &env, &telemetry).await;
                }
            },

            () = wait_optional(idle_deadline) => {
                break 'driver;
            },
        }
    }

    if let Some(c) = controller.as_mut() {
        let _ = c.force_flush(&mut framer, &env, &telemetry).await;
    }

    if let Some(sink) = trust_sink {
        let snapshot =
            build_trust_snapshot(&remote, outcome_handshake.as_ref(), controller.as_ref(), &mut framer, had_error)
                .await;
        sink(snapshot).await;
    }

    ConnectionOutcome { id, had_error: had_error || handshake_pending }
}

async fn drain_handshake_queue<S>(queue: &mut PriorityQueue<Bytes>, framer: &mut BatchFramer<S>)
where
    S: AsyncWrite + Unpin + Send,
{
    while let Some(payload) = queue.dequeue() {
        framer.encode_to_batch(&payload);
        let _ = framer.flush_batch().await;
    }
}

async fn drain_application_queue<S, E, T>(
    queue: &mut PriorityQueue<Bytes>,
    controller: &mut Option<FlowController<E>>,
    framer: &mut BatchFramer<S>,
    env: &E,
    telemetry: &T,
) where
    S: AsyncWrite + Unpin + Send,
    E: Environment,
    T: SchedulerTelemetry,
{
    let Some(controller) = controller.as_mut() else {
        drain_handshake_queue(queue, framer).await;
        return;
    };
    while let Some(payload) = queue.dequeue() {
        let _ = controller.enqueue(&payload, framer, env, telemetry).await;
    }
}

async fn build_trust_snapshot<S, E>(
    remote: &str,
    outcome: Option<&HandshakeOutcome>,
    controller: Option<&FlowController<E>>,
    framer: &mut BatchFramer<S>,
    had_error: bool,
) -> TrustSnapshot
where
    S: AsyncWrite + Unpin + Send,
    E: Environment,
{
    let batch_stats = framer.snapshot(true).await.stats;
    TrustSnapshot {
        direction: SnapshotDirection::Server,
        reason: if had_error { CloseReason::Error } else { CloseReason::Close },
        remote: remote.to_string(),
        peer_id: None,
        handshake_tags: outcome.map(|o| o.tags.clone()).unwrap_or_default(),
        entropy_metrics: outcome.map(|o| o.metrics),
        policy_trust_level: outcome.map(|o| o.policy.trust_level),
        flow_diagnostics: controller.map(FlowController::diagnostics),
        batch_stats,
    }
}

#[cfg(test)]
mod tests {
    use qwormhole_core::TokioEnvironment;

    use super::*;

    #[tokio::test]
    async fn plain_handshake_round_trip_over_duplex() {
        let (mut client, server) = tokio::io::duplex(1 << 16);
        let (messages_tx, mut messages_rx) = mpsc::unbounded_channel();
        let (handle_tx, mut handle_rx) = mpsc::unbounded_channel();
        let ledger = Arc::new(Mutex::new(FailedHandshakeLedger::<TokioEnvironment>::new(
            Duration::from_secs(3600),
            10_000,
        )));

        let config = ConnectionConfig { protocol_version: Some("1.0.0".to_string()), ..ConnectionConfig::default() };

        let driver = tokio::spawn(drive_connection(
            1,
            "127.0.0.1:1".to_string(),
            server,
            config,
            TokioEnvironment,
            qwormhole_core::TokioSchedulerTelemetry::default(),
            None,
            ledger,
            messages_tx,
            handle_tx,
            None,
            None,
        ));

        let mut decoder = qwormhole_proto::FrameDecoder::with_default_max_frame_length();
        let mut buf = [0u8; 4096];
        let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
        decoder.push(&buf[..n]).unwrap();
        let handshake_frame = decoder.next_frame().unwrap().unwrap();
        let payload = qwormhole_proto::HandshakePayload::from_json_bytes(&handshake_frame).unwrap();
        assert_eq!(payload.version.as_deref(), Some("1.0.0"));

        let client_handshake = qwormhole_proto::HandshakePayload::new(Some("1.0.0".to_string()));
        let mut wire = Vec::new();
        qwormhole_proto::encode_frame(&client_handshake.to_json_bytes().unwrap(), &mut wire);
        tokio::io::AsyncWriteExt::write_all(&mut client, &wire).await.unwrap();

        let _handle = handle_rx.recv().await.unwrap();

        let mut app_wire = Vec::new();
        qwormhole_proto::encode_frame(b"hello", &mut app_wire);
        tokio::io::AsyncWriteExt::write_all(&mut client, &app_wire).await.unwrap();

        let (conn_id, message) = messages_rx.recv().await.unwrap();
        assert_eq!(conn_id, 1);
        assert_eq!(message.as_ref(), b"hello");

        drop(client);
        let outcome = driver.await.unwrap();
        assert_eq!(outcome.id, 1);
        assert!(!outcome.had_error);
    }
}
