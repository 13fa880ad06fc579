//! Client lifecycle driver (component I): connect, reconnect with backoff,
//! heartbeat, and the same handshake/framer/flow-controller machinery the
//! server drives, run from the connecting side instead of the accepting
//! one.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    pin::Pin,
    time::Duration,
};

use bytes::Bytes;
use qwormhole_core::{
    AdaptiveMode, BatchFramer, BatchFramerConfig, CloseReason, ControllerState, Environment, FailedHandshakeLedger,
    FlowController, FlowControllerConfig, FramerEvent, HandshakeConfig, HandshakeOutcome, HandshakeVerification,
    PRIORITY_DEFAULT, PRIORITY_HANDSHAKE, PRIORITY_HEARTBEAT, PriorityQueue, SchedulerTelemetry, SnapshotDirection,
    TokioEnvironment, TokioSchedulerTelemetry, TrustSnapshot,
};
use qwormhole_proto::{HandshakePayload, derive_session_flow_policy_from_metrics};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::{TcpSocket, TcpStream},
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::Sleep,
};

use crate::{
    error::ClientError,
    event::ClientEvent,
    tls::{ClientStream, connect_tls},
};

const READ_BUF_SIZE: usize = 64 * 1024;
const FAILED_HANDSHAKE_TTL: Duration = Duration::from_secs(300);
const FAILED_HANDSHAKE_CAP: usize = 1_000;

/// TLS settings for a client connection.
#[derive(Clone)]
pub struct ClientTlsConfig {
    /// Server name presented for SNI and certificate-name validation.
    pub server_name: String,
    /// CA certificate used to validate the server's certificate. When
    /// unset, any certificate is accepted (development posture).
    pub ca_cert_path: Option<PathBuf>,
}

/// Exponential-backoff reconnect policy (§4.I).
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    /// Whether a non-user-initiated close triggers a reconnect attempt.
    pub enabled: bool,
    /// Delay before the first reconnect attempt.
    pub initial_delay_ms: u64,
    /// Delay ceiling; `initial_delay_ms * multiplier^(attempt-1)` is capped
    /// here.
    pub max_delay_ms: u64,
    /// Backoff growth factor applied per attempt.
    pub multiplier: f64,
    /// Give up after this many consecutive failed attempts. `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { enabled: false, initial_delay_ms: 100, max_delay_ms: 10_000, multiplier: 2.0, max_attempts: None }
    }
}

/// Construction parameters for a [`Client`].
#[derive(Clone)]
pub struct ClientConfig {
    /// `host:port` to resolve and connect to.
    pub remote_addr: String,
    /// Local address to bind before connecting.
    pub local_address: Option<IpAddr>,
    /// Local port to bind before connecting.
    pub local_port: Option<u16>,
    /// Network interface to bind the socket to (Linux/Android/Fuchsia
    /// only); `INTERFACE_NOT_FOUND` elsewhere or if binding fails.
    pub interface_name: Option<String>,
    /// Aborts a pending connect after this long. `None` waits indefinitely.
    pub connect_timeout_ms: Option<u64>,
    /// Locally configured protocol version, exchanged in the handshake.
    pub protocol_version: Option<String>,
    /// How the peer's handshake payload is verified.
    pub handshake_verification: HandshakeVerification,
    /// TLS settings; `None` connects in plaintext.
    pub tls: Option<ClientTlsConfig>,
    /// Reconnect policy applied after a non-user-initiated close.
    pub reconnect: ReconnectConfig,
    /// Heartbeat period; `None` disables heartbeats.
    pub heartbeat_interval_ms: Option<u64>,
    /// Heartbeat payload; defaults to `{"type":"ping","ts":<now>}` when
    /// unset (the timestamp is filled in at send time).
    pub heartbeat_payload: Option<Bytes>,
    /// `max_frame_length` enforced on the inbound decoder.
    pub max_frame_length: u32,
    /// `max_backpressure_bytes`: destroys the connection when exceeded.
    pub max_backpressure_bytes: u64,
    /// Deferred-flush timer interval; `None` disables it.
    pub flush_interval_ms: Option<u64>,
    /// `idle_timeout_ms`: the connection is torn down after this long with
    /// no inbound bytes.
    pub idle_timeout_ms: Option<u64>,
    /// Overrides the peer-native default adaptive mode when set.
    pub adaptive_mode: Option<AdaptiveMode>,
    /// `FORCE_SLICE` / explicit pin.
    pub forced_slice: Option<u32>,
    /// `FORCE_RATE_BYTES` / explicit pin.
    pub forced_rate_bytes_per_sec: Option<u64>,
    /// Whether to use vectored writes when a flush batch holds two or more
    /// buffers.
    pub use_writev: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_addr: String::new(),
            local_address: None,
            local_port: None,
            interface_name: None,
            connect_timeout_ms: None,
            protocol_version: None,
            handshake_verification: HandshakeVerification::None,
            tls: None,
            reconnect: ReconnectConfig::default(),
            heartbeat_interval_ms: None,
            heartbeat_payload: None,
            max_frame_length: qwormhole_proto::DEFAULT_MAX_FRAME_LENGTH,
            max_backpressure_bytes: DEFAULT_MAX_BACKPRESSURE_BYTES,
            flush_interval_ms: None,
            idle_timeout_ms: None,
            adaptive_mode: None,
            forced_slice: None,
            forced_rate_bytes_per_sec: None,
            use_writev: true,
        }
    }
}

/// Default cap on queued-but-unflushed outbound bytes before backpressure
/// kicks in, matching the listener side's default.
const DEFAULT_MAX_BACKPRESSURE_BYTES: u64 = 5 * 1024 * 1024;

/// A running client connection (component I). Spawns a background task that
/// owns the reconnect loop; dropped without calling [`Client::disconnect`]
/// the task keeps running detached (send/event channels close once it
/// exits).
pub struct Client {
    outbound: mpsc::UnboundedSender<Bytes>,
    events: Mutex<mpsc::UnboundedReceiver<ClientEvent>>,
    disconnect_tx: mpsc::Sender<()>,
    driver: JoinHandle<()>,
}

impl Client {
    /// Start the client's background driver task.
    #[must_use]
    pub fn spawn(config: ClientConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);

        let driver = tokio::spawn(run(config, events_tx, outbound_rx, disconnect_rx));

        Self { outbound: outbound_tx, events: Mutex::new(events_rx), disconnect_tx, driver }
    }

    /// Enqueue `payload` for delivery at [`PRIORITY_DEFAULT`]. Silently
    /// dropped if no connection is currently live; the caller observes this
    /// via a [`ClientEvent::Close`] instead of a per-send error.
    pub fn send(&self, payload: Bytes) {
        let _ = self.outbound.send(payload);
    }

    /// Receive the next lifecycle event. Resolves to `None` once the
    /// driver task has exited (reconnect exhausted, or after
    /// [`Client::disconnect`]).
    pub async fn next_event(&self) -> Option<ClientEvent> {
        self.events.lock().await.recv().await
    }

    /// User-initiated close: stop heartbeat/reconnect, detach the framer,
    /// and end the socket, emitting a final close event with
    /// `had_error = false`.
    pub async fn disconnect(self) {
        let _ = self.disconnect_tx.send(()).await;
        let _ = self.driver.await;
    }
}

/// How a single connect-and-drive attempt ended.
enum AttemptOutcome {
    UserDisconnected,
    Closed { had_error: bool },
    ConnectFailed(ClientError),
}

async fn run(
    config: ClientConfig,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    mut disconnect_rx: mpsc::Receiver<()>,
) {
    let env = TokioEnvironment;
    let telemetry = TokioSchedulerTelemetry::default();
    let ledger = Mutex::new(FailedHandshakeLedger::<TokioEnvironment>::new(FAILED_HANDSHAKE_TTL, FAILED_HANDSHAKE_CAP));
    let mut attempt: u32 = 0;

    'reconnect: loop {
        let outcome = tokio::select! {
            biased;
            _ = disconnect_rx.recv() => AttemptOutcome::UserDisconnected,
            outcome = run_attempt(&config, &env, &telemetry, &ledger, &events_tx, &mut outbound_rx, &mut disconnect_rx, &mut attempt) => outcome,
        };

        match outcome {
            AttemptOutcome::UserDisconnected => break 'reconnect,
            AttemptOutcome::Closed { had_error: _ } => {
                if !config.reconnect.enabled {
                    break 'reconnect;
                }
            },
            AttemptOutcome::ConnectFailed(err) => {
                if !config.reconnect.enabled {
                    let _ = events_tx.send(ClientEvent::Error(err.to_string()));
                    break 'reconnect;
                }
            },
        }

        attempt += 1;
        if let Some(max) = config.reconnect.max_attempts
            && attempt > max
        {
            let _ = events_tx.send(ClientEvent::Error("reconnect attempts exhausted".to_string()));
            break 'reconnect;
        }
        let delay = backoff_delay(&config.reconnect, attempt);
        let _ = events_tx.send(ClientEvent::Reconnecting { attempt, delay });
        tokio::select! {
            biased;
            _ = disconnect_rx.recv() => break 'reconnect,
            () = tokio::time::sleep(delay) => {},
        }
    }
}

fn backoff_delay(reconnect: &ReconnectConfig, attempt: u32) -> Duration {
    #[allow(clippy::cast_precision_loss)]
    let scaled = reconnect.initial_delay_ms as f64 * reconnect.multiplier.powi(attempt as i32 - 1);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let capped = scaled.min(reconnect.max_delay_ms as f64).max(0.0) as u64;
    Duration::from_millis(capped)
}

#[allow(clippy::too_many_arguments)]
async fn run_attempt(
    config: &ClientConfig,
    env: &TokioEnvironment,
    telemetry: &TokioSchedulerTelemetry,
    ledger: &Mutex<FailedHandshakeLedger<TokioEnvironment>>,
    events_tx: &mpsc::UnboundedSender<ClientEvent>,
    outbound_rx: &mut mpsc::UnboundedReceiver<Bytes>,
    disconnect_rx: &mut mpsc::Receiver<()>,
    attempt: &mut u32,
) -> AttemptOutcome {
    let stream = match connect(config).await {
        Ok(stream) => stream,
        Err(e) => return AttemptOutcome::ConnectFailed(e),
    };
    *attempt = 0;
    let _ = events_tx.send(ClientEvent::Connect);

    drive(config, stream, env, telemetry, ledger, events_tx, outbound_rx, disconnect_rx).await
}

async fn connect(config: &ClientConfig) -> Result<ClientStream, ClientError> {
    let addr: SocketAddr = tokio::net::lookup_host(&config.remote_addr)
        .await
        .map_err(ClientError::Connect)?
        .next()
        .ok_or_else(|| ClientError::Connect(std::io::Error::other("no addresses resolved")))?;

    let connect_fut = tcp_connect(config, addr);
    let tcp = match config.connect_timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), connect_fut)
            .await
            .map_err(|_| ClientError::ConnectTimeout(Duration::from_millis(ms)))??,
        None => connect_fut.await?,
    };

    match &config.tls {
        Some(tls) => connect_tls(tcp, &tls.server_name, tls.ca_cert_path.as_deref()).await,
        None => Ok(ClientStream::Plain(tcp)),
    }
}

async fn tcp_connect(config: &ClientConfig, addr: SocketAddr) -> Result<TcpStream, ClientError> {
    let socket = if addr.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }.map_err(ClientError::Connect)?;

    if let Some(name) = &config.interface_name {
        bind_device(&socket, name)?;
    }

    if config.local_address.is_some() || config.local_port.is_some() {
        let local = SocketAddr::new(
            config.local_address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            config.local_port.unwrap_or(0),
        );
        socket.bind(local).map_err(ClientError::Connect)?;
    }

    socket.connect(addr).await.map_err(ClientError::Connect)
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
fn bind_device(socket: &TcpSocket, name: &str) -> Result<(), ClientError> {
    socket.bind_device(Some(name.as_bytes())).map_err(|_| ClientError::InterfaceNotFound(name.to_string()))
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
fn bind_device(_socket: &TcpSocket, name: &str) -> Result<(), ClientError> {
    Err(ClientError::InterfaceNotFound(name.to_string()))
}

async fn wait_deferred(timer: &mut Option<Pin<Box<Sleep>>>) {
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

#[allow(clippy::too_many_arguments)]
async fn drive(
    config: &ClientConfig,
    socket: ClientStream,
    env: &TokioEnvironment,
    telemetry: &TokioSchedulerTelemetry,
    ledger: &Mutex<FailedHandshakeLedger<TokioEnvironment>>,
    events_tx: &mpsc::UnboundedSender<ClientEvent>,
    outbound_rx: &mut mpsc::UnboundedReceiver<Bytes>,
    disconnect_rx: &mut mpsc::Receiver<()>,
) -> AttemptOutcome {
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

    let handshake_config = HandshakeConfig {
        protocol_version: config.protocol_version.clone(),
        verification: config.handshake_verification.clone(),
        observed_tls_fingerprint: None,
    };

    let mut outbound_queue: PriorityQueue<Bytes> = PriorityQueue::new();
    if config.protocol_version.is_some() || !matches!(config.handshake_verification, HandshakeVerification::None) {
        let handshake = HandshakePayload::new(config.protocol_version.clone());
        if let Ok(bytes) = handshake.to_json_bytes() {
            outbound_queue.enqueue(Bytes::from(bytes), PRIORITY_HANDSHAKE);
        }
    }

    let mut controller: Option<FlowController<TokioEnvironment>> = None;
    let mut handshake_pending = true;
    let mut outcome_handshake: Option<HandshakeOutcome> = None;
    let mut had_error = false;
    let flush_interval = config.flush_interval_ms.filter(|ms| *ms > 0).map(Duration::from_millis);
    let mut deferred_flush: Option<Pin<Box<Sleep>>> = None;
    let mut heartbeat_timer: Option<Pin<Box<Sleep>>> = None;
    let mut read_buf = vec![0u8; READ_BUF_SIZE];

    drain_handshake_queue(&mut outbound_queue, &mut framer).await;
    let _ = events_tx.send(ClientEvent::Ready);

    let exit = 'driver: loop {
        if deferred_flush.is_none()
            && let Some(interval) = flush_interval
            && controller.as_ref().is_some_and(|c| c.state() == ControllerState::Batching)
        {
            deferred_flush = Some(Box::pin(tokio::time::sleep(interval)));
        }
        if heartbeat_timer.is_none()
            && let Some(ms) = config.heartbeat_interval_ms
            && !handshake_pending
        {
            heartbeat_timer = Some(Box::pin(tokio::time::sleep(Duration::from_millis(ms))));
        }
        let idle_deadline = config.idle_timeout_ms.map(|ms| tokio::time::sleep(Duration::from_millis(ms)));

        tokio::select! {
            biased;

            _ = disconnect_rx.recv() => {
                break 'driver LoopExit::UserDisconnected;
            },

            read_result = read_half.read(&mut read_buf) => {
                match read_result {
                    Ok(0) => break 'driver LoopExit::Done,
                    Ok(n) => {
                        if framer.push_inbound(&read_buf[..n]).is_err() {
                            had_error = true;
                            break 'driver LoopExit::Done;
                        }
                    },
                    Err(_) => {
                        had_error = true;
                        break 'driver LoopExit::Done;
                    },
                }
            },

            Some(payload) = outbound_rx.recv() => {
                outbound_queue.enqueue(payload, PRIORITY_DEFAULT);
                if !handshake_pending {
                    drain_application_queue(&mut outbound_queue, &mut controller, &mut framer, env, telemetry).await;
                }
            },

            Some(event) = framer_events_rx.recv() => {
                match event {
                    FramerEvent::Message(payload) => {
                        if handshake_pending {
                            let mut ledger_guard = ledger.lock().await;
                            match qwormhole_core::process_handshake(&payload, &handshake_config, &config.remote_addr, &mut ledger_guard, env).await {
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
                                    controller = Some(new_controller);
                                    outcome_handshake = Some(resolved);
                                    drain_application_queue(&mut outbound_queue, &mut controller, &mut framer, env, telemetry).await;
                                },
                                Err(_) => {
                                    had_error = true;
                                    break 'driver LoopExit::Done;
                                },
                            }
                        } else {
                            let _ = events_tx.send(ClientEvent::Message(payload));
                        }
                    },
                    FramerEvent::Backpressure { queued_bytes } => {
                        if let Some(c) = controller.as_mut() {
                            c.on_backpressure();
                        }
                        let _ = events_tx.send(ClientEvent::Backpressure);
                        if queued_bytes > config.max_backpressure_bytes {
                            had_error = true;
                            break 'driver LoopExit::Done;
                        }
                    },
                    FramerEvent::Drain => {
                        if let Some(c) = controller.as_mut() {
                            c.on_drain();
                        }
                        let _ = events_tx.send(ClientEvent::Drain);
                    },
                    FramerEvent::Flush { .. } => {},
                    FramerEvent::Error(_) => {
                        had_error = true;
                        break 'driver LoopExit::Done;
                    },
                }
            },

            () = wait_deferred(&mut deferred_flush) => {
                deferred_flush = None;
                if let Some(c) = controller.as_mut() {
                    let _ = c.force_flush(&mut framer, env, telemetry).await;
                }
            },

            () = wait_deferred(&mut heartbeat_timer) => {
                heartbeat_timer = None;
                let payload = config.heartbeat_payload.clone().unwrap_or_else(default_heartbeat_payload);
                outbound_queue.enqueue(payload, PRIORITY_HEARTBEAT);
                drain_application_queue(&mut outbound_queue, &mut controller, &mut framer, env, telemetry).await;
            },

            () = wait_optional(idle_deadline) => {
                break 'driver LoopExit::Done;
            },
        }
    };

    if let Some(c) = controller.as_mut() {
        let _ = c.force_flush(&mut framer, env, telemetry).await;
    }

    let user_disconnected = matches!(exit, LoopExit::UserDisconnected);
    let final_had_error = !user_disconnected && (had_error || handshake_pending);

    let snapshot =
        build_trust_snapshot(&config.remote_addr, outcome_handshake.as_ref(), controller.as_ref(), &mut framer, final_had_error)
            .await;
    let _ = events_tx.send(ClientEvent::Close { had_error: final_had_error, snapshot });

    if user_disconnected {
        AttemptOutcome::UserDisconnected
    } else {
        AttemptOutcome::Closed { had_error: final_had_error }
    }
}

/// Why the driver loop terminated, before the caller applies §4.I close
/// classification and reconnect policy.
enum LoopExit {
    /// A read returned EOF, or an error/backpressure-limit condition fired.
    Done,
    /// The caller invoked [`Client::disconnect`].
    UserDisconnected,
}

fn default_heartbeat_payload() -> Bytes {
    Bytes::from_static(br#"{"type":"ping"}"#)
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
        direction: SnapshotDirection::Client,
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
