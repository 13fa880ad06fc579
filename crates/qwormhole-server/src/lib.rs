//! QWormhole TCP listener: accept loop, per-connection driver dispatch,
//! trust-snapshot emission, and optional TLS (component H).
//!
//! The listener itself is the only piece of this crate aware of
//! `tokio::net::TcpListener`; [`connection::drive_connection`] is generic
//! over the socket type so `qwormhole-harness` can drive the identical state
//! machine against `turmoil` sockets.

pub mod connection;
pub mod error;
pub mod tls;

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
pub use connection::{
    ConnectionConfig, ConnectionHandle, ConnectionOutcome, DEFAULT_MAX_BACKPRESSURE_BYTES, InboundMessage,
    ServerTelemetryEvent, TrustSnapshotSink,
};
pub use error::ServerError;
use qwormhole_core::{
    AdaptiveMode, FailedHandshakeLedger, HandshakeVerification, TokioEnvironment, TokioSchedulerTelemetry,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, RwLock, mpsc},
    task::JoinHandle,
};
pub use tls::{ServerStream, TlsState};
use tracing::{info, warn};

/// Default ceiling on concurrently accepted connections.
pub const DEFAULT_MAX_CLIENTS: usize = 1024;

/// Default window a failed-handshake remote key is remembered for.
const DEFAULT_FAILED_HANDSHAKE_TTL: Duration = Duration::from_secs(300);

/// Default cap on the failed-handshake ledger's size.
const DEFAULT_FAILED_HANDSHAKE_CAP: usize = 10_000;

/// Construction parameters for a [`Server`].
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind the listener to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrently accepted connections; further accepts are
    /// refused until one closes.
    pub max_clients: usize,
    /// PEM certificate path. TLS is enabled when this and `tls_key_path` are
    /// both set, or when `require_tls` is set (self-signed fallback).
    pub tls_cert_path: Option<PathBuf>,
    /// PEM private key path.
    pub tls_key_path: Option<PathBuf>,
    /// Force TLS on with a generated self-signed certificate when no cert
    /// pair is configured.
    pub require_tls: bool,
    /// Locally configured protocol version, exchanged in the handshake.
    pub protocol_version: Option<String>,
    /// How inbound handshake payloads are verified.
    pub handshake_verification: HandshakeVerification,
    /// `max_frame_length` enforced on every connection's decoder.
    pub max_frame_length: u32,
    /// `max_backpressure_bytes`: a connection exceeding this is torn down.
    pub max_backpressure_bytes: u64,
    /// Deferred-flush timer interval; `None` disables it.
    pub flush_interval_ms: Option<u64>,
    /// `idle_timeout_ms`: a connection is torn down after this long with no
    /// inbound bytes.
    pub idle_timeout_ms: Option<u64>,
    /// Overrides the peer-native default adaptive mode when set
    /// (`ADAPTIVE_SLICES`).
    pub adaptive_mode: Option<AdaptiveMode>,
    /// `FORCE_SLICE` override.
    pub forced_slice: Option<u32>,
    /// `FORCE_RATE_BYTES` override.
    pub forced_rate_bytes_per_sec: Option<u64>,
    /// How long a failed-handshake remote key is remembered.
    pub failed_handshake_ttl: Duration,
    /// Cap on the failed-handshake ledger's size.
    pub failed_handshake_cap: usize,
    /// Invoked exactly once per closed connection with its trust snapshot.
    pub trust_sink: Option<TrustSnapshotSink>,
    /// Invoked for coarse backpressure/drain telemetry across all
    /// connections.
    pub on_telemetry: Option<Arc<dyn Fn(ServerTelemetryEvent) + Send + Sync>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            max_clients: DEFAULT_MAX_CLIENTS,
            tls_cert_path: None,
            tls_key_path: None,
            require_tls: false,
            protocol_version: None,
            handshake_verification: HandshakeVerification::None,
            max_frame_length: qwormhole_proto::DEFAULT_MAX_FRAME_LENGTH,
            max_backpressure_bytes: DEFAULT_MAX_BACKPRESSURE_BYTES,
            flush_interval_ms: None,
            idle_timeout_ms: None,
            adaptive_mode: None,
            forced_slice: None,
            forced_rate_bytes_per_sec: None,
            failed_handshake_ttl: DEFAULT_FAILED_HANDSHAKE_TTL,
            failed_handshake_cap: DEFAULT_FAILED_HANDSHAKE_CAP,
            trust_sink: None,
            on_telemetry: None,
        }
    }
}

/// The accepting side of a QWormhole connection (component H).
///
/// Owns the listener's accept loop as a background task; connection drivers
/// run as their own spawned tasks and remove themselves from the live set on
/// close.
pub struct Server {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
    connections: Arc<RwLock<HashMap<u64, ConnectionHandle>>>,
    messages_rx: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
}

impl Server {
    /// Bind the listener and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound, or
    /// [`ServerError::Tls`] if TLS is configured and the certificate/key
    /// cannot be loaded or generated.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| ServerError::Bind { addr: config.bind_addr.to_string(), source: e })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind { addr: config.bind_addr.to_string(), source: e })?;

        let tls = if config.tls_cert_path.is_some() || config.tls_key_path.is_some() || config.require_tls {
            Some(TlsState::new(config.tls_cert_path.as_deref(), config.tls_key_path.as_deref())?)
        } else {
            None
        };

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let connections: Arc<RwLock<HashMap<u64, ConnectionHandle>>> = Arc::new(RwLock::new(HashMap::new()));
        let next_id = Arc::new(AtomicU64::new(1));
        let ledger = Arc::new(Mutex::new(FailedHandshakeLedger::<TokioEnvironment>::new(
            config.failed_handshake_ttl,
            config.failed_handshake_cap,
        )));

        let (telemetry_tx, mut telemetry_rx) = mpsc::unbounded_channel();
        let on_telemetry = config.on_telemetry.clone();
        tokio::spawn(async move {
            while let Some(event) = telemetry_rx.recv().await {
                if let Some(cb) = &on_telemetry {
                    cb(event);
                }
            }
        });

        info!(%local_addr, tls = tls.is_some(), "qwormhole listener bound");

        let accept_task = tokio::spawn(accept_loop(
            listener,
            tls,
            config.clone(),
            Arc::clone(&connections),
            next_id,
            messages_tx,
            config.trust_sink.clone(),
            telemetry_tx,
            ledger,
            shutdown_rx,
        ));

        Ok(Self { local_addr, accept_task, shutdown_tx, connections, messages_rx: Mutex::new(messages_rx) })
    }

    /// The address actually bound (resolves `:0` to the assigned port).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive the next inbound application message from any connection.
    /// Resolves to `None` once every connection has closed and the accept
    /// loop has stopped.
    pub async fn recv_message(&self) -> Option<InboundMessage> {
        self.messages_rx.lock().await.recv().await
    }

    /// Send `payload` to a specific connection. Returns `false` if no
    /// connection with that id is currently live.
    pub async fn send_to(&self, id: u64, payload: Bytes) -> bool {
        if let Some(handle) = self.connections.read().await.get(&id) {
            handle.send(payload);
            true
        } else {
            false
        }
    }

    /// Send `payload` to every currently live connection.
    pub async fn broadcast(&self, payload: Bytes) {
        for handle in self.connections.read().await.values() {
            handle.send(payload.clone());
        }
    }

    /// Number of currently live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Stop accepting new connections and wait for the accept loop to exit.
    /// Already-accepted connections are left to drain on their own (peer
    /// close or idle timeout); this only stops new intake.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.accept_task.await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsState>,
    config: ServerConfig,
    connections: Arc<RwLock<HashMap<u64, ConnectionHandle>>>,
    next_id: Arc<AtomicU64>,
    messages_tx: mpsc::UnboundedSender<InboundMessage>,
    trust_sink: Option<TrustSnapshotSink>,
    telemetry_tx: mpsc::UnboundedSender<ServerTelemetryEvent>,
    ledger: Arc<Mutex<FailedHandshakeLedger<TokioEnvironment>>>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                info!("accept loop shutting down");
                break;
            },

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((socket, remote_addr)) => {
                        if connections.read().await.len() >= config.max_clients {
                            warn!(%remote_addr, "rejecting connection: max_clients reached");
                            drop(socket);
                            continue;
                        }
                        spawn_connection(
                            socket,
                            remote_addr,
                            tls.clone(),
                            &config,
                            Arc::clone(&connections),
                            next_id.fetch_add(1, Ordering::Relaxed),
                            messages_tx.clone(),
                            trust_sink.clone(),
                            telemetry_tx.clone(),
                            Arc::clone(&ledger),
                        );
                    },
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            },
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_connection(
    socket: TcpStream,
    remote_addr: SocketAddr,
    tls: Option<TlsState>,
    config: &ServerConfig,
    connections: Arc<RwLock<HashMap<u64, ConnectionHandle>>>,
    id: u64,
    messages_tx: mpsc::UnboundedSender<InboundMessage>,
    trust_sink: Option<TrustSnapshotSink>,
    telemetry_tx: mpsc::UnboundedSender<ServerTelemetryEvent>,
    ledger: Arc<Mutex<FailedHandshakeLedger<TokioEnvironment>>>,
) {
    let remote = remote_addr.to_string();
    let conn_config = ConnectionConfig {
        max_frame_length: config.max_frame_length,
        protocol_version: config.protocol_version.clone(),
        handshake_verification: config.handshake_verification.clone(),
        max_backpressure_bytes: config.max_backpressure_bytes,
        emit_handshake_messages: false,
        adaptive_mode: config.adaptive_mode,
        forced_slice: config.forced_slice,
        forced_rate_bytes_per_sec: config.forced_rate_bytes_per_sec,
        use_writev: true,
        flush_interval_ms: config.flush_interval_ms,
        idle_timeout_ms: config.idle_timeout_ms,
    };

    tokio::spawn(async move {
        let (stream, fingerprint) = match tls {
            Some(tls_state) => match tls_state.accept(socket).await {
                Ok(stream) => {
                    let fingerprint = stream.peer_fingerprint();
                    (stream, fingerprint)
                },
                Err(e) => {
                    warn!(error = %e, %remote_addr, "TLS handshake failed");
                    return;
                },
            },
            None => (ServerStream::Plain(socket), None),
        };

        let (handle_tx, mut handle_rx) = mpsc::unbounded_channel();
        let connections_for_insert = Arc::clone(&connections);
        tokio::spawn(async move {
            if let Some(handle) = handle_rx.recv().await {
                connections_for_insert.write().await.insert(id, handle);
            }
        });

        let outcome = connection::drive_connection(
            id,
            remote,
            stream,
            conn_config,
            TokioEnvironment,
            TokioSchedulerTelemetry::default(),
            fingerprint,
            ledger,
            messages_tx,
            handle_tx,
            trust_sink,
            Some(telemetry_tx),
        )
        .await;

        connections.write().await.remove(&id);
        info!(id, had_error = outcome.had_error, "connection closed");
    });
}
