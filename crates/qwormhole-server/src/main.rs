//! QWormhole listener CLI: binds a TCP (optionally TLS) listener, logs each
//! accepted connection's trust snapshot on close, and echoes every inbound
//! application message back to its sender.

use std::{net::SocketAddr, path::PathBuf, process::ExitCode};

use clap::{Parser, ValueEnum};
use qwormhole_core::HandshakeVerification;
use qwormhole_server::{Server, ServerConfig, ServerTelemetryEvent};
use tracing_subscriber::EnvFilter;

/// Which handshake verification policy the listener enforces.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum VerificationArg {
    /// Accept any syntactically valid handshake payload.
    None,
    /// Require the signed-negentropic hash/signature fields (§6).
    SignedNegentropic,
}

#[derive(Debug, Parser)]
#[command(name = "qwormhole-server", about = "QWormhole length-prefixed transport listener")]
struct Cli {
    /// Address to bind, e.g. 0.0.0.0:7800.
    #[arg(long, default_value = "127.0.0.1:7800")]
    bind: SocketAddr,

    /// Maximum concurrently accepted connections.
    #[arg(long, default_value_t = qwormhole_server::DEFAULT_MAX_CLIENTS)]
    max_clients: usize,

    /// PEM certificate path; enables TLS together with `--tls-key`.
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// PEM private key path.
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Force TLS on, generating a self-signed certificate if no cert/key is
    /// configured.
    #[arg(long)]
    require_tls: bool,

    /// Protocol version string exchanged in the handshake.
    #[arg(long)]
    protocol_version: Option<String>,

    /// Handshake verification policy.
    #[arg(long, value_enum, default_value = "none")]
    verification: VerificationArg,

    /// Deferred-flush timer interval in milliseconds; omit to disable.
    #[arg(long)]
    flush_interval_ms: Option<u64>,

    /// Tear down a connection after this many idle milliseconds.
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// Pin every connection's outbound slice size, bypassing adaptive drift.
    #[arg(long)]
    forced_slice: Option<u32>,
}

impl Cli {
    fn into_server_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            max_clients: self.max_clients,
            tls_cert_path: self.tls_cert,
            tls_key_path: self.tls_key,
            require_tls: self.require_tls,
            protocol_version: self.protocol_version,
            handshake_verification: match self.verification {
                VerificationArg::None => HandshakeVerification::None,
                VerificationArg::SignedNegentropic => HandshakeVerification::SignedNegentropic,
            },
            flush_interval_ms: self.flush_interval_ms,
            idle_timeout_ms: self.idle_timeout_ms,
            forced_slice: self.forced_slice,
            on_telemetry: Some(std::sync::Arc::new(|event: ServerTelemetryEvent| {
                tracing::debug!(?event, "connection telemetry");
            })),
            trust_sink: Some(std::sync::Arc::new(|snapshot| {
                Box::pin(async move {
                    tracing::info!(
                        remote = %snapshot.remote,
                        reason = ?snapshot.reason,
                        trust_level = ?snapshot.policy_trust_level,
                        total_bytes = snapshot.batch_stats.total_bytes,
                        total_frames = snapshot.batch_stats.total_frames,
                        "connection trust snapshot",
                    );
                })
            })),
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = cli.into_server_config();

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to start listener");
            return ExitCode::FAILURE;
        },
    };
    tracing::info!(addr = %server.local_addr(), "listening");

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                server.shutdown().await;
                return ExitCode::SUCCESS;
            },

            message = server.recv_message() => {
                match message {
                    Some((id, payload)) => {
                        tracing::debug!(id, bytes = payload.len(), "echoing inbound message");
                        server.send_to(id, payload).await;
                    },
                    None => return ExitCode::SUCCESS,
                }
            },
        }
    }
}
