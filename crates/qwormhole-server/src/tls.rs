//! TLS configuration and the plain/TLS socket union the framer writes to.
//!
//! Grounded in the teacher's QUIC `transport.rs`: load a PEM cert/key pair if
//! both paths are configured, otherwise fall back to a self-signed
//! certificate with a logged warning. Here the transport is TCP, optionally
//! wrapped in `tokio_rustls` rather than QUIC, so the listener accepts a
//! `TcpStream` and performs the TLS handshake itself when TLS is enabled.

use std::{
    path::Path,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::error::ServerError;

/// Either a plain TCP socket or a TLS-wrapped one, unified behind
/// `AsyncRead`/`AsyncWrite` so `BatchFramer<ServerStream>` never needs to
/// know which it has.
pub enum ServerStream {
    /// No TLS configured.
    Plain(TcpStream),
    /// TLS handshake completed.
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl ServerStream {
    /// The peer certificate fingerprint observed during the TLS handshake,
    /// if this is a TLS stream and the peer presented a certificate.
    ///
    /// Checked against a handshake payload's `tls_fingerprint256` tag
    /// (§4.G). Plain sockets never have one.
    #[must_use]
    pub fn peer_fingerprint(&self) -> Option<String> {
        match self {
            Self::Plain(_) => None,
            Self::Tls(stream) => {
                let (_, conn) = stream.get_ref();
                conn.peer_certificates().and_then(|certs| certs.first()).map(fingerprint_hex)
            },
        }
    }
}

fn fingerprint_hex(cert: &CertificateDer<'_>) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(cert.as_ref());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

impl AsyncRead for ServerStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Self::Plain(s) => s.is_write_vectored(),
            Self::Tls(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Shared TLS acceptor, built once at startup from a loaded cert/key pair or
/// a generated self-signed one.
#[derive(Clone)]
pub struct TlsState {
    acceptor: tokio_rustls::TlsAcceptor,
}

impl TlsState {
    /// Load `cert_path`/`key_path` if both are set, else generate a
    /// self-signed certificate for `localhost` and log a warning, exactly
    /// as the teacher's `generate_self_signed_config` does for its QUIC
    /// listener.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Tls`] if the PEM files are malformed or the
    /// resulting `rustls::ServerConfig` cannot be constructed.
    pub fn new(cert_path: Option<&Path>, key_path: Option<&Path>) -> Result<Self, ServerError> {
        let config = match (cert_path, key_path) {
            (Some(cert), Some(key)) => load_tls_config(cert, key)?,
            _ => generate_self_signed_config()?,
        };
        Ok(Self { acceptor: tokio_rustls::TlsAcceptor::from(Arc::new(config)) })
    }

    /// Perform the TLS server handshake over an accepted TCP socket.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Tls`] if the handshake fails.
    pub async fn accept(&self, socket: TcpStream) -> Result<ServerStream, ServerError> {
        let stream = self.acceptor.accept(socket).await.map_err(|e| ServerError::Tls(e.to_string()))?;
        Ok(ServerStream::Tls(Box::new(stream)))
    }
}

fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig, ServerError> {
    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| ServerError::Tls(format!("reading cert {}: {e}", cert_path.display())))?;
    let key_file = std::fs::File::open(key_path)
        .map_err(|e| ServerError::Tls(format!("reading key {}: {e}", key_path.display())))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::Tls(format!("parsing cert PEM: {e}")))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(|e| ServerError::Tls(format!("parsing key PEM: {e}")))?
        .ok_or_else(|| ServerError::Tls("no private key found in key file".to_string()))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))
}

fn generate_self_signed_config() -> Result<rustls::ServerConfig, ServerError> {
    tracing::warn!("using self-signed certificate - not for production use!");

    let generated = generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    let cert = CertificateDer::from(generated.cert.der().to_vec());
    let key = PrivateKeyDer::try_from(generated.signing_key.serialize_der())
        .map_err(|e| ServerError::Tls(e.to_string()))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| ServerError::Tls(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_config_builds_without_a_cert_path() {
        let state = TlsState::new(None, None);
        assert!(state.is_ok());
    }
}
