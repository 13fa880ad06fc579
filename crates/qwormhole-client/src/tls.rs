//! Client-side TLS connector and the plain/TLS socket union the framer reads
//! from and writes to.
//!
//! Grounded in the teacher's QUIC client `transport.rs`: when no CA
//! certificate is configured, fall back to an insecure verifier that accepts
//! any certificate, with a logged warning — development posture only, same
//! as the teacher's `insecure_client_config`. When `ca_cert_path` is set, a
//! real root store is built from it instead.

use std::{
    path::Path,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use rustls::{
    DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::error::ClientError;

/// Either a plain TCP socket or a TLS-wrapped one, unified behind
/// `AsyncRead`/`AsyncWrite` so `BatchFramer<ClientStream>` never needs to
/// know which it has.
pub enum ClientStream {
    /// No TLS configured.
    Plain(TcpStream),
    /// TLS handshake completed.
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
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

/// Connect `socket` over TLS to `server_name`, verifying against
/// `ca_cert_path` if set, else accepting any certificate with a logged
/// warning.
///
/// # Errors
///
/// Returns [`ClientError::Tls`] if the CA file cannot be read/parsed, the
/// server name is invalid, or the handshake fails.
pub async fn connect_tls(
    socket: TcpStream,
    server_name: &str,
    ca_cert_path: Option<&Path>,
) -> Result<ClientStream, ClientError> {
    let config = match ca_cert_path {
        Some(path) => verified_client_config(path)?,
        None => {
            tracing::warn!("TLS enabled with no ca_cert_path - accepting any server certificate");
            insecure_client_config()
        },
    };

    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let name = ServerName::try_from(server_name.to_string()).map_err(|e| ClientError::Tls(e.to_string()))?;
    let stream = connector.connect(name, socket).await.map_err(|e| ClientError::Tls(e.to_string()))?;
    Ok(ClientStream::Tls(Box::new(stream)))
}

fn verified_client_config(ca_cert_path: &Path) -> Result<rustls::ClientConfig, ClientError> {
    let file = std::fs::File::open(ca_cert_path)
        .map_err(|e| ClientError::Tls(format!("reading CA cert {}: {e}", ca_cert_path.display())))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile_certs(std::io::BufReader::new(file))?;

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert).map_err(|e| ClientError::Tls(e.to_string()))?;
    }

    Ok(rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth())
}

fn rustls_pemfile_certs(mut reader: impl std::io::BufRead) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    rustls_pemfile::certs(&mut reader).collect::<Result<_, _>>().map_err(|e| ClientError::Tls(e.to_string()))
}

fn insecure_client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
        .with_no_client_auth()
}

/// Certificate verifier that accepts any certificate. Only reachable when
/// the caller configures TLS without a `ca_cert_path`; development posture,
/// mirroring the teacher's QUIC client.
#[derive(Debug)]
struct InsecureCertVerifier;

impl ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
