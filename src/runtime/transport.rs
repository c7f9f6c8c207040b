//! Plaintext and TLS transports.
//!
//! Both are split into a boxed read half and a boxed write half so the
//! session and protocol layers never see which one they are running on.
//! TLS transports complete their handshake before either half is handed out.

use crate::error::{TlsError, TransportError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::info;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Which kind of transport a session runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Plain,
    Tls,
}

/// An established transport, ready to carry application data.
pub struct Transport {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub kind: TransportKind,
}

impl Transport {
    /// Wrap a plaintext TCP stream.
    pub fn plain(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            kind: TransportKind::Plain,
        }
    }

    /// Run the server-side TLS handshake on `stream`.
    ///
    /// Handshake failure is fatal for this connection only.
    pub async fn tls(
        stream: TcpStream,
        acceptor: &TlsAcceptor,
        handshake_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let tls = tokio::time::timeout(handshake_timeout, acceptor.accept(stream))
            .await
            .map_err(|_| TransportError::HandshakeTimeout(handshake_timeout))?
            .map_err(TransportError::Handshake)?;
        Ok(Self::from_io(tls, TransportKind::Tls))
    }

    /// Wrap any duplex byte stream, e.g. an in-memory pipe or a client TLS stream.
    pub fn from_io<S>(io: S, kind: TransportKind) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            kind,
        }
    }
}

/// Build a TLS acceptor from PEM certificate chain and private key files.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let cert_pem = std::fs::read(cert_path).map_err(|source| TlsError::Read {
        path: cert_path.to_path_buf(),
        source,
    })?;
    let key_pem = std::fs::read(key_path).map_err(|source| TlsError::Read {
        path: key_path.to_path_buf(),
        source,
    })?;

    let mut reader = &cert_pem[..];
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.to_path_buf()));
    }

    let mut reader = &key_pem[..];
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

    let acceptor = tls_acceptor(certs, key)?;
    info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "TLS configured"
    );
    Ok(acceptor)
}

/// Build a TLS acceptor from an in-memory certificate chain and key.
pub fn tls_acceptor(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<TlsAcceptor, TlsError> {
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
