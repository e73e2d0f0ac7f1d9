//! Edge dial: TLS connector and the connector seam
//!
//! The supervisor dials through the [`EdgeConnector`] trait so tests can
//! substitute in-memory transports. The production implementation is a
//! TCP + rustls client with webpki roots, optional custom roots, and an
//! insecure escape hatch for development against self-signed edges.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Edge dialing errors; all are transient from the supervisor's viewpoint.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Dials one transport to the edge. Called once per connection attempt.
#[async_trait]
pub trait EdgeConnector: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self) -> Result<Self::Io, ConnectError>;
}

/// TLS client configuration for the edge dial
#[derive(Debug, Clone)]
pub struct EdgeTlsConfig {
    /// `host:port` of the edge endpoint
    pub addr: String,
    /// Server name for SNI and certificate verification
    pub server_name: String,
    pub verify_server_cert: bool,
    /// DER-encoded roots overriding the webpki bundle when non-empty
    pub root_certs: Vec<Vec<u8>>,
    pub alpn_protocols: Vec<String>,
}

impl EdgeTlsConfig {
    pub fn new(addr: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            server_name: server_name.into(),
            verify_server_cert: true,
            root_certs: Vec::new(),
            alpn_protocols: vec!["edgelink-v1".to_string()],
        }
    }

    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.verify_server_cert = false;
        self
    }

    /// Add root certificates from a PEM bundle on disk.
    pub fn with_root_certs_from_pem(
        mut self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<Self, ConnectError> {
        let file = std::fs::File::open(path)?;
        let mut reader = std::io::BufReader::new(file);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert =
                cert.map_err(|err| ConnectError::Config(format!("Invalid PEM bundle: {err}")))?;
            self.root_certs.push(cert.to_vec());
        }
        Ok(self)
    }
}

/// Production connector: TCP dial wrapped in rustls.
pub struct TlsEdgeConnector {
    config: EdgeTlsConfig,
    connector: tokio_rustls::TlsConnector,
}

impl TlsEdgeConnector {
    pub fn new(config: EdgeTlsConfig) -> Result<Self, ConnectError> {
        ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();
        if config.root_certs.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert_der in &config.root_certs {
                roots
                    .add(rustls::pki_types::CertificateDer::from(cert_der.clone()))
                    .map_err(|err| ConnectError::Config(format!("Invalid root cert: {err}")))?;
            }
        }

        let mut client_crypto = if config.verify_server_cert {
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };
        client_crypto.alpn_protocols = config
            .alpn_protocols
            .iter()
            .map(|proto| proto.as_bytes().to_vec())
            .collect();

        Ok(Self {
            connector: tokio_rustls::TlsConnector::from(Arc::new(client_crypto)),
            config,
        })
    }
}

#[async_trait]
impl EdgeConnector for TlsEdgeConnector {
    type Io = tokio_rustls::client::TlsStream<TcpStream>;

    async fn connect(&self) -> Result<Self::Io, ConnectError> {
        let tcp = TcpStream::connect(&self.config.addr).await?;
        tcp.set_nodelay(true)?;

        let server_name = rustls::pki_types::ServerName::try_from(self.config.server_name.clone())
            .map_err(|err| ConnectError::Config(format!("Invalid server name: {err}")))?;
        let tls = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|err| ConnectError::Tls(err.to_string()))?;
        debug!(addr = %self.config.addr, "edge TLS connection established");
        Ok(tls)
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
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
            SignatureScheme::ED448,
        ]
    }
}
