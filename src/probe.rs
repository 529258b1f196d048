//! Port reachability probes
//!
//! Best-effort client probes against `(host, port)` pairs. A closed, filtered
//! or unreachable port is a normal outcome, so neither probe returns an
//! error: each reports a plain `bool`, and a single deadline bounds the whole
//! attempt (DNS, connect and, for HTTPS, the handshake).

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::trace;

/// Default per-probe deadline
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempt a plain TCP connect to `host:port` within `timeout`.
///
/// The connection is closed straight away without exchanging data.
pub async fn probe_open(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            trace!(host, port, error = %e, "connect failed");
            false
        }
        Err(_) => {
            trace!(host, port, "connect timed out");
            false
        }
    }
}

/// Attempt a TLS handshake with `host:port` within `timeout`.
///
/// Certificates are not verified: any certificate, including self-signed
/// and expired ones, is accepted. Only handshake completion is checked.
pub async fn probe_https(host: &str, port: u16, timeout: Duration) -> bool {
    let Some(connector) = insecure_connector() else {
        return false;
    };
    let Ok(server_name) = ServerName::try_from(host.to_string()) else {
        trace!(host, "not a valid TLS server name");
        return false;
    };

    let handshake = async {
        let stream = TcpStream::connect((host, port)).await?;
        connector.connect(server_name, stream).await
    };

    match tokio::time::timeout(timeout, handshake).await {
        Ok(Ok(_tls)) => true,
        Ok(Err(e)) => {
            trace!(host, port, error = %e, "TLS handshake failed");
            false
        }
        Err(_) => {
            trace!(host, port, "TLS handshake timed out");
            false
        }
    }
}

fn insecure_connector() -> Option<TlsConnector> {
    let provider = Arc::new(aws_lc_rs::default_provider());
    let verifier = AcceptAnyServerCert::new(provider.clone());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .ok()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Some(TlsConnector::from(Arc::new(config)))
}

/// Certificate verifier that accepts every server certificate and signature
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Outcome of comparing an expected accessibility with a probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accessibility {
    /// Expected open and open
    AccessibleAsExpected,
    /// Expected closed and closed
    CorrectlyRestricted,
    /// Expected closed but open
    UnexpectedlyOpen,
    /// Expected open but closed
    UnexpectedlyClosed,
}

impl Accessibility {
    /// Whether the combination breaks the expectation
    pub fn is_violation(self) -> bool {
        matches!(
            self,
            Accessibility::UnexpectedlyOpen | Accessibility::UnexpectedlyClosed
        )
    }
}

/// Classify a probe outcome against what was expected
pub fn classify(expected_accessible: bool, open: bool) -> Accessibility {
    match (expected_accessible, open) {
        (true, true) => Accessibility::AccessibleAsExpected,
        (false, false) => Accessibility::CorrectlyRestricted,
        (false, true) => Accessibility::UnexpectedlyOpen,
        (true, false) => Accessibility::UnexpectedlyClosed,
    }
}
