//! TLS for the control channel.
//!
//! Every instance of the tool carries the same self-signed certificate and
//! key. Servers present it; clients accept a server only if it presents that
//! exact certificate (SHA-256 fingerprint match), so trust comes from
//! possessing the embedded pair rather than from a CA.

use crate::error::{VpnError, VpnResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

const EMBEDDED_CERT_PEM: &[u8] = include_bytes!("../../certs/tunnel.crt");
const EMBEDDED_KEY_PEM: &[u8] = include_bytes!("../../certs/tunnel.key");

/// SNI name matching the embedded certificate's subjectAltName.
pub const SERVER_NAME: &str = "kubetun.local";

/// Ensure rustls crypto provider is installed.
/// This must be called before using any rustls functionality.
pub fn ensure_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn embedded_certs() -> VpnResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &EMBEDDED_CERT_PEM[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| VpnError::tls_with_source("Failed to parse embedded certificate", e))?;
    if certs.is_empty() {
        return Err(VpnError::config("embedded certificate bundle is empty"));
    }
    Ok(certs)
}

fn embedded_key() -> VpnResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &EMBEDDED_KEY_PEM[..])
        .map_err(|e| VpnError::tls_with_source("Failed to parse embedded key", e))?
        .ok_or_else(|| VpnError::config("embedded key bundle has no private key"))
}

/// Server-side TLS configuration presenting the embedded certificate.
pub fn server_config() -> VpnResult<Arc<rustls::ServerConfig>> {
    ensure_crypto_provider();
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(embedded_certs()?, embedded_key()?)
        .map_err(|e| VpnError::tls_with_source("Invalid TLS server config", e))?;
    Ok(Arc::new(config))
}

/// Client-side TLS configuration pinned to the embedded certificate.
pub fn client_config() -> VpnResult<Arc<rustls::ClientConfig>> {
    ensure_crypto_provider();
    let certs = embedded_certs()?;
    let verifier = FingerprintVerifier::new(&cert_fingerprint_hex(certs[0].as_ref()));
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Acceptor for TLS-wrapped TCP listeners.
pub fn acceptor() -> VpnResult<TlsAcceptor> {
    Ok(TlsAcceptor::from(server_config()?))
}

/// Connector for TLS-wrapped TCP dials.
pub fn connector() -> VpnResult<TlsConnector> {
    Ok(TlsConnector::from(client_config()?))
}

/// Server name presented in the client hello.
pub fn server_name() -> VpnResult<ServerName<'static>> {
    ServerName::try_from(SERVER_NAME)
        .map_err(|e| VpnError::tls_with_source("Invalid TLS server name", e))
}

fn cert_fingerprint_hex(cert_der: &[u8]) -> String {
    let digest = Sha256::digest(cert_der);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[derive(Debug)]
struct FingerprintVerifier {
    expected: String,
    crypto: Arc<rustls::crypto::CryptoProvider>,
}

impl FingerprintVerifier {
    fn new(expected: &str) -> Arc<Self> {
        let crypto = rustls::crypto::aws_lc_rs::default_provider();
        Arc::new(Self {
            expected: expected.to_lowercase(),
            crypto: Arc::new(crypto),
        })
    }

    fn matches(&self, cert: &CertificateDer<'_>) -> bool {
        cert_fingerprint_hex(cert.as_ref()) == self.expected
    }
}

impl rustls::client::danger::ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        if !self.matches(end_entity) {
            return Err(rustls::Error::General(
                "peer certificate is not the embedded tunnel certificate".into(),
            ));
        }
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.crypto
            .signature_verification_algorithms
            .supported_schemes()
    }
}
