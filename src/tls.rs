//! TLS configuration helpers for the EST server.
//!
//! This module loads the server identity, builds the rustls
//! [`ServerConfig`] used by the listener, and provides the client
//! certificate verifier that hands peer certificates to the core.

use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme,
};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::TlsConfig;
use crate::error::{EstError, Result};

// Minimum TLS version required by RFC 7030.
//
// RFC 7030 Section 3.3.1 states: "TLS 1.1 [RFC4346] (or a later version) MUST be used"
// We use TLS 1.2 as the minimum since TLS 1.1 is deprecated.
static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Build the rustls server configuration for the EST listener.
///
/// With `client_root` set, client certificate chains are verified during
/// the handshake against that root instead of being deferred to the core.
pub fn build_server_config(
    config: &TlsConfig,
    client_root: Option<&[u8]>,
) -> Result<Arc<ServerConfig>> {
    let cert_pem = std::fs::read(&config.cert_file).map_err(|e| {
        EstError::tls(format!("Failed to read {}: {}", config.cert_file.display(), e))
    })?;
    let key_pem = std::fs::read(&config.key_file).map_err(|e| {
        EstError::tls(format!("Failed to read {}: {}", config.key_file.display(), e))
    })?;

    let certs = parse_pem_certificates(&cert_pem)?;
    let key = parse_pem_private_key(&key_pem)?;

    server_config_from_parts(certs, key, config.allow_unauthenticated, client_root)
}

/// Build a server configuration from an already-parsed identity.
pub fn server_config_from_parts(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    allow_unauthenticated: bool,
    client_root: Option<&[u8]>,
) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier: Arc<dyn ClientCertVerifier> = match client_root {
        Some(root) => anchored_verifier(root, provider.clone(), allow_unauthenticated)?,
        None => Arc::new(PeerCertificateVerifier::new(
            &provider,
            !allow_unauthenticated,
        )),
    };

    let mut tls_config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(|e| EstError::tls(format!("Unsupported protocol versions: {}", e)))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| EstError::tls(format!("Failed to configure server identity: {}", e)))?;

    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(tls_config))
}

fn anchored_verifier(
    root: &[u8],
    provider: Arc<CryptoProvider>,
    allow_unauthenticated: bool,
) -> Result<Arc<dyn ClientCertVerifier>> {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(root.to_vec()))
        .map_err(|e| EstError::tls(format!("Invalid client trust root: {}", e)))?;

    let mut builder = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
    if allow_unauthenticated {
        builder = builder.allow_unauthenticated();
    }
    builder
        .build()
        .map_err(|e| EstError::tls(format!("Failed to build client verifier: {}", e)))
}

/// Client certificate verifier that defers chain validation to the core.
///
/// The handshake proves possession of the private key for whatever
/// certificate the client presents; whether that certificate is trusted is
/// decided later by the authenticator against the CA anchor.
#[derive(Debug)]
pub struct PeerCertificateVerifier {
    algorithms: WebPkiSupportedAlgorithms,
    mandatory: bool,
}

impl PeerCertificateVerifier {
    /// Create a verifier using the provider's signature algorithms.
    pub fn new(provider: &CryptoProvider, mandatory: bool) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
            mandatory,
        }
    }
}

impl ClientCertVerifier for PeerCertificateVerifier {
    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        X509Certificate::from_der(end_entity.as_ref())
            .map_err(|_| rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding))?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Parse PEM-encoded certificates.
pub fn parse_pem_certificates(pem_data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem_data);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .filter_map(|result| result.ok())
        .collect();

    if certs.is_empty() {
        return Err(EstError::pem("No certificates found in PEM data"));
    }

    Ok(certs)
}

/// Parse a PEM-encoded private key.
pub fn parse_pem_private_key(pem_data: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem_data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs8(key));
            }
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => {
                return Ok(PrivateKeyDer::Sec1(key));
            }
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                return Err(EstError::pem(format!("Failed to parse PEM: {}", e)));
            }
        }
    }

    Err(EstError::pem("No private key found in PEM data"))
}
