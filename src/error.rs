//! Error types for the EST server.
//!
//! [`EstError`] covers startup and administrative failures (configuration,
//! key material, TLS setup). The request path uses the narrower
//! [`AuthError`], [`ValidationError`] and [`IssuanceError`] kinds, which the
//! dispatcher alone translates into HTTP status codes.

use thiserror::Error;

/// Result type alias using [`EstError`].
pub type Result<T> = std::result::Result<T, EstError>;

/// Errors that can occur while configuring or running the EST server.
#[derive(Debug, Error)]
pub enum EstError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid PEM data.
    #[error("Invalid PEM data: {0}")]
    Pem(String),

    /// DER encoding/decoding error.
    #[error("DER error: {0}")]
    Der(#[from] der::Error),

    /// Base64 decoding error.
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate could not be parsed or is unusable.
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Credential database error.
    #[error("Credential store error: {0}")]
    Credential(String),

    /// CA key or signing setup error.
    #[error("Signing error: {0}")]
    Signing(String),
}

impl EstError {
    /// Create a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid PEM error.
    pub fn pem(msg: impl Into<String>) -> Self {
        Self::Pem(msg.into())
    }

    /// Create a TLS error with the given message.
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a certificate error with the given message.
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    /// Create a credential store error with the given message.
    pub fn credential(msg: impl Into<String>) -> Self {
        Self::Credential(msg.into())
    }

    /// Create a signing error with the given message.
    pub fn signing(msg: impl Into<String>) -> Self {
        Self::Signing(msg.into())
    }
}

/// Authentication failures.
///
/// The display strings are for local logs only; none of them are sent to
/// the peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Neither a client certificate nor basic credentials were presented.
    #[error("no credential presented")]
    NoCredential,

    /// A client certificate was presented but did not validate.
    #[error("client certificate rejected: {0}")]
    InvalidCertificate(String),

    /// Unknown identity or wrong password. The two are never distinguished.
    #[error("invalid username or password")]
    InvalidPassword,

    /// The certificate is valid but is not authorized for this server.
    #[error("client certificate not authorized: {0}")]
    IdentityMismatch(String),
}

impl AuthError {
    /// Create an invalid certificate error.
    pub fn invalid_certificate(msg: impl Into<String>) -> Self {
        Self::InvalidCertificate(msg.into())
    }

    /// Create an identity mismatch error.
    pub fn identity_mismatch(msg: impl Into<String>) -> Self {
        Self::IdentityMismatch(msg.into())
    }
}

/// CSR validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The transfer encoding (base64 or PEM armor) could not be decoded.
    #[error("malformed CSR encoding: {0}")]
    MalformedEncoding(String),

    /// The decoded bytes are not a PKCS#10 structure.
    #[error("malformed CSR ASN.1: {0}")]
    MalformedAsn1(String),

    /// The CSR signature does not verify against its own public key.
    #[error("CSR self-signature is invalid")]
    SelfSignatureInvalid,

    /// The public key is unsupported or below the minimum strength.
    #[error("CSR key rejected: {0}")]
    WeakKey(String),

    /// The subject is empty or too long.
    #[error("CSR subject rejected: {0}")]
    InvalidSubject(String),
}

/// Certificate issuance failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IssuanceError {
    /// The request or the configured policy cannot produce a compliant certificate.
    #[error("issuance policy violation: {0}")]
    PolicyViolation(String),

    /// The CA key failed to produce a signature.
    #[error("signing failed: {0}")]
    SigningFailure(String),

    /// Re-enrollment was requested for an identity other than the caller's.
    #[error("identity mismatch: {0}")]
    IdentityMismatch(String),
}

impl IssuanceError {
    /// Create a policy violation error.
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::PolicyViolation(msg.into())
    }

    /// Create a signing failure error.
    pub fn signing(msg: impl Into<String>) -> Self {
        Self::SigningFailure(msg.into())
    }
}
