// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration types for the EST server.
//!
//! Configuration is read from a TOML file:
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8443"
//!
//! [tls]
//! cert_file = "/etc/est/server.pem"
//! key_file = "/etc/est/server-key.pem"
//!
//! [ca]
//! cert_file = "/etc/est/ca.pem"
//! key_file = "/etc/est/ca-key.pem"
//!
//! [credentials]
//! user_db = "/var/lib/est/users.db"
//!
//! [auth]
//! expected_subject_pattern = "CN=* Registration Authority*"
//!
//! [est]
//! response_encoding = "base64"
//! device_retention_days = 90
//! ```
//!
//! or assembled programmatically with [`ServerConfig::builder`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EstError, Result};
use crate::types::TransferEncoding;

/// Complete EST server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ListenerConfig,

    /// Server TLS identity.
    pub tls: TlsConfig,

    /// CA key material used for issuance.
    pub ca: CaConfig,

    /// Password credential database.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Client certificate (RA) authentication policy.
    #[serde(default)]
    pub auth: AuthConfig,

    /// CSR acceptance policy.
    #[serde(default)]
    pub csr: CsrPolicy,

    /// Certificate signing policy.
    #[serde(default)]
    pub signing: SigningConfig,

    /// EST protocol options.
    #[serde(default)]
    pub est: EstConfig,

    /// Logging options.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServerConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, is missing required fields,
    /// or fails [`validate`](Self::validate).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| EstError::config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EstError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Self::from_toml(&contents)
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EstError::config(format!("TOML serialize: {e}")))
    }

    /// Check policy values for internal consistency.
    pub fn validate(&self) -> Result<()> {
        let signing = &self.signing;
        if signing.validity_days == 0 || signing.bootstrap_validity_days == 0 {
            return Err(EstError::config("validity periods must be at least one day"));
        }
        if signing.validity_days > signing.max_validity_days {
            return Err(EstError::config(format!(
                "validity_days ({}) exceeds max_validity_days ({})",
                signing.validity_days, signing.max_validity_days
            )));
        }
        if signing.bootstrap_validity_days > signing.max_validity_days {
            return Err(EstError::config(format!(
                "bootstrap_validity_days ({}) exceeds max_validity_days ({})",
                signing.bootstrap_validity_days, signing.max_validity_days
            )));
        }
        if signing.clock_skew() >= Duration::from_secs(86_400) {
            return Err(EstError::config("clock_skew_secs must be under one day"));
        }
        if self.csr.min_rsa_bits < 1024 {
            return Err(EstError::config("min_rsa_bits must be at least 1024"));
        }
        if self.csr.max_subject_len == 0 {
            return Err(EstError::config("max_subject_len must be positive"));
        }
        if self.credentials.pbkdf2_iterations < 1000 {
            return Err(EstError::config("pbkdf2_iterations must be at least 1000"));
        }
        if self.server.request_timeout_secs == 0 {
            return Err(EstError::config("request_timeout_secs must be positive"));
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Address to bind.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ListenerConfig {
    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Server TLS identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// PEM certificate chain presented to clients.
    pub cert_file: PathBuf,

    /// PEM private key for `cert_file`.
    pub key_file: PathBuf,

    /// Accept TLS connections that present no client certificate.
    ///
    /// Must stay enabled for password bootstrap to work.
    #[serde(default = "default_true")]
    pub allow_unauthenticated: bool,
}

/// CA key material.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaConfig {
    /// PEM CA certificate.
    pub cert_file: PathBuf,

    /// PEM CA private key (PKCS#8).
    pub key_file: PathBuf,

    /// Optional PEM bundle of intermediate/root certificates served by /cacerts.
    #[serde(default)]
    pub chain_file: Option<PathBuf>,
}

/// Password credential database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialsConfig {
    /// Path to the `identity:salt:verifier` database.
    #[serde(default = "default_user_db")]
    pub user_db: PathBuf,

    /// PBKDF2-HMAC-SHA256 iteration count for new and existing verifiers.
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            user_db: default_user_db(),
            pbkdf2_iterations: default_pbkdf2_iterations(),
        }
    }
}

/// How the presented client certificate chain is verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainVerification {
    /// The server verifies the certificate signature against the CA itself.
    #[default]
    Direct,

    /// A trusted terminating layer has already verified the chain.
    Delegated,
}

/// Client certificate (RA) authentication policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Required issuer DN (RFC 4514 form). Defaults to the CA subject.
    #[serde(default)]
    pub expected_issuer: Option<String>,

    /// Optional glob (`*` wildcard) the client certificate subject must match.
    #[serde(default)]
    pub expected_subject_pattern: Option<String>,

    /// Chain verification mode.
    #[serde(default)]
    pub chain_verification: ChainVerification,
}

/// CSR acceptance policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CsrPolicy {
    /// Minimum RSA modulus size in bits.
    #[serde(default = "default_min_rsa_bits")]
    pub min_rsa_bits: usize,

    /// Minimum elliptic curve size in bits.
    #[serde(default = "default_min_ec_bits")]
    pub min_ec_bits: usize,

    /// Maximum length of the rendered subject DN.
    #[serde(default = "default_max_subject_len")]
    pub max_subject_len: usize,
}

impl Default for CsrPolicy {
    fn default() -> Self {
        Self {
            min_rsa_bits: default_min_rsa_bits(),
            min_ec_bits: default_min_ec_bits(),
            max_subject_len: default_max_subject_len(),
        }
    }
}

/// Certificate signing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningConfig {
    /// Validity of certificates issued by simpleenroll/simplereenroll.
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,

    /// Validity of certificates issued by the bootstrap endpoint.
    #[serde(default = "default_bootstrap_validity_days")]
    pub bootstrap_validity_days: u32,

    /// Upper bound for any configured validity.
    #[serde(default = "default_validity_days")]
    pub max_validity_days: u32,

    /// Backdating applied to notBefore.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// Copy DNS and IP subjectAltName entries from the CSR.
    #[serde(default)]
    pub copy_subject_alt_names: bool,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            validity_days: default_validity_days(),
            bootstrap_validity_days: default_bootstrap_validity_days(),
            max_validity_days: default_validity_days(),
            clock_skew_secs: default_clock_skew(),
            copy_subject_alt_names: false,
        }
    }
}

impl SigningConfig {
    /// Clock skew allowance as a [`Duration`].
    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }
}

/// EST protocol options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EstConfig {
    /// Transfer encoding of PKCS#7 response bodies.
    #[serde(default)]
    pub response_encoding: TransferEncoding,

    /// Serve the password-only `/bootstrap` endpoint.
    #[serde(default = "default_true")]
    pub bootstrap_enabled: bool,

    /// Days a device may stay idle before it leaves the registry. Zero keeps
    /// devices for the life of the process.
    #[serde(default = "default_device_retention_days")]
    pub device_retention_days: u32,
}

impl Default for EstConfig {
    fn default() -> Self {
        Self {
            response_encoding: TransferEncoding::default(),
            bootstrap_enabled: true,
            device_retention_days: default_device_retention_days(),
        }
    }
}

/// Logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8443))
}

fn default_request_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_user_db() -> PathBuf {
    PathBuf::from("data/est_users.db")
}

fn default_pbkdf2_iterations() -> u32 {
    100_000
}

fn default_min_rsa_bits() -> usize {
    2048
}

fn default_min_ec_bits() -> usize {
    256
}

fn default_max_subject_len() -> usize {
    256
}

fn default_validity_days() -> u32 {
    365
}

fn default_bootstrap_validity_days() -> u32 {
    30
}

fn default_clock_skew() -> u64 {
    300
}

fn default_device_retention_days() -> u32 {
    90
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Builder for [`ServerConfig`].
#[derive(Default)]
pub struct ServerConfigBuilder {
    bind: Option<SocketAddr>,
    tls: TlsConfig,
    ca: CaConfig,
    credentials: CredentialsConfig,
    auth: AuthConfig,
    csr: CsrPolicy,
    signing: SigningConfig,
    est: EstConfig,
    logging: LoggingConfig,
}

impl ServerConfigBuilder {
    /// Create a new configuration builder.
    pub fn new() -> Self {
        Self {
            tls: TlsConfig {
                allow_unauthenticated: true,
                ..TlsConfig::default()
            },
            ..Self::default()
        }
    }

    /// Set the listen address.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind = Some(addr);
        self
    }

    /// Set the server TLS certificate and key files.
    pub fn tls_identity(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls.cert_file = cert.into();
        self.tls.key_file = key.into();
        self
    }

    /// Require every TLS client to present a certificate.
    pub fn require_client_cert(mut self) -> Self {
        self.tls.allow_unauthenticated = false;
        self
    }

    /// Set the CA certificate and key files.
    pub fn ca_files(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.ca.cert_file = cert.into();
        self.ca.key_file = key.into();
        self
    }

    /// Set the optional CA chain bundle.
    pub fn ca_chain(mut self, chain: impl Into<PathBuf>) -> Self {
        self.ca.chain_file = Some(chain.into());
        self
    }

    /// Set the credential database path.
    pub fn user_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials.user_db = path.into();
        self
    }

    /// Set the PBKDF2 iteration count.
    pub fn pbkdf2_iterations(mut self, iterations: u32) -> Self {
        self.credentials.pbkdf2_iterations = iterations;
        self
    }

    /// Require client certificates to be issued by this DN.
    pub fn expected_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.auth.expected_issuer = Some(issuer.into());
        self
    }

    /// Require client certificate subjects to match this glob.
    pub fn expected_subject_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.auth.expected_subject_pattern = Some(pattern.into());
        self
    }

    /// Set the chain verification mode.
    pub fn chain_verification(mut self, mode: ChainVerification) -> Self {
        self.auth.chain_verification = mode;
        self
    }

    /// Set the CSR policy.
    pub fn csr_policy(mut self, policy: CsrPolicy) -> Self {
        self.csr = policy;
        self
    }

    /// Set the enrollment validity in days. Raises `max_validity_days` if needed.
    pub fn validity_days(mut self, days: u32) -> Self {
        self.signing.validity_days = days;
        self.signing.max_validity_days = self.signing.max_validity_days.max(days);
        self
    }

    /// Set the bootstrap validity in days.
    pub fn bootstrap_validity_days(mut self, days: u32) -> Self {
        self.signing.bootstrap_validity_days = days;
        self
    }

    /// Set the notBefore backdating allowance.
    pub fn clock_skew(mut self, skew: Duration) -> Self {
        self.signing.clock_skew_secs = skew.as_secs();
        self
    }

    /// Copy DNS/IP subjectAltNames from CSRs.
    pub fn copy_subject_alt_names(mut self, enabled: bool) -> Self {
        self.signing.copy_subject_alt_names = enabled;
        self
    }

    /// Set the response transfer encoding.
    pub fn response_encoding(mut self, encoding: TransferEncoding) -> Self {
        self.est.response_encoding = encoding;
        self
    }

    /// Enable or disable the bootstrap endpoint.
    pub fn bootstrap_enabled(mut self, enabled: bool) -> Self {
        self.est.bootstrap_enabled = enabled;
        self
    }

    /// Set how long idle devices stay in the registry.
    pub fn device_retention_days(mut self, days: u32) -> Self {
        self.est.device_retention_days = days;
        self
    }

    /// Set logging options.
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<ServerConfig> {
        let config = ServerConfig {
            server: ListenerConfig {
                bind: self.bind.unwrap_or_else(default_bind),
                ..ListenerConfig::default()
            },
            tls: self.tls,
            ca: self.ca,
            credentials: self.credentials,
            auth: self.auth,
            csr: self.csr,
            signing: self.signing,
            est: self.est,
            logging: self.logging,
        };
        config.validate()?;
        Ok(config)
    }
}
