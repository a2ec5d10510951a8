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

//! CA trust anchor.
//!
//! The anchor is the CA certificate plus its private signing key, and an
//! optional bundle of further certificates served from `/cacerts`. It is
//! loaded once at startup and never mutated; rotating it means restarting
//! the server with new files.

use std::path::Path;

use der::Decode;
use rustls::pki_types::CertificateDer;
use x509_cert::Certificate;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::config::CaConfig;
use crate::error::{EstError, Result};
use crate::tls::parse_pem_certificates;

/// The CA certificate and signing key.
pub struct TrustAnchor {
    certificate: Certificate,
    der: Vec<u8>,
    chain: Vec<Certificate>,
    subject: String,
    issuer: rcgen::Certificate,
    key: rcgen::KeyPair,
}

impl std::fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustAnchor")
            .field("subject", &self.subject)
            .field("chain", &self.chain.len())
            .field("key_algorithm", &self.key.algorithm())
            .finish()
    }
}

impl TrustAnchor {
    /// Build an anchor from a PEM certificate and a PEM PKCS#8 private key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let der = parse_pem_certificates(cert_pem.as_bytes())?
            .into_iter()
            .next()
            .ok_or_else(|| EstError::pem("no CERTIFICATE block in CA certificate file"))?;

        let key = rcgen::KeyPair::from_pem(key_pem).map_err(|e| {
            EstError::signing(format!(
                "Failed to load CA key (PKCS#8 \"PRIVATE KEY\" required): {e}"
            ))
        })?;

        Self::from_der(der.as_ref(), key)
    }

    /// Build an anchor from a DER certificate and an already-loaded key pair.
    pub fn from_der(cert_der: &[u8], key: rcgen::KeyPair) -> Result<Self> {
        let (_, parsed) = X509Certificate::from_der(cert_der)
            .map_err(|e| EstError::certificate(format!("Failed to parse CA certificate: {e}")))?;

        if parsed.tbs_certificate.subject_pki.raw != key.public_key_der().as_slice() {
            return Err(EstError::signing(
                "CA private key does not match the CA certificate",
            ));
        }
        if !parsed.is_ca() {
            tracing::warn!("CA certificate lacks basicConstraints CA:TRUE");
        }
        if !parsed.validity().is_valid() {
            tracing::warn!(
                "CA certificate is outside its validity window ({} - {})",
                parsed.validity().not_before,
                parsed.validity().not_after
            );
        }

        let subject = parsed.subject().to_string();

        let params = rcgen::CertificateParams::from_ca_cert_der(&CertificateDer::from(cert_der))
            .map_err(|e| EstError::certificate(format!("Unsupported CA certificate: {e}")))?;
        let issuer = params
            .self_signed(&key)
            .map_err(|e| EstError::signing(format!("CA key unusable: {e}")))?;

        let certificate = Certificate::from_der(cert_der)?;

        tracing::info!("Loaded CA trust anchor: {}", subject);

        Ok(Self {
            certificate,
            der: cert_der.to_vec(),
            chain: Vec::new(),
            subject,
            issuer,
            key,
        })
    }

    /// Attach the certificates of a PEM bundle as the distribution chain.
    pub fn with_chain_pem(mut self, chain_pem: &str) -> Result<Self> {
        for der in parse_pem_certificates(chain_pem.as_bytes())? {
            let cert = Certificate::from_der(der.as_ref())?;
            if cert != self.certificate && !self.chain.contains(&cert) {
                self.chain.push(cert);
            }
        }
        tracing::debug!("CA chain holds {} additional certificate(s)", self.chain.len());
        Ok(self)
    }

    /// Load the anchor described by `config`.
    pub fn load(config: &CaConfig) -> Result<Self> {
        let cert_pem = read_file(&config.cert_file)?;
        let key_pem = read_file(&config.key_file)?;
        let anchor = Self::from_pem(&cert_pem, &key_pem)?;

        match &config.chain_file {
            Some(path) => anchor.with_chain_pem(&read_file(path)?),
            None => Ok(anchor),
        }
    }

    /// The CA certificate.
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// DER encoding of the CA certificate.
    pub fn certificate_der(&self) -> &[u8] {
        &self.der
    }

    /// Additional distribution certificates.
    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }

    /// The CA certificate followed by the chain, as served from `/cacerts`.
    pub fn distribution_certificates(&self) -> Vec<Certificate> {
        std::iter::once(self.certificate.clone())
            .chain(self.chain.iter().cloned())
            .collect()
    }

    /// CA subject in RFC 4514 form.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Parse the CA certificate for verification work.
    pub(crate) fn parsed(&self) -> Result<X509Certificate<'_>> {
        X509Certificate::from_der(&self.der)
            .map(|(_, cert)| cert)
            .map_err(|e| EstError::certificate(format!("CA certificate: {e}")))
    }

    /// Verify that `cert` carries a signature made by this CA's key.
    pub fn verify_signed(&self, cert: &X509Certificate<'_>) -> std::result::Result<(), String> {
        let ca = self.parsed().map_err(|e| e.to_string())?;
        if cert.issuer().as_raw() != ca.subject().as_raw() {
            return Err(format!("issuer '{}' is not this CA", cert.issuer()));
        }
        cert.verify_signature(Some(ca.public_key()))
            .map_err(|e| format!("signature does not verify: {e}"))
    }

    pub(crate) fn issuer(&self) -> &rcgen::Certificate {
        &self.issuer
    }

    pub(crate) fn key(&self) -> &rcgen::KeyPair {
        &self.key
    }

    /// PEM encoding of the CA certificate.
    pub fn certificate_pem(&self) -> Result<String> {
        use der::pem::LineEnding;
        use der::EncodePem;
        self.certificate
            .to_pem(LineEnding::LF)
            .map_err(|e| EstError::pem(e.to_string()))
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| EstError::config(format!("Failed to read {}: {e}", path.display())))
}
