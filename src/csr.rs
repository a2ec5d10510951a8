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

//! PKCS#10 CSR validation.
//!
//! Enrollment bodies are untrusted. [`CsrValidator::validate`] turns the raw
//! request body into a [`CertificateRequest`] only after the body decodes,
//! parses, carries a valid self-signature, uses an acceptable key, and names
//! an acceptable subject. Nothing else in the crate can construct a
//! [`CertificateRequest`].

use std::net::IpAddr;

use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;

use crate::config::CsrPolicy;
use crate::error::ValidationError;
use crate::types::pkcs7::decode_base64;
use crate::types::TransferEncoding;

/// OID for Ed25519 keys: 1.3.101.112
const ED25519_OID: &str = "1.3.101.112";

/// Smallest RSA modulus the signature verifier accepts.
const RSA_VERIFY_FLOOR_BITS: usize = 2048;

/// PEM labels accepted for CSR armor.
const CSR_PEM_LABELS: &[&str] = &["CERTIFICATE REQUEST", "NEW CERTIFICATE REQUEST"];

/// Public key algorithm of a validated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// RSA.
    Rsa,
    /// NIST elliptic curve key.
    Ec,
    /// Ed25519 key.
    Ed25519,
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsa => write!(f, "RSA"),
            Self::Ec => write!(f, "EC"),
            Self::Ed25519 => write!(f, "Ed25519"),
        }
    }
}

/// A PKCS#10 request whose self-signature has been verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    der: Vec<u8>,
    subject: String,
    common_name: Option<String>,
    public_key: Vec<u8>,
    signature: Vec<u8>,
    key_algorithm: KeyAlgorithm,
    key_bits: usize,
    dns_names: Vec<String>,
    ip_addresses: Vec<IpAddr>,
}

impl CertificateRequest {
    /// DER encoding of the full request.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Subject in RFC 4514 form.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// First commonName of the subject, if any.
    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// SubjectPublicKeyInfo DER.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// The self-signature bits.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Key algorithm.
    pub fn key_algorithm(&self) -> KeyAlgorithm {
        self.key_algorithm
    }

    /// Key size in bits.
    pub fn key_bits(&self) -> usize {
        self.key_bits
    }

    /// DNS names requested in a subjectAltName extension.
    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    /// IP addresses requested in a subjectAltName extension.
    pub fn ip_addresses(&self) -> &[IpAddr] {
        &self.ip_addresses
    }

    /// Re-parse the stored DER for issuance.
    pub(crate) fn parsed(&self) -> Option<X509CertificationRequest<'_>> {
        X509CertificationRequest::from_der(&self.der)
            .ok()
            .map(|(_, csr)| csr)
    }
}

/// Validates enrollment request bodies against a [`CsrPolicy`].
#[derive(Debug, Clone)]
pub struct CsrValidator {
    policy: CsrPolicy,
}

impl CsrValidator {
    /// Create a validator enforcing `policy`.
    pub fn new(policy: CsrPolicy) -> Self {
        Self { policy }
    }

    /// The policy in force.
    pub fn policy(&self) -> &CsrPolicy {
        &self.policy
    }

    /// Validate a request body.
    ///
    /// # Errors
    ///
    /// Checks run in a fixed order and the first failure is returned:
    /// decoding, ASN.1 parsing, self-signature, key strength, subject.
    pub fn validate(
        &self,
        raw: &[u8],
        encoding: TransferEncoding,
    ) -> Result<CertificateRequest, ValidationError> {
        let der = decode_body(raw, encoding)?;

        let (rest, csr) = X509CertificationRequest::from_der(&der)
            .map_err(|e| ValidationError::MalformedAsn1(e.to_string()))?;
        if !rest.is_empty() {
            return Err(ValidationError::MalformedAsn1(format!(
                "{} trailing bytes after CertificationRequest",
                rest.len()
            )));
        }

        let info = &csr.certification_request_info;
        let key = inspect_key(&info.subject_pki);

        if csr.verify_signature().is_err() {
            // RSA moduli under the verifier floor never verify, so a
            // correctly signed weak request is reported as weak.
            if let Ok((KeyAlgorithm::Rsa, bits)) = key {
                if bits < RSA_VERIFY_FLOOR_BITS && bits < self.policy.min_rsa_bits {
                    return Err(ValidationError::WeakKey(format!(
                        "RSA-{bits} is below the {}-bit minimum",
                        self.policy.min_rsa_bits
                    )));
                }
            }
            return Err(ValidationError::SelfSignatureInvalid);
        }

        let (key_algorithm, key_bits) = key?;
        self.check_key_strength(key_algorithm, key_bits)?;

        let subject = info.subject.to_string();
        if info.subject.iter_attributes().next().is_none() || subject.trim().is_empty() {
            return Err(ValidationError::InvalidSubject("subject is empty".to_string()));
        }
        if subject.chars().count() > self.policy.max_subject_len {
            return Err(ValidationError::InvalidSubject(format!(
                "subject is {} characters, limit is {}",
                subject.chars().count(),
                self.policy.max_subject_len
            )));
        }

        let common_name = info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        let (dns_names, ip_addresses) = requested_alt_names(&csr);
        let public_key = info.subject_pki.raw.to_vec();
        let signature = csr.signature_value.data.to_vec();

        tracing::debug!(
            "Validated CSR for '{}' ({} {}-bit)",
            subject,
            key_algorithm,
            key_bits
        );

        Ok(CertificateRequest {
            der,
            subject,
            common_name,
            public_key,
            signature,
            key_algorithm,
            key_bits,
            dns_names,
            ip_addresses,
        })
    }

    fn check_key_strength(
        &self,
        algorithm: KeyAlgorithm,
        bits: usize,
    ) -> Result<(), ValidationError> {
        let minimum = match algorithm {
            KeyAlgorithm::Rsa => self.policy.min_rsa_bits,
            KeyAlgorithm::Ec => self.policy.min_ec_bits,
            KeyAlgorithm::Ed25519 => return Ok(()),
        };
        if bits < minimum {
            return Err(ValidationError::WeakKey(format!(
                "{algorithm}-{bits} is below the {minimum}-bit minimum"
            )));
        }
        Ok(())
    }
}

/// Undo the transfer encoding and any PEM armor.
fn decode_body(raw: &[u8], encoding: TransferEncoding) -> Result<Vec<u8>, ValidationError> {
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ValidationError::MalformedEncoding("empty body".to_string()));
    }

    let trimmed = trim_ascii_start(raw);
    if trimmed.starts_with(b"-----BEGIN") {
        let (_, pem) = x509_parser::pem::parse_x509_pem(trimmed)
            .map_err(|e| ValidationError::MalformedEncoding(format!("bad PEM armor: {e}")))?;
        if !CSR_PEM_LABELS.contains(&pem.label.as_str()) {
            return Err(ValidationError::MalformedEncoding(format!(
                "unexpected PEM label '{}'",
                pem.label
            )));
        }
        return Ok(pem.contents);
    }

    match encoding {
        TransferEncoding::Base64 => {
            decode_base64(raw).map_err(|e| ValidationError::MalformedEncoding(e.to_string()))
        }
        TransferEncoding::Binary => Ok(raw.to_vec()),
    }
}

fn trim_ascii_start(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    &data[start..]
}

/// Classify a public key and measure it.
fn inspect_key(spki: &SubjectPublicKeyInfo<'_>) -> Result<(KeyAlgorithm, usize), ValidationError> {
    if spki.algorithm.algorithm.to_id_string() == ED25519_OID {
        return Ok((KeyAlgorithm::Ed25519, 256));
    }

    match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => Ok((KeyAlgorithm::Rsa, rsa_modulus_bits(rsa.modulus))),
        Ok(PublicKey::EC(point)) => Ok((KeyAlgorithm::Ec, point.key_size())),
        Ok(_) => Err(ValidationError::WeakKey(format!(
            "unsupported key algorithm {}",
            spki.algorithm.algorithm.to_id_string()
        ))),
        Err(e) => Err(ValidationError::WeakKey(format!("unreadable public key: {e}"))),
    }
}

fn rsa_modulus_bits(modulus: &[u8]) -> usize {
    let significant = trim_leading_zeros(modulus);
    match significant.first() {
        Some(first) => significant.len() * 8 - first.leading_zeros() as usize,
        None => 0,
    }
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// DNS and IP subjectAltName entries from the extensionRequest attribute.
fn requested_alt_names(csr: &X509CertificationRequest<'_>) -> (Vec<String>, Vec<IpAddr>) {
    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();

    if let Some(extensions) = csr.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                        GeneralName::IPAddress(bytes) => {
                            if let Some(ip) = ip_from_bytes(bytes) {
                                ip_addresses.push(ip);
                            }
                        }
                        other => tracing::debug!("Ignoring requested SAN {:?}", other),
                    }
                }
            }
        }
    }

    (dns_names, ip_addresses)
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}
