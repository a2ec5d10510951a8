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

//! Certificate issuance.
//!
//! The [`IssuanceEngine`] turns a validated [`CertificateRequest`] into a
//! certificate signed by the [`TrustAnchor`]. Only the subject and public
//! key come from the request. Serial, validity and every extension come
//! from the server's [`SigningPolicy`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use der::Decode;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa,
    KeyUsagePurpose, SanType, SerialNumber,
};
use ring::rand::{SecureRandom, SystemRandom};
use time::OffsetDateTime;
use x509_cert::Certificate;
use x509_parser::der_parser::asn1_rs::Tag;
use x509_parser::x509::X509Name;
use zeroize::Zeroizing;

use crate::anchor::TrustAnchor;
use crate::auth::{AuthMethod, Principal};
use crate::config::SigningConfig;
use crate::csr::CertificateRequest;
use crate::error::IssuanceError;

/// Length of generated serial numbers in bytes.
pub const SERIAL_LENGTH: usize = 16;

/// Leading random bytes of a serial; the rest is the allocation counter.
const SERIAL_RANDOM_LENGTH: usize = 8;

const SECONDS_PER_DAY: u64 = 86_400;

/// Certificate profile selected by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    /// `simpleenroll` and `simplereenroll`.
    Enrollment,
    /// Password-only `bootstrap`.
    Bootstrap,
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enrollment => write!(f, "enrollment"),
            Self::Bootstrap => write!(f, "bootstrap"),
        }
    }
}

/// Everything the issued certificate takes from server policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningPolicy {
    /// Exact `notAfter - notBefore`.
    pub validity: Duration,
    /// Upper bound for `validity`.
    pub max_validity: Duration,
    /// How far `notBefore` is backdated.
    pub clock_skew: Duration,
    /// KeyUsage bits.
    pub key_usages: Vec<KeyUsagePurpose>,
    /// ExtendedKeyUsage purposes.
    pub extended_key_usages: Vec<ExtendedKeyUsagePurpose>,
    /// Copy DNS and IP subjectAltNames from the request.
    pub copy_subject_alt_names: bool,
}

impl SigningPolicy {
    /// Policy for `profile` under `config`.
    pub fn for_profile(profile: Profile, config: &SigningConfig) -> Self {
        match profile {
            Profile::Enrollment => Self::enrollment(config),
            Profile::Bootstrap => Self::bootstrap(config),
        }
    }

    /// clientAuth and serverAuth, `validity_days`.
    pub fn enrollment(config: &SigningConfig) -> Self {
        Self {
            validity: days(config.validity_days),
            max_validity: days(config.max_validity_days),
            clock_skew: config.clock_skew(),
            key_usages: default_key_usages(),
            extended_key_usages: vec![
                ExtendedKeyUsagePurpose::ClientAuth,
                ExtendedKeyUsagePurpose::ServerAuth,
            ],
            copy_subject_alt_names: config.copy_subject_alt_names,
        }
    }

    /// clientAuth only, `bootstrap_validity_days`.
    pub fn bootstrap(config: &SigningConfig) -> Self {
        Self {
            validity: days(config.bootstrap_validity_days),
            max_validity: days(config.max_validity_days),
            clock_skew: config.clock_skew(),
            key_usages: default_key_usages(),
            extended_key_usages: vec![ExtendedKeyUsagePurpose::ClientAuth],
            copy_subject_alt_names: config.copy_subject_alt_names,
        }
    }

    fn check(&self) -> Result<(), IssuanceError> {
        if self.validity <= self.clock_skew {
            return Err(IssuanceError::policy(format!(
                "validity {}s does not exceed clock skew {}s",
                self.validity.as_secs(),
                self.clock_skew.as_secs()
            )));
        }
        if self.validity > self.max_validity {
            return Err(IssuanceError::policy(format!(
                "validity {}s exceeds maximum {}s",
                self.validity.as_secs(),
                self.max_validity.as_secs()
            )));
        }
        Ok(())
    }
}

fn days(n: u32) -> Duration {
    Duration::from_secs(u64::from(n) * SECONDS_PER_DAY)
}

fn default_key_usages() -> Vec<KeyUsagePurpose> {
    vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ]
}

/// Hands out unique positive serial numbers.
///
/// A serial is 8 random bytes followed by a big-endian 64-bit counter, so
/// serials from one allocator never repeat and the allocator holds no
/// per-certificate state. The random prefix separates process lifetimes.
#[derive(Debug)]
pub struct SerialAllocator {
    rng: SystemRandom,
    counter: AtomicU64,
}

impl Default for SerialAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialAllocator {
    /// Create an allocator with no serials issued.
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
            counter: AtomicU64::new(0),
        }
    }

    /// Draw a fresh serial.
    pub fn allocate(&self) -> Result<[u8; SERIAL_LENGTH], IssuanceError> {
        let mut serial = [0u8; SERIAL_LENGTH];
        self.rng
            .fill(&mut serial[..SERIAL_RANDOM_LENGTH])
            .map_err(|_| IssuanceError::signing("random number generator failed"))?;
        // DER INTEGER is signed; keep the top bit clear and the length fixed.
        serial[0] = (serial[0] & 0x7f) | 0x01;

        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        serial[SERIAL_RANDOM_LENGTH..].copy_from_slice(&count.to_be_bytes());
        Ok(serial)
    }

    /// Number of serials handed out.
    pub fn issued_count(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

/// A certificate produced by the engine.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// Serial number bytes.
    pub serial: [u8; SERIAL_LENGTH],
    /// Subject, copied from the request.
    pub subject: String,
    /// Subject commonName, if any.
    pub common_name: Option<String>,
    /// Issuer, always the anchor subject.
    pub issuer: String,
    /// Start of validity.
    pub not_before: OffsetDateTime,
    /// End of validity.
    pub not_after: OffsetDateTime,
    /// DER encoding.
    pub der: Vec<u8>,
    /// Parsed form for the response encoder.
    pub certificate: Certificate,
}

impl IssuedCertificate {
    /// Serial number as lowercase hex.
    pub fn serial_hex(&self) -> String {
        hex::encode(self.serial)
    }
}

/// Default commonName of RA certificates.
pub const RA_COMMON_NAME: &str = "EST Registration Authority";

/// Default organization of RA certificates.
pub const RA_ORGANIZATION: &str = "EST Gateway";

/// Default validity of RA certificates.
pub const RA_VALIDITY_DAYS: u32 = 730;

const RA_CLOCK_SKEW_SECS: u64 = 300;

/// An RA certificate and the key generated for it.
pub struct RaCredentials {
    /// PEM certificate.
    pub certificate_pem: String,
    /// PEM PKCS#8 private key.
    pub key_pem: Zeroizing<String>,
    /// Serial number as lowercase hex.
    pub serial: String,
    /// End of validity.
    pub not_after: OffsetDateTime,
}

impl std::fmt::Debug for RaCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaCredentials")
            .field("serial", &self.serial)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Signs validated requests with the CA key.
#[derive(Debug, Default)]
pub struct IssuanceEngine {
    serials: SerialAllocator,
}

impl IssuanceEngine {
    /// Create an engine with its own serial allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serial allocator shared by every issuance.
    pub fn serials(&self) -> &SerialAllocator {
        &self.serials
    }

    /// Issue a certificate for `request`.
    pub fn issue(
        &self,
        request: &CertificateRequest,
        principal: &Principal,
        anchor: &TrustAnchor,
        policy: &SigningPolicy,
    ) -> Result<IssuedCertificate, IssuanceError> {
        policy.check()?;

        let csr = request
            .parsed()
            .ok_or_else(|| IssuanceError::policy("request no longer parses"))?;
        let distinguished_name = copy_subject(&csr.certification_request_info.subject)?;

        let public_key = rcgen::SubjectPublicKeyInfo::from_der(request.public_key())
            .map_err(|e| IssuanceError::policy(format!("unsupported public key: {e}")))?;

        let (not_before, not_after) = validity_window(policy)?;
        let serial = self.serials.allocate()?;

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name;
        params.serial_number = Some(SerialNumber::from_slice(&serial));
        params.not_before = not_before;
        params.not_after = not_after;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = policy.key_usages.clone();
        params.extended_key_usages = policy.extended_key_usages.clone();
        params.use_authority_key_identifier_extension = true;
        if policy.copy_subject_alt_names {
            params.subject_alt_names = subject_alt_names(request)?;
        }

        let signed = params
            .signed_by(&public_key, anchor.issuer(), anchor.key())
            .map_err(|e| IssuanceError::signing(e.to_string()))?;
        let der = signed.der().to_vec();
        let certificate = Certificate::from_der(&der)
            .map_err(|e| IssuanceError::signing(format!("signed certificate is unreadable: {e}")))?;

        tracing::info!(
            "Issued certificate {} for '{}' to {} ({} until {})",
            hex::encode(serial),
            request.subject(),
            principal.id,
            principal.method,
            not_after
        );

        Ok(IssuedCertificate {
            serial,
            subject: request.subject().to_string(),
            common_name: request.common_name().map(str::to_string),
            issuer: anchor.subject().to_string(),
            not_before,
            not_after,
            der,
            certificate,
        })
    }

    /// Issue a replacement certificate for the caller's own identity.
    ///
    /// A certificate principal may only renew its own subject; a password
    /// principal may only renew a request whose commonName is its identity.
    pub fn renew(
        &self,
        request: &CertificateRequest,
        principal: &Principal,
        anchor: &TrustAnchor,
        policy: &SigningPolicy,
    ) -> Result<IssuedCertificate, IssuanceError> {
        check_identity(request, principal)?;
        self.issue(request, principal, anchor, policy)
    }

    /// Issue a clientAuth certificate, with a new key, for a Registration
    /// Authority.
    ///
    /// Used by operators to provision RAs that then enroll devices with
    /// their certificate instead of a password.
    pub fn issue_ra_certificate(
        &self,
        anchor: &TrustAnchor,
        common_name: &str,
        organization: &str,
        validity_days: u32,
    ) -> Result<RaCredentials, IssuanceError> {
        let policy = SigningPolicy {
            validity: days(validity_days),
            max_validity: days(validity_days),
            clock_skew: Duration::from_secs(RA_CLOCK_SKEW_SECS),
            key_usages: vec![KeyUsagePurpose::DigitalSignature],
            extended_key_usages: vec![ExtendedKeyUsagePurpose::ClientAuth],
            copy_subject_alt_names: false,
        };
        policy.check()?;

        let key = rcgen::KeyPair::generate()
            .map_err(|e| IssuanceError::signing(format!("key generation failed: {e}")))?;
        let (not_before, not_after) = validity_window(&policy)?;
        let serial = self.serials.allocate()?;

        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.distinguished_name.push(DnType::OrganizationName, organization);
        params.serial_number = Some(SerialNumber::from_slice(&serial));
        params.not_before = not_before;
        params.not_after = not_after;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = policy.key_usages;
        params.extended_key_usages = policy.extended_key_usages;
        params.use_authority_key_identifier_extension = true;

        let signed = params
            .signed_by(&key, anchor.issuer(), anchor.key())
            .map_err(|e| IssuanceError::signing(e.to_string()))?;

        tracing::info!(
            "Issued RA certificate {} for 'CN={}, O={}' until {}",
            hex::encode(serial),
            common_name,
            organization,
            not_after
        );

        Ok(RaCredentials {
            certificate_pem: signed.pem(),
            key_pem: Zeroizing::new(key.serialize_pem()),
            serial: hex::encode(serial),
            not_after,
        })
    }
}

fn check_identity(request: &CertificateRequest, principal: &Principal) -> Result<(), IssuanceError> {
    match principal.method {
        AuthMethod::ClientCertificate => {
            if request.subject() != principal.id {
                return Err(IssuanceError::IdentityMismatch(format!(
                    "request subject '{}' differs from certificate subject '{}'",
                    request.subject(),
                    principal.id
                )));
            }
        }
        AuthMethod::Password => {
            if request.common_name() != Some(principal.id.as_str()) {
                return Err(IssuanceError::IdentityMismatch(format!(
                    "request commonName {:?} differs from user '{}'",
                    request.common_name(),
                    principal.id
                )));
            }
        }
    }
    Ok(())
}

/// `[now - skew, now - skew + validity)`, whole seconds.
fn validity_window(
    policy: &SigningPolicy,
) -> Result<(OffsetDateTime, OffsetDateTime), IssuanceError> {
    let now = OffsetDateTime::from_unix_timestamp(OffsetDateTime::now_utc().unix_timestamp())
        .map_err(|e| IssuanceError::policy(format!("clock out of range: {e}")))?;
    let skew = time::Duration::try_from(policy.clock_skew)
        .map_err(|e| IssuanceError::policy(e.to_string()))?;
    let validity = time::Duration::try_from(policy.validity)
        .map_err(|e| IssuanceError::policy(e.to_string()))?;

    let not_before = now
        .checked_sub(skew)
        .ok_or_else(|| IssuanceError::policy("notBefore out of range"))?;
    let not_after = not_before
        .checked_add(validity)
        .ok_or_else(|| IssuanceError::policy("notAfter out of range"))?;
    Ok((not_before, not_after))
}

/// Rebuild the request subject attribute by attribute, keeping order and
/// string types.
fn copy_subject(name: &X509Name<'_>) -> Result<DistinguishedName, IssuanceError> {
    let mut dn = DistinguishedName::new();
    let mut seen = Vec::new();

    for rdn in name.iter() {
        let mut attributes = rdn.iter();
        let attr = match (attributes.next(), attributes.next()) {
            (Some(attr), None) => attr,
            (Some(_), Some(_)) => {
                return Err(IssuanceError::policy("multi-valued RDNs are not supported"))
            }
            (None, _) => continue,
        };

        let oid: Vec<u64> = attr
            .attr_type()
            .iter()
            .ok_or_else(|| IssuanceError::policy("subject attribute OID too large"))?
            .collect();
        let dn_type = DnType::from_oid(&oid);
        if seen.contains(&dn_type) {
            return Err(IssuanceError::policy(format!(
                "repeated subject attribute {}",
                attr.attr_type()
            )));
        }

        let value = attr.attr_value();
        let text = || {
            std::str::from_utf8(value.data)
                .map_err(|_| IssuanceError::policy("subject attribute is not valid text"))
        };
        let invalid = |e: rcgen::Error| IssuanceError::policy(format!("subject attribute: {e}"));
        let dn_value = match value.tag() {
            Tag::Utf8String => DnValue::Utf8String(text()?.to_string()),
            Tag::PrintableString => {
                DnValue::PrintableString(text()?.try_into().map_err(invalid)?)
            }
            Tag::Ia5String => DnValue::Ia5String(text()?.try_into().map_err(invalid)?),
            Tag::T61String => DnValue::TeletexString(text()?.try_into().map_err(invalid)?),
            Tag::BmpString => DnValue::BmpString(
                rcgen::BmpString::from_utf16be(value.data.to_vec()).map_err(invalid)?,
            ),
            Tag::UniversalString => DnValue::UniversalString(
                rcgen::UniversalString::from_utf32be(value.data.to_vec()).map_err(invalid)?,
            ),
            other => {
                return Err(IssuanceError::policy(format!(
                    "unsupported subject string type {other:?}"
                )))
            }
        };

        seen.push(dn_type.clone());
        dn.push(dn_type, dn_value);
    }

    Ok(dn)
}

fn subject_alt_names(request: &CertificateRequest) -> Result<Vec<SanType>, IssuanceError> {
    let mut names = Vec::new();
    for dns in request.dns_names() {
        let ia5 = dns
            .as_str()
            .try_into()
            .map_err(|e| IssuanceError::policy(format!("bad DNS name '{dns}': {e}")))?;
        names.push(SanType::DnsName(ia5));
    }
    names.extend(request.ip_addresses().iter().copied().map(SanType::IpAddress));
    Ok(names)
}
