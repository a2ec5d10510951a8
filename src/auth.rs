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

//! Request authentication.
//!
//! EST callers prove who they are with a TLS client certificate (an RA or
//! an already-enrolled device) or with HTTP Basic credentials (bootstrap
//! users). The [`Authenticator`] decides between the two:
//!
//! 1. A presented client certificate is checked first and its verdict is
//!    final. A rejected certificate is never rescued by a good password.
//! 2. Otherwise Basic credentials are checked against the
//!    [`CredentialStore`].
//! 3. Otherwise the request carries no credential at all.
//!
//! Client certificate data only ever comes from the TLS session. Headers
//! such as `X-Forwarded-Client-Cert` are ignored.

use std::sync::Arc;

use base64::prelude::*;
use serde::Serialize;
use x509_parser::objects::{oid2abbrev, oid_registry};
use x509_parser::prelude::{FromDer, X509Certificate};
use zeroize::Zeroizing;

use crate::anchor::TrustAnchor;
use crate::config::{AuthConfig, ChainVerification};
use crate::credentials::CredentialStore;
use crate::error::AuthError;

/// How a principal authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// TLS client certificate issued by the CA.
    ClientCertificate,
    /// HTTP Basic username and password.
    Password,
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientCertificate => write!(f, "client-certificate"),
            Self::Password => write!(f, "password"),
        }
    }
}

/// An authenticated caller. Built per request and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Certificate subject DN, or the password identity.
    pub id: String,
    /// Authentication method.
    pub method: AuthMethod,
    /// Subject attributes of the presented certificate as (type, value).
    pub attributes: Vec<(String, String)>,
}

impl Principal {
    /// A principal authenticated by password.
    pub fn password(identity: impl Into<String>) -> Self {
        Self {
            id: identity.into(),
            method: AuthMethod::Password,
            attributes: Vec::new(),
        }
    }

    /// A principal authenticated by client certificate.
    pub fn certificate(subject: impl Into<String>, attributes: Vec<(String, String)>) -> Self {
        Self {
            id: subject.into(),
            method: AuthMethod::ClientCertificate,
            attributes,
        }
    }

    /// First value of attribute `name` (for example `"CN"`).
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// The leaf certificate presented in the TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    /// DER encoding.
    pub der: Vec<u8>,
    /// Whether the TLS layer already verified the chain to the anchor.
    pub chain_verified: bool,
}

impl PeerCertificate {
    /// A certificate whose chain the core must verify.
    pub fn unverified(der: impl Into<Vec<u8>>) -> Self {
        Self {
            der: der.into(),
            chain_verified: false,
        }
    }
}

/// HTTP Basic credentials.
#[derive(Clone)]
pub struct BasicCredentials {
    /// Username.
    pub username: String,
    password: Zeroizing<String>,
}

impl BasicCredentials {
    /// Create credentials from a username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    /// The password.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Parse an `Authorization: Basic ...` header value.
    ///
    /// Returns `None` for other schemes and for malformed values.
    pub fn from_authorization(header: &str) -> Option<Self> {
        let (scheme, encoded) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = Zeroizing::new(BASE64_STANDARD.decode(encoded.trim()).ok()?);
        let text = std::str::from_utf8(&decoded).ok()?;
        let (username, password) = text.split_once(':')?;
        Some(Self::new(username, password))
    }
}

impl std::fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Decides who a request comes from.
#[derive(Debug)]
pub struct Authenticator {
    credentials: Arc<CredentialStore>,
    anchor: Arc<TrustAnchor>,
    expected_issuer: String,
    subject_pattern: Option<String>,
    chain_verification: ChainVerification,
}

impl Authenticator {
    /// Create an authenticator.
    ///
    /// The expected issuer defaults to the anchor subject.
    pub fn new(
        credentials: Arc<CredentialStore>,
        anchor: Arc<TrustAnchor>,
        config: &AuthConfig,
    ) -> Self {
        let expected_issuer = config
            .expected_issuer
            .clone()
            .unwrap_or_else(|| anchor.subject().to_string());
        Self {
            credentials,
            anchor,
            expected_issuer,
            subject_pattern: config.expected_subject_pattern.clone(),
            chain_verification: config.chain_verification,
        }
    }

    /// Authenticate a request to `simpleenroll` or `simplereenroll`.
    pub fn authenticate(
        &self,
        peer: Option<&PeerCertificate>,
        basic: Option<&BasicCredentials>,
    ) -> Result<Principal, AuthError> {
        if let Some(peer) = peer {
            if basic.is_some() {
                tracing::debug!("Client certificate present, ignoring Basic credentials");
            }
            return self.verify_certificate(peer);
        }

        match basic {
            Some(basic) => self.verify_password(basic),
            None => Err(AuthError::NoCredential),
        }
    }

    /// Authenticate a request to `bootstrap`, which only accepts passwords.
    ///
    /// A client certificate presented alongside Basic credentials is
    /// ignored; a client certificate on its own is not enough.
    pub fn authenticate_password_only(
        &self,
        peer: Option<&PeerCertificate>,
        basic: Option<&BasicCredentials>,
    ) -> Result<Principal, AuthError> {
        match basic {
            Some(basic) => self.verify_password(basic),
            None => {
                if peer.is_some() {
                    tracing::warn!("Bootstrap attempted with a client certificate only");
                }
                Err(AuthError::NoCredential)
            }
        }
    }

    fn verify_password(&self, basic: &BasicCredentials) -> Result<Principal, AuthError> {
        if self.credentials.verify(&basic.username, basic.password()) {
            Ok(Principal::password(basic.username.clone()))
        } else {
            Err(AuthError::InvalidPassword)
        }
    }

    fn verify_certificate(&self, peer: &PeerCertificate) -> Result<Principal, AuthError> {
        let (_, cert) = X509Certificate::from_der(&peer.der)
            .map_err(|e| AuthError::invalid_certificate(format!("unparseable: {e}")))?;

        if !cert.validity().is_valid() {
            return Err(AuthError::invalid_certificate(format!(
                "outside validity window ({} - {})",
                cert.validity().not_before,
                cert.validity().not_after
            )));
        }

        let delegated =
            self.chain_verification == ChainVerification::Delegated && peer.chain_verified;
        if !delegated {
            self.anchor
                .verify_signed(&cert)
                .map_err(AuthError::InvalidCertificate)?;
        }

        // Revocation is not checked.

        let issuer = cert.issuer().to_string();
        if normalize_dn(&issuer) != normalize_dn(&self.expected_issuer) {
            return Err(AuthError::identity_mismatch(format!(
                "issuer '{issuer}' is not '{}'",
                self.expected_issuer
            )));
        }

        let subject = cert.subject().to_string();
        if let Some(pattern) = &self.subject_pattern {
            if !glob_match(pattern, &subject) {
                return Err(AuthError::identity_mismatch(format!(
                    "subject '{subject}' does not match '{pattern}'"
                )));
            }
        }

        let attributes = cert
            .subject()
            .iter_attributes()
            .map(|attr| {
                let name = oid2abbrev(attr.attr_type(), oid_registry())
                    .map(str::to_string)
                    .unwrap_or_else(|_| attr.attr_type().to_id_string());
                let value = attr
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|_| hex::encode(attr.as_slice()));
                (name, value)
            })
            .collect();

        tracing::debug!("Authenticated client certificate '{}'", subject);
        Ok(Principal::certificate(subject, attributes))
    }
}

/// Compare-ready form of a rendered DN: no spaces around separators.
fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| {
            rdn.split('=')
                .map(str::trim)
                .collect::<Vec<_>>()
                .join("=")
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Match `text` against `pattern`, where `*` matches any run of characters.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}
