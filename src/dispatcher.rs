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

//! EST endpoint dispatcher.
//!
//! Every well-known EST resource is an [`Endpoint`]. [`dispatch`] enforces
//! the method and content type of the endpoint, then runs the stages in a
//! fixed order: authenticate, validate the CSR, issue, encode. Each stage
//! fails with its own typed error and [`DispatchError::status`] is the one
//! place those errors become HTTP status codes.

use std::sync::Arc;
use std::time::Instant;

use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use crate::anchor::TrustAnchor;
use crate::auth::{Authenticator, BasicCredentials, PeerCertificate, Principal};
use crate::config::ServerConfig;
use crate::credentials::CredentialStore;
use crate::csr::{CertificateRequest, CsrValidator};
use crate::error::{AuthError, IssuanceError, Result, ValidationError};
use crate::issuance::{IssuanceEngine, IssuedCertificate, Profile, SigningPolicy};
use crate::metrics::MetricsCollector;
use crate::registry::DeviceRegistry;
use crate::types::{content_types, encode_certs_only, operations, TransferEncoding};

/// A well-known EST resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    /// `GET /cacerts`
    CaCerts,
    /// `POST /simpleenroll`
    SimpleEnroll,
    /// `POST /simplereenroll`
    SimpleReenroll,
    /// `POST /bootstrap`
    Bootstrap,
}

impl Endpoint {
    /// Every endpoint, in table order.
    pub const ALL: [Endpoint; 4] = [
        Self::CaCerts,
        Self::SimpleEnroll,
        Self::SimpleReenroll,
        Self::Bootstrap,
    ];

    /// Resolve an operation name (`"cacerts"`) or a full well-known path.
    pub fn from_path(path: &str) -> Option<Self> {
        let operation = path
            .strip_prefix(operations::WELL_KNOWN_PREFIX)
            .unwrap_or(path)
            .trim_matches('/');

        match operation {
            operations::CACERTS => Some(Self::CaCerts),
            operations::SIMPLE_ENROLL => Some(Self::SimpleEnroll),
            operations::SIMPLE_REENROLL => Some(Self::SimpleReenroll),
            operations::BOOTSTRAP => Some(Self::Bootstrap),
            _ => None,
        }
    }

    /// Operation name, the last path segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CaCerts => operations::CACERTS,
            Self::SimpleEnroll => operations::SIMPLE_ENROLL,
            Self::SimpleReenroll => operations::SIMPLE_REENROLL,
            Self::Bootstrap => operations::BOOTSTRAP,
        }
    }

    /// Full request path.
    pub fn path(&self) -> String {
        format!("{}/{}", operations::WELL_KNOWN_PREFIX, self.as_str())
    }

    /// The only method the endpoint accepts.
    pub fn method(&self) -> Method {
        match self {
            Self::CaCerts => Method::GET,
            Self::SimpleEnroll | Self::SimpleReenroll | Self::Bootstrap => Method::POST,
        }
    }

    /// Whether the endpoint signs certificates.
    pub fn issues_certificates(&self) -> bool {
        !matches!(self, Self::CaCerts)
    }

    fn response_content_type(&self) -> &'static str {
        match self {
            Self::CaCerts => content_types::PKCS7_MIME,
            Self::SimpleEnroll | Self::SimpleReenroll | Self::Bootstrap => {
                content_types::PKCS7_CERTS_ONLY
            }
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a request handler needs, built once at startup.
#[derive(Debug)]
pub struct ServerContext {
    config: ServerConfig,
    anchor: Arc<TrustAnchor>,
    credentials: Arc<CredentialStore>,
    authenticator: Authenticator,
    validator: CsrValidator,
    engine: IssuanceEngine,
    enrollment_policy: SigningPolicy,
    bootstrap_policy: SigningPolicy,
    metrics: MetricsCollector,
    registry: DeviceRegistry,
    started_at: OffsetDateTime,
}

impl ServerContext {
    /// Assemble a context from loaded key material.
    pub fn new(config: ServerConfig, anchor: TrustAnchor, credentials: CredentialStore) -> Self {
        let anchor = Arc::new(anchor);
        let credentials = Arc::new(credentials);
        let authenticator = Authenticator::new(credentials.clone(), anchor.clone(), &config.auth);

        Self {
            validator: CsrValidator::new(config.csr.clone()),
            engine: IssuanceEngine::new(),
            enrollment_policy: SigningPolicy::for_profile(Profile::Enrollment, &config.signing),
            bootstrap_policy: SigningPolicy::for_profile(Profile::Bootstrap, &config.signing),
            metrics: MetricsCollector::new(),
            registry: DeviceRegistry::with_retention(config.est.device_retention_days),
            started_at: OffsetDateTime::now_utc(),
            config,
            anchor,
            credentials,
            authenticator,
        }
    }

    /// Load the anchor and credential database named by `config`.
    pub fn load(config: ServerConfig) -> Result<Self> {
        let anchor = TrustAnchor::load(&config.ca)?;
        let credentials = CredentialStore::load(
            &config.credentials.user_db,
            config.credentials.pbkdf2_iterations,
        )?;
        if credentials.is_empty() {
            tracing::warn!(
                "No password users in {}; bootstrap cannot succeed",
                config.credentials.user_db.display()
            );
        }
        Ok(Self::new(config, anchor, credentials))
    }

    /// Configuration the context was built from.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The CA trust anchor.
    pub fn anchor(&self) -> &TrustAnchor {
        &self.anchor
    }

    /// The password credential store.
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// The issuance engine.
    pub fn engine(&self) -> &IssuanceEngine {
        &self.engine
    }

    /// Request metrics.
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Issued-device registry.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// When the context was built.
    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }
}

/// One EST request as seen by the dispatcher.
#[derive(Debug, Clone)]
pub struct EstRequest {
    /// Target endpoint.
    pub endpoint: Endpoint,
    /// HTTP method.
    pub method: Method,
    /// `Content-Type` header.
    pub content_type: Option<String>,
    /// `Content-Transfer-Encoding` header.
    pub transfer_encoding: Option<String>,
    /// Client certificate from the TLS session.
    pub peer: Option<PeerCertificate>,
    /// HTTP Basic credentials.
    pub basic: Option<BasicCredentials>,
    /// Request body.
    pub body: Vec<u8>,
}

impl EstRequest {
    /// A request with the endpoint's own method and nothing else.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            method: endpoint.method(),
            content_type: None,
            transfer_encoding: None,
            peer: None,
            basic: None,
            body: Vec::new(),
        }
    }

    /// A POST carrying a CSR with `Content-Type: application/pkcs10`.
    pub fn with_csr(endpoint: Endpoint, body: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: Some(content_types::PKCS10.to_string()),
            body: body.into(),
            ..Self::new(endpoint)
        }
    }

    /// Build a request from HTTP parts.
    pub fn from_parts(
        endpoint: Endpoint,
        method: Method,
        headers: &HeaderMap,
        peer: Option<PeerCertificate>,
        body: Vec<u8>,
    ) -> Self {
        let header_str = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Self {
            endpoint,
            method,
            content_type: header_str(header::CONTENT_TYPE),
            transfer_encoding: headers
                .get("content-transfer-encoding")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            peer,
            basic: headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(BasicCredentials::from_authorization),
            body,
        }
    }

    /// Set the client certificate.
    pub fn peer(mut self, peer: PeerCertificate) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Set Basic credentials.
    pub fn basic(mut self, username: &str, password: &str) -> Self {
        self.basic = Some(BasicCredentials::new(username, password));
        self
    }

    /// Set `Content-Transfer-Encoding`.
    pub fn transfer_encoding(mut self, value: &str) -> Self {
        self.transfer_encoding = Some(value.to_string());
        self
    }
}

/// The wire response produced by [`dispatch`].
#[derive(Debug, Clone)]
pub struct EstResponse {
    /// Status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Vec<u8>,
}

impl EstResponse {
    fn pkcs7(endpoint: Endpoint, encoding: TransferEncoding, body: Vec<u8>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(endpoint.response_content_type()),
        );
        if let Some(value) = encoding.header_value() {
            headers.insert("content-transfer-encoding", HeaderValue::from_static(value));
        }
        Self {
            status: StatusCode::OK,
            headers,
            body,
        }
    }

    fn error(endpoint: Endpoint, err: &DispatchError) -> Self {
        let status = err.status();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(content_types::TEXT_PLAIN),
        );
        if status == StatusCode::UNAUTHORIZED {
            headers.insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"EST\""),
            );
        }
        if status == StatusCode::METHOD_NOT_ALLOWED {
            if let Ok(allow) = HeaderValue::from_str(endpoint.method().as_str()) {
                headers.insert(header::ALLOW, allow);
            }
        }
        Self {
            status,
            headers,
            body: status.canonical_reason().unwrap_or("Error").as_bytes().to_vec(),
        }
    }

    /// Header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl IntoResponse for EstResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

/// Every way a request can fail.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The endpoint does not accept this method.
    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),

    /// The request body is not `application/pkcs10`.
    #[error("unsupported content type {0:?}")]
    UnsupportedMediaType(Option<String>),

    /// The endpoint is switched off by configuration.
    #[error("endpoint disabled")]
    Disabled,

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The CSR was rejected.
    #[error("invalid CSR: {0}")]
    Validation(#[from] ValidationError),

    /// Issuance failed.
    #[error("issuance failed: {0}")]
    Issuance(#[from] IssuanceError),

    /// The PKCS#7 response could not be built.
    #[error("response encoding failed: {0}")]
    Encoding(String),

    /// The blocking task running the request did not finish.
    #[error("request worker failed: {0}")]
    Worker(String),
}

impl DispatchError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Disabled => StatusCode::NOT_FOUND,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Issuance(IssuanceError::PolicyViolation(_)) => StatusCode::BAD_REQUEST,
            Self::Issuance(IssuanceError::IdentityMismatch(_)) => StatusCode::FORBIDDEN,
            Self::Issuance(IssuanceError::SigningFailure(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Encoding(_) | Self::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short error kind for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MethodNotAllowed(_) => "method_not_allowed",
            Self::UnsupportedMediaType(_) => "unsupported_media_type",
            Self::Disabled => "disabled",
            Self::Auth(AuthError::NoCredential) => "no_credential",
            Self::Auth(AuthError::InvalidCertificate(_)) => "invalid_certificate",
            Self::Auth(AuthError::InvalidPassword) => "invalid_password",
            Self::Auth(AuthError::IdentityMismatch(_)) => "ra_policy_mismatch",
            Self::Validation(ValidationError::MalformedEncoding(_)) => "malformed_encoding",
            Self::Validation(ValidationError::MalformedAsn1(_)) => "malformed_asn1",
            Self::Validation(ValidationError::SelfSignatureInvalid) => "self_signature_invalid",
            Self::Validation(ValidationError::WeakKey(_)) => "weak_key",
            Self::Validation(ValidationError::InvalidSubject(_)) => "invalid_subject",
            Self::Issuance(IssuanceError::PolicyViolation(_)) => "policy_violation",
            Self::Issuance(IssuanceError::IdentityMismatch(_)) => "identity_mismatch",
            Self::Issuance(IssuanceError::SigningFailure(_)) => "signing_failure",
            Self::Encoding(_) => "encoding_failure",
            Self::Worker(_) => "worker_failure",
        }
    }
}

/// Handle one EST request.
///
/// Password hashing, CSR verification and signing run on tokio's blocking
/// pool. Never fails: errors become status-only responses and their detail
/// goes to the log.
pub async fn dispatch(ctx: &Arc<ServerContext>, request: EstRequest) -> EstResponse {
    let endpoint = request.endpoint;
    let method = request.method.clone();
    let start = Instant::now();

    let worker_ctx = Arc::clone(ctx);
    let result = tokio::task::spawn_blocking(move || handle(&worker_ctx, &request))
        .await
        .unwrap_or_else(|e| Err(DispatchError::Worker(e.to_string())));

    ctx.metrics
        .record_operation(endpoint, start.elapsed(), result.is_ok())
        .await;

    match result {
        Ok(Handled { body, issued }) => {
            if let Some((issued, principal)) = issued {
                ctx.metrics.record_issuance().await;
                ctx.registry.record(endpoint, &principal, &issued);
            }
            tracing::info!(
                "{} {} -> 200 ({} bytes)",
                method,
                endpoint.path(),
                body.len()
            );
            EstResponse::pkcs7(endpoint, ctx.config.est.response_encoding, body)
        }
        Err(e) => {
            tracing::warn!(
                endpoint = endpoint.as_str(),
                kind = e.kind(),
                "{} {} -> {}: {}",
                method,
                endpoint.path(),
                e.status().as_u16(),
                e
            );
            EstResponse::error(endpoint, &e)
        }
    }
}

struct Handled {
    body: Vec<u8>,
    issued: Option<(IssuedCertificate, Principal)>,
}

fn handle(ctx: &ServerContext, request: &EstRequest) -> std::result::Result<Handled, DispatchError> {
    let endpoint = request.endpoint;
    if request.method != endpoint.method() {
        return Err(DispatchError::MethodNotAllowed(request.method.clone()));
    }

    match endpoint {
        Endpoint::CaCerts => {
            let body = encode(ctx, &ctx.anchor.distribution_certificates())?;
            Ok(Handled { body, issued: None })
        }
        Endpoint::SimpleEnroll => {
            require_pkcs10(request)?;
            let principal = ctx
                .authenticator
                .authenticate(request.peer.as_ref(), request.basic.as_ref())?;
            let csr = validate(ctx, request)?;
            let issued = ctx
                .engine
                .issue(&csr, &principal, &ctx.anchor, &ctx.enrollment_policy)?;
            finish(ctx, issued, principal)
        }
        Endpoint::SimpleReenroll => {
            require_pkcs10(request)?;
            let principal = ctx
                .authenticator
                .authenticate(request.peer.as_ref(), request.basic.as_ref())?;
            let csr = validate(ctx, request)?;
            let issued = ctx
                .engine
                .renew(&csr, &principal, &ctx.anchor, &ctx.enrollment_policy)?;
            finish(ctx, issued, principal)
        }
        Endpoint::Bootstrap => {
            if !ctx.config.est.bootstrap_enabled {
                return Err(DispatchError::Disabled);
            }
            require_pkcs10(request)?;
            let principal = ctx
                .authenticator
                .authenticate_password_only(request.peer.as_ref(), request.basic.as_ref())?;
            let csr = validate(ctx, request)?;
            let issued = ctx
                .engine
                .issue(&csr, &principal, &ctx.anchor, &ctx.bootstrap_policy)?;
            finish(ctx, issued, principal)
        }
    }
}

fn require_pkcs10(request: &EstRequest) -> std::result::Result<(), DispatchError> {
    let media_type = request
        .content_type
        .as_deref()
        .and_then(|v| v.split(';').next())
        .map(str::trim);

    match media_type {
        Some(t) if t.eq_ignore_ascii_case(content_types::PKCS10) => Ok(()),
        _ => Err(DispatchError::UnsupportedMediaType(request.content_type.clone())),
    }
}

fn validate(
    ctx: &ServerContext,
    request: &EstRequest,
) -> std::result::Result<CertificateRequest, DispatchError> {
    let encoding = TransferEncoding::from_header(request.transfer_encoding.as_deref());
    Ok(ctx.validator.validate(&request.body, encoding)?)
}

fn finish(
    ctx: &ServerContext,
    issued: IssuedCertificate,
    principal: Principal,
) -> std::result::Result<Handled, DispatchError> {
    let body = encode(ctx, std::slice::from_ref(&issued.certificate))?;
    Ok(Handled {
        body,
        issued: Some((issued, principal)),
    })
}

fn encode(
    ctx: &ServerContext,
    certs: &[x509_cert::Certificate],
) -> std::result::Result<Vec<u8>, DispatchError> {
    encode_certs_only(certs, ctx.config.est.response_encoding)
        .map_err(|e| DispatchError::Encoding(e.to_string()))
}
