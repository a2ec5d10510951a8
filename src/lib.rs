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

//! # usg-est-server
//!
//! A Rust implementation of an RFC 7030 EST (Enrollment over Secure Transport) server.
//!
//! The server runs a single CA. Devices and Registration Authorities (RAs)
//! obtain certificates over HTTPS:
//!
//! - **cacerts**: anyone may fetch the CA certificate chain
//! - **simpleenroll / simplereenroll**: an RA client certificate or a password
//! - **bootstrap**: password only, for first contact before a device has a certificate
//!
//! ## Request pipeline
//!
//! Every enrollment request passes through the same stages, in order:
//!
//! 1. [`auth::Authenticator`] decides who is calling. A client certificate,
//!    when presented, decides the outcome alone; a bad certificate is never
//!    rescued by a good password.
//! 2. [`csr::CsrValidator`] decodes the CSR, checks its self-signature,
//!    key strength and subject.
//! 3. [`issuance::IssuanceEngine`] signs a certificate under the configured
//!    profile. CSR extensions are never copied.
//! 4. [`types::encode_certs_only`] wraps the result in a PKCS#7 certs-only
//!    SignedData.
//!
//! [`dispatcher::dispatch`] runs the pipeline and is the only place where
//! errors become HTTP status codes.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use usg_est_server::{EstServer, ServerConfig, ServerContext};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::load("/etc/est/server.toml")?;
//!     let ctx = Arc::new(ServerContext::load(config)?);
//!
//!     EstServer::bind(ctx).await?.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Cargo Features
//!
//! - `metrics-prometheus` (default): `/metrics` in the Prometheus text format
//!
//! ## RFC 7030 Compliance
//!
//! This library implements:
//! - Section 4.1: Distribution of CA Certificates
//! - Section 4.2: Simple Enrollment and Re-enrollment
//! - Section 3.2.3: HTTP Basic authentication
//! - Section 3.3.2: TLS client certificate authentication
//!
//! Full CMC, server-side key generation and CSR attributes are not offered.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod anchor;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod csr;
pub mod dispatcher;
pub mod error;
pub mod issuance;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod tls;
pub mod types;

// Re-export main types at crate root for convenience
pub use anchor::TrustAnchor;
pub use auth::{AuthMethod, Authenticator, BasicCredentials, PeerCertificate, Principal};
pub use config::{ServerConfig, ServerConfigBuilder};
pub use credentials::CredentialStore;
pub use csr::{CertificateRequest, CsrValidator};
pub use dispatcher::{dispatch, DispatchError, Endpoint, EstRequest, EstResponse, ServerContext};
pub use error::{AuthError, EstError, IssuanceError, Result, ValidationError};
pub use issuance::{IssuanceEngine, IssuedCertificate, Profile, RaCredentials, SigningPolicy};
pub use server::{router, EstServer};
pub use types::TransferEncoding;

// Re-export x509_cert::Certificate for convenience
pub use x509_cert::Certificate;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name reported by `/api/status`.
pub const SERVER_NAME: &str = "usg-est-server";
