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

//! Integration tests for TLS client certificate authentication
//!
//! The peer certificate is attached to the request the same way the
//! listener does after a handshake.

use crate::integration::{
    csr_for, CsrPost, TestCa, TestServer, ENROLL_PASSWORD, ENROLL_USER, PATH_SIMPLEENROLL,
    TEST_001_CSR,
};
use axum::http::StatusCode;
use time::{Duration, OffsetDateTime};

#[tokio::test]
async fn test_expired_certificate_does_not_fall_back_to_password() {
    let server = TestServer::start();
    let now = OffsetDateTime::now_utc();
    let (expired, _) = server.ca.client_cert_valid(
        "EST Registration Authority",
        now - Duration::days(30),
        now - Duration::days(1),
    );

    let response = server
        .send(
            CsrPost::new(PATH_SIMPLEENROLL, TEST_001_CSR)
                .peer(expired.der())
                .basic(ENROLL_USER, ENROLL_PASSWORD)
                .build(),
        )
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert!(server.ctx.registry().is_empty());
    assert_eq!(server.ctx.engine().serials().issued_count(), 0);
}

#[tokio::test]
async fn test_not_yet_valid_certificate() {
    let server = TestServer::start();
    let now = OffsetDateTime::now_utc();
    let (future, _) = server.ca.client_cert_valid(
        "EST Registration Authority",
        now + Duration::days(1),
        now + Duration::days(30),
    );

    let response = server
        .send(
            CsrPost::new(PATH_SIMPLEENROLL, &csr_for("device-1"))
                .peer(future.der())
                .build(),
        )
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_foreign_issuer_rejected() {
    let server = TestServer::start();
    let foreign = TestCa::new("Integration Test CA");
    let (cert, _) = foreign.client_cert("EST Registration Authority");

    let response = server
        .send(
            CsrPost::new(PATH_SIMPLEENROLL, &csr_for("device-1"))
                .peer(cert.der())
                .basic(ENROLL_USER, ENROLL_PASSWORD)
                .build(),
        )
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_garbage_certificate_rejected() {
    let server = TestServer::start();

    let response = server
        .send(
            CsrPost::new(PATH_SIMPLEENROLL, &csr_for("device-1"))
                .peer(b"\x30\x03\x02\x01\x00")
                .build(),
        )
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_subject_pattern() {
    let server =
        TestServer::with_config(|builder| builder.expected_subject_pattern("CN=RA-*"));
    let (allowed, _) = server.ca.client_cert("RA-01");
    let (denied, _) = server.ca.client_cert("device-1");

    let ok = server
        .send(
            CsrPost::new(PATH_SIMPLEENROLL, &csr_for("device-2"))
                .peer(allowed.der())
                .build(),
        )
        .await;
    assert_eq!(ok.status, StatusCode::OK, "{}", ok.text());

    let rejected = server
        .send(
            CsrPost::new(PATH_SIMPLEENROLL, &csr_for("device-2"))
                .peer(denied.der())
                .build(),
        )
        .await;
    assert_eq!(rejected.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_expected_issuer_override() {
    let server = TestServer::with_config(|builder| builder.expected_issuer("CN=Some Other CA"));
    let (cert, _) = server.ca.client_cert("EST Registration Authority");

    let response = server
        .send(
            CsrPost::new(PATH_SIMPLEENROLL, &csr_for("device-3"))
                .peer(cert.der())
                .build(),
        )
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}
