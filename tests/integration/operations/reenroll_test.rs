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

//! Integration tests for POST /simplereenroll operation

use crate::integration::{
    csr_for, CsrPost, TestServer, ENROLL_PASSWORD, ENROLL_USER, PATH_SIMPLEENROLL,
    PATH_SIMPLEREENROLL, TEST_001_CSR,
};
use axum::http::StatusCode;
use der::Encode;
use x509_parser::prelude::{FromDer, X509Certificate};

#[tokio::test]
async fn test_successful_reenrollment() {
    let server = TestServer::start();
    let (current, _) = server.ca.client_cert("device-7");

    let response = server
        .send(
            CsrPost::new(PATH_SIMPLEREENROLL, &csr_for("device-7"))
                .peer(current.der())
                .build(),
        )
        .await;

    assert_eq!(response.status, StatusCode::OK, "{}", response.text());
    let der = response.certificates()[0].to_der().unwrap();
    let (_, cert) = X509Certificate::from_der(&der).unwrap();
    assert_eq!(cert.subject().to_string(), "CN=device-7");
    let (_, previous) = X509Certificate::from_der(current.der()).unwrap();
    assert_ne!(cert.raw_serial(), previous.raw_serial());
}

#[tokio::test]
async fn test_reenroll_subject_mismatch() {
    let server = TestServer::start();
    let (current, _) = server.ca.client_cert("device-7");

    let response = server
        .send(
            CsrPost::new(PATH_SIMPLEREENROLL, &csr_for("device-8"))
                .peer(current.der())
                .build(),
        )
        .await;

    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert!(server.ctx.registry().is_empty());
}

#[tokio::test]
async fn test_reenroll_with_password() {
    let server = TestServer::start();

    let response = server
        .send(
            CsrPost::new(PATH_SIMPLEREENROLL, TEST_001_CSR)
                .basic(ENROLL_USER, ENROLL_PASSWORD)
                .build(),
        )
        .await;

    assert_eq!(response.status, StatusCode::OK, "{}", response.text());
}

#[tokio::test]
async fn test_enroll_then_reenroll_with_issued_certificate() {
    let server = TestServer::start();
    let (ra, _) = server.ca.client_cert("EST Registration Authority");

    let first = server
        .send(
            CsrPost::new(PATH_SIMPLEENROLL, &csr_for("device-9"))
                .peer(ra.der())
                .build(),
        )
        .await;
    assert_eq!(first.status, StatusCode::OK);
    let issued = first.certificates()[0].to_der().unwrap();

    let second = server
        .send(
            CsrPost::new(PATH_SIMPLEREENROLL, &csr_for("device-9"))
                .peer(&issued)
                .build(),
        )
        .await;
    assert_eq!(second.status, StatusCode::OK, "{}", second.text());

    let device = server.ctx.registry().get("device-9").unwrap();
    assert_eq!(device.certificates_issued, 2);
    assert_eq!(device.principal, "CN=device-9");
}

#[tokio::test]
async fn test_reenroll_password_user_limited_to_own_name() {
    let server = TestServer::start();

    let response = server
        .send(
            CsrPost::new(PATH_SIMPLEREENROLL, &csr_for("someone-else"))
                .basic(ENROLL_USER, ENROLL_PASSWORD)
                .build(),
        )
        .await;

    assert_eq!(response.status, StatusCode::FORBIDDEN);
}
