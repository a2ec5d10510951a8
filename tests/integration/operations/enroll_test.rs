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

//! Integration tests for POST /simpleenroll operation

use crate::integration::{
    csr_for, CsrPost, TestServer, ENROLL_PASSWORD, ENROLL_USER, PATH_SIMPLEENROLL, TEST_001_CSR,
};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use base64::prelude::*;
use der::Encode;
use usg_est_server::registry::DeviceStatus;
use x509_parser::prelude::{FromDer, X509Certificate};

fn pem_to_der(pem: &str) -> Vec<u8> {
    let body: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    BASE64_STANDARD.decode(body).unwrap()
}

#[tokio::test]
async fn test_successful_enrollment() {
    let server = TestServer::start();

    let response = server
        .send(
            CsrPost::new(PATH_SIMPLEENROLL, TEST_001_CSR)
                .basic(ENROLL_USER, ENROLL_PASSWORD)
                .build(),
        )
        .await;

    assert_eq!(response.status, StatusCode::OK, "{}", response.text());
    let certs = response.certificates();
    assert_eq!(certs.len(), 1);

    let der = certs[0].to_der().unwrap();
    let (_, cert) = X509Certificate::from_der(&der).unwrap();
    assert_eq!(cert.subject().to_string(), "CN=test-001");
    assert_eq!(cert.issuer().to_string(), server.ctx.anchor().subject());
    server
        .ctx
        .anchor()
        .verify_signed(&cert)
        .expect("signed by the anchor");

    let device = server.ctx.registry().get("test-001").expect("device recorded");
    assert_eq!(device.status, DeviceStatus::Enrolled);
    assert_eq!(device.principal, ENROLL_USER);
}

#[tokio::test]
async fn test_enrollment_with_binary_body() {
    let server = TestServer::start();

    let request = Request::builder()
        .method(Method::POST)
        .uri(PATH_SIMPLEENROLL)
        .header("content-type", "application/pkcs10")
        .header(
            "authorization",
            crate::integration::basic_header(ENROLL_USER, ENROLL_PASSWORD),
        )
        .body(Body::from(TEST_001_CSR.to_vec()))
        .unwrap();
    let response = server.send(request).await;

    assert_eq!(response.status, StatusCode::OK, "{}", response.text());
}

#[tokio::test]
async fn test_tampered_csr_rejected() {
    let server = TestServer::start();

    let mut csr = TEST_001_CSR.to_vec();
    let last = csr.len() - 1;
    csr[last] ^= 0x01;

    let response = server
        .send(
            CsrPost::new(PATH_SIMPLEENROLL, &csr)
                .basic(ENROLL_USER, ENROLL_PASSWORD)
                .build(),
        )
        .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.text(), "Bad Request");
    assert_eq!(server.ctx.engine().serials().issued_count(), 0);
}

#[tokio::test]
async fn test_weak_key_rejected() {
    let server = TestServer::start();
    let (ra, _) = server.ca.client_cert("EST Registration Authority");
    let csr = pem_to_der(include_str!("../../fixtures/csr/rsa1024.csr.pem"));

    let response = server
        .send(CsrPost::new(PATH_SIMPLEENROLL, &csr).peer(ra.der()).build())
        .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_requested_ca_extension_not_honored() {
    let server = TestServer::start();
    let (ra, _) = server.ca.client_cert("EST Registration Authority");
    let csr = pem_to_der(include_str!("../../fixtures/csr/ca-request.csr.pem"));

    let response = server
        .send(CsrPost::new(PATH_SIMPLEENROLL, &csr).peer(ra.der()).build())
        .await;

    assert_eq!(response.status, StatusCode::OK, "{}", response.text());
    let der = response.certificates()[0].to_der().unwrap();
    let (_, cert) = X509Certificate::from_der(&der).unwrap();
    assert_eq!(cert.subject().to_string(), "CN=evil-ca");
    let ca = cert
        .basic_constraints()
        .unwrap()
        .map(|bc| bc.value.ca)
        .unwrap_or(false);
    assert!(!ca, "issued certificate must not be a CA");
}

#[tokio::test]
async fn test_ra_enrolls_any_device() {
    let server = TestServer::start();
    let (ra, _) = server.ca.client_cert("EST Registration Authority");

    let response = server
        .send(
            CsrPost::new(PATH_SIMPLEENROLL, &csr_for("device-42"))
                .peer(ra.der())
                .build(),
        )
        .await;

    assert_eq!(response.status, StatusCode::OK, "{}", response.text());
    let device = server.ctx.registry().get("device-42").unwrap();
    assert_eq!(device.principal, "CN=EST Registration Authority");
}

#[tokio::test]
async fn test_wrong_content_type() {
    let server = TestServer::start();

    let request = Request::builder()
        .method(Method::POST)
        .uri(PATH_SIMPLEENROLL)
        .header("content-type", "application/json")
        .header(
            "authorization",
            crate::integration::basic_header(ENROLL_USER, ENROLL_PASSWORD),
        )
        .body(Body::from("{}"))
        .unwrap();
    let response = server.send(request).await;

    assert_eq!(response.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn test_get_not_allowed() {
    let server = TestServer::start();

    let response = server.get(PATH_SIMPLEENROLL).await;

    assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.header("allow"), Some("POST"));
}

#[tokio::test]
async fn test_garbage_body_is_bad_request() {
    let server = TestServer::start();

    let response = server
        .send(
            CsrPost::new(PATH_SIMPLEENROLL, b"not a certificate request")
                .basic(ENROLL_USER, ENROLL_PASSWORD)
                .build(),
        )
        .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}
