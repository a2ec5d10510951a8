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

//! Integration tests for GET /cacerts operation

use crate::integration::{basic_header, CsrPost, TestServer, PATH_CACERTS, TEST_001_CSR};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use der::Encode;
use usg_est_server::types::content_types;
use usg_est_server::TransferEncoding;

#[tokio::test]
async fn test_successful_cacerts_retrieval() {
    let server = TestServer::start();

    let response = server.get(PATH_CACERTS).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.header("content-type"), Some(content_types::PKCS7_MIME));
    assert_eq!(response.header("content-transfer-encoding"), Some("base64"));

    let certs = response.certificates();
    assert_eq!(certs.len(), 1, "only the anchor is distributed");
    assert_eq!(certs[0].to_der().unwrap(), server.ca.der());
}

#[tokio::test]
async fn test_cacerts_base64_lines_are_wrapped() {
    let server = TestServer::start();

    let response = server.get(PATH_CACERTS).await;

    let text = response.text();
    assert!(text.lines().count() > 1);
    assert!(text.lines().all(|line| line.len() <= 64));
}

#[tokio::test]
async fn test_cacerts_binary_encoding() {
    let server =
        TestServer::with_config(|builder| builder.response_encoding(TransferEncoding::Binary));

    let response = server.get(PATH_CACERTS).await;

    assert_eq!(response.status, StatusCode::OK);
    assert!(response.header("content-transfer-encoding").is_none());
    assert_eq!(response.body[0], 0x30, "DER SEQUENCE");
    assert_eq!(response.certificates()[0].to_der().unwrap(), server.ca.der());
}

#[tokio::test]
async fn test_cacerts_ignores_bad_credentials() {
    let server = TestServer::start();

    let request = Request::builder()
        .uri(PATH_CACERTS)
        .header("authorization", basic_header("nobody", "wrong"))
        .body(Body::empty())
        .unwrap();
    let response = server.send(request).await;

    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_cacerts_rejects_post() {
    let server = TestServer::start();

    let response = server
        .send(CsrPost::new(PATH_CACERTS, TEST_001_CSR).build())
        .await;

    assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.header("allow"), Some("GET"));
}
