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

//! Integration tests for HTTP Basic authentication

use crate::integration::{
    basic_header, CsrPost, TestServer, ENROLL_PASSWORD, ENROLL_USER, PATH_SIMPLEENROLL,
    TEST_001_CSR,
};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use base64::prelude::*;

async fn enroll_with_authorization(server: &TestServer, authorization: &str) -> StatusCode {
    let request = Request::builder()
        .method(Method::POST)
        .uri(PATH_SIMPLEENROLL)
        .header("content-type", "application/pkcs10")
        .header("content-transfer-encoding", "base64")
        .header("authorization", authorization)
        .body(Body::from(BASE64_STANDARD.encode(TEST_001_CSR)))
        .unwrap();
    server.send(request).await.status
}

#[tokio::test]
async fn test_valid_credentials() {
    let server = TestServer::start();
    let status =
        enroll_with_authorization(&server, &basic_header(ENROLL_USER, ENROLL_PASSWORD)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_missing_credentials_challenge() {
    let server = TestServer::start();

    let response = server
        .send(CsrPost::new(PATH_SIMPLEENROLL, TEST_001_CSR).build())
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.header("www-authenticate"), Some("Basic realm=\"EST\""));
    assert_eq!(response.text(), "Unauthorized");
}

#[tokio::test]
async fn test_wrong_password() {
    let server = TestServer::start();
    let status = enroll_with_authorization(&server, &basic_header(ENROLL_USER, "wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_user() {
    let server = TestServer::start();
    let status = enroll_with_authorization(&server, &basic_header("mallory", "anything")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_malformed_headers() {
    let server = TestServer::start();

    for header in [
        "Basic",
        "Basic !!!not-base64!!!",
        "Bearer abc.def.ghi",
        &format!("Basic {}", BASE64_STANDARD.encode("no-colon")),
    ] {
        let status = enroll_with_authorization(&server, header).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{header}");
    }
}

#[tokio::test]
async fn test_password_may_contain_colon() {
    let server = TestServer::start();
    server
        .ctx
        .credentials()
        .change_password(ENROLL_USER, "pa:ss:word")
        .unwrap();

    let status = enroll_with_authorization(&server, &basic_header(ENROLL_USER, "pa:ss:word")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_auth_checked_before_csr() {
    let server = TestServer::start();

    let response = server
        .send(
            CsrPost::new(PATH_SIMPLEENROLL, b"garbage")
                .basic(ENROLL_USER, "wrong")
                .build(),
        )
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}
