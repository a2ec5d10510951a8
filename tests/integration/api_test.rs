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

//! Integration tests for the JSON monitoring API

use crate::integration::{
    csr_for, CsrPost, TestServer, BOOTSTRAP_PASSWORD, BOOTSTRAP_USER, ENROLL_PASSWORD,
    ENROLL_USER, PATH_BOOTSTRAP, PATH_CACERTS, PATH_SIMPLEENROLL, TEST_001_CSR,
};
use axum::http::StatusCode;
use serde_json::Value;

async fn json(server: &TestServer, uri: &str) -> Value {
    let response = server.get(uri).await;
    assert_eq!(response.status, StatusCode::OK, "{uri}");
    assert_eq!(response.header("content-type"), Some("application/json"));
    serde_json::from_slice(&response.body).unwrap()
}

#[tokio::test]
async fn test_status() {
    let server = TestServer::start();
    let status = json(&server, "/api/status").await;

    assert_eq!(status["service"], "usg-est-server");
    assert_eq!(status["protocol"], "RFC 7030");
    assert_eq!(status["status"], "running");
    assert_eq!(status["version"], usg_est_server::VERSION);
}

#[tokio::test]
async fn test_stats_track_operations() {
    let server = TestServer::start();

    server.get(PATH_CACERTS).await;
    server
        .send(
            CsrPost::new(PATH_BOOTSTRAP, &csr_for("stats-device"))
                .basic(BOOTSTRAP_USER, BOOTSTRAP_PASSWORD)
                .build(),
        )
        .await;
    server
        .send(
            CsrPost::new(PATH_SIMPLEENROLL, TEST_001_CSR)
                .basic(ENROLL_USER, ENROLL_PASSWORD)
                .build(),
        )
        .await;
    server
        .send(
            CsrPost::new(PATH_SIMPLEENROLL, TEST_001_CSR)
                .basic(ENROLL_USER, "wrong")
                .build(),
        )
        .await;

    let stats = json(&server, "/api/stats").await;
    assert_eq!(stats["total_requests"], 4);
    assert_eq!(stats["bootstrap_requests"], 1);
    assert_eq!(stats["enrollment_requests"], 2);
    assert_eq!(stats["failed_requests"], 1);
    assert_eq!(stats["certificates_issued"], 2);
    assert_eq!(stats["total_devices"], 2);
    assert_eq!(stats["enrolled_devices"], 1);
    assert_eq!(stats["endpoints"]["simpleenroll"]["failed"], 1);
    assert_eq!(stats["endpoints"]["cacerts"]["success"], 1);
}

#[tokio::test]
async fn test_devices_listing() {
    let server = TestServer::start();

    for cn in ["dev-a", "dev-b"] {
        let response = server
            .send(
                CsrPost::new(PATH_BOOTSTRAP, &csr_for(cn))
                    .basic(BOOTSTRAP_USER, BOOTSTRAP_PASSWORD)
                    .build(),
            )
            .await;
        assert_eq!(response.status, StatusCode::OK);
    }

    let devices = json(&server, "/api/devices").await;
    let devices = devices.as_array().unwrap();
    assert_eq!(devices.len(), 2);
    assert!(devices.iter().all(|d| d["status"] == "bootstrapped"));
    assert!(devices.iter().all(|d| d["auth_method"] == "password"));

    let recent = json(&server, "/api/devices/recent").await;
    assert_eq!(recent.as_array().unwrap().len(), 2);

    let recent = json(&server, "/api/devices/recent?hours=0").await;
    assert!(recent.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_recent_devices_bad_query() {
    let server = TestServer::start();
    let response = server.get("/api/devices/recent?hours=lots").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_recent_devices_widest_window() {
    let server = TestServer::start();
    let response = server
        .send(
            CsrPost::new(PATH_BOOTSTRAP, &csr_for("dev-wide"))
                .basic(BOOTSTRAP_USER, BOOTSTRAP_PASSWORD)
                .build(),
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);

    let recent = json(&server, "/api/devices/recent?hours=4294967295").await;
    let recent = recent.as_array().unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0]["device_id"], "dev-wide");
}
