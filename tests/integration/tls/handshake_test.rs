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

//! End-to-end tests over a real TLS listener

use std::net::SocketAddr;
use std::sync::Arc;

use base64::prelude::*;
use der::Encode;
use rcgen::KeyPair;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use usg_est_server::config::ChainVerification;
use usg_est_server::types::decode_certs_only;
use usg_est_server::{EstServer, TransferEncoding};

use crate::integration::{csr_for, TestCa, TestServer, PATH_CACERTS, PATH_SIMPLEENROLL};

struct Running {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<usg_est_server::Result<()>>,
}

impl Running {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        self.handle.await.unwrap().unwrap();
    }
}

async fn launch(server: &TestServer) -> Running {
    let est = EstServer::bind(server.ctx.clone()).await.unwrap();
    let addr = est.local_addr().unwrap();
    let (shutdown, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(est.run_until(async {
        let _ = stopped.await;
    }));
    Running {
        addr,
        shutdown,
        handle,
    }
}

fn connector(ca: &TestCa, identity: Option<(&rcgen::Certificate, &KeyPair)>) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(CertificateDer::from(ca.der())).unwrap();

    let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots);

    let config = match identity {
        Some((cert, key)) => builder
            .with_client_auth_cert(
                vec![cert.der().clone()],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
            )
            .unwrap(),
        None => builder.with_no_client_auth(),
    };
    TlsConnector::from(Arc::new(config))
}

/// Send one HTTP/1.1 request and read the response status and body.
async fn exchange(
    connector: &TlsConnector,
    addr: SocketAddr,
    request: &[u8],
) -> std::io::Result<(u16, Vec<u8>)> {
    let tcp = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(server_name, tcp).await?;
    tls.write_all(request).await?;
    tls.flush().await?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match tls.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        if let Some(parsed) = parse_response(&buf) {
            return Ok(parsed);
        }
    }
    parse_response(&buf).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "incomplete response")
    })
}

fn parse_response(buf: &[u8]) -> Option<(u16, Vec<u8>)> {
    let header_end = buf.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&buf[..header_end]).ok()?;
    let status = head.split_whitespace().nth(1)?.parse().ok()?;
    let content_length: usize = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0);

    let body = &buf[header_end + 4..];
    (body.len() >= content_length).then(|| (status, body[..content_length].to_vec()))
}

fn get_request(path: &str) -> Vec<u8> {
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").into_bytes()
}

fn csr_request(path: &str, csr: &[u8]) -> Vec<u8> {
    let body = BASE64_STANDARD.encode(csr);
    format!(
        "POST {path} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Content-Type: application/pkcs10\r\n\
         Content-Transfer-Encoding: base64\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
    .into_bytes()
}

#[tokio::test]
async fn test_cacerts_over_tls() {
    let server = TestServer::start();
    let running = launch(&server).await;

    let (status, body) = exchange(
        &connector(&server.ca, None),
        running.addr,
        &get_request(PATH_CACERTS),
    )
    .await
    .unwrap();

    assert_eq!(status, 200);
    let certs = decode_certs_only(&body, TransferEncoding::Base64).unwrap();
    assert_eq!(certs.len(), 1);
    assert_eq!(certs[0].to_der().unwrap(), server.ca.der());

    let summary = server.ctx.metrics().get_summary().await;
    assert!(summary.tls.total_handshakes >= 1);

    running.stop().await;
}

#[tokio::test]
async fn test_enroll_with_client_certificate_over_tls() {
    let server = TestServer::start();
    let running = launch(&server).await;
    let (ra, ra_key) = server.ca.client_cert("EST Registration Authority");

    let (status, body) = exchange(
        &connector(&server.ca, Some((&ra, &ra_key))),
        running.addr,
        &csr_request(PATH_SIMPLEENROLL, &csr_for("tls-device")),
    )
    .await
    .unwrap();

    assert_eq!(status, 200, "{}", String::from_utf8_lossy(&body));
    let certs = decode_certs_only(&body, TransferEncoding::Base64).unwrap();
    assert_eq!(certs.len(), 1);

    let device = server.ctx.registry().get("tls-device").unwrap();
    assert_eq!(device.principal, "CN=EST Registration Authority");
    let summary = server.ctx.metrics().get_summary().await;
    assert_eq!(summary.tls.client_certificates, 1);

    running.stop().await;
}

#[tokio::test]
async fn test_enroll_without_credentials_over_tls() {
    let server = TestServer::start();
    let running = launch(&server).await;

    let (status, _) = exchange(
        &connector(&server.ca, None),
        running.addr,
        &csr_request(PATH_SIMPLEENROLL, &csr_for("tls-device")),
    )
    .await
    .unwrap();

    assert_eq!(status, 401);

    running.stop().await;
}

#[tokio::test]
async fn test_delegated_verification_accepts_anchor_issued_client() {
    let server =
        TestServer::with_config(|builder| builder.chain_verification(ChainVerification::Delegated));
    let running = launch(&server).await;
    let (ra, ra_key) = server.ca.client_cert("EST Registration Authority");

    let (status, _) = exchange(
        &connector(&server.ca, Some((&ra, &ra_key))),
        running.addr,
        &csr_request(PATH_SIMPLEENROLL, &csr_for("delegated-device")),
    )
    .await
    .unwrap();

    assert_eq!(status, 200);

    running.stop().await;
}

#[tokio::test]
async fn test_delegated_verification_rejects_foreign_client() {
    let server =
        TestServer::with_config(|builder| builder.chain_verification(ChainVerification::Delegated));
    let running = launch(&server).await;
    let foreign = TestCa::new("Foreign CA");
    let (cert, key) = foreign.client_cert("EST Registration Authority");

    let result = exchange(
        &connector(&server.ca, Some((&cert, &key))),
        running.addr,
        &csr_request(PATH_SIMPLEENROLL, &csr_for("foreign-device")),
    )
    .await;

    assert!(
        !matches!(result, Ok((200, _))),
        "foreign client must not enroll: {result:?}"
    );
    assert!(server.ctx.registry().is_empty());

    running.stop().await;
}
