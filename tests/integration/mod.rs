//! Integration test utilities and helpers
//!
//! Every test gets its own CA, TLS identity and password database in a
//! temporary directory. Requests are driven through the router in-process,
//! except for the tests under `tls/` which go over a real socket.

pub mod operations;

mod api_test;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use base64::prelude::*;
use http_body_util::BodyExt;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};
use tower::ServiceExt;
use usg_est_server::types::{content_types, decode_certs_only};
use usg_est_server::{
    router, Certificate, CredentialStore, PeerCertificate, ServerConfig, ServerConfigBuilder,
    ServerContext, TransferEncoding,
};

/// EST operation paths
pub const PATH_CACERTS: &str = "/.well-known/est/cacerts";
pub const PATH_SIMPLEENROLL: &str = "/.well-known/est/simpleenroll";
pub const PATH_SIMPLEREENROLL: &str = "/.well-known/est/simplereenroll";
pub const PATH_BOOTSTRAP: &str = "/.well-known/est/bootstrap";

/// Password users created for every test server
pub const BOOTSTRAP_USER: &str = "device-bootstrap";
pub const BOOTSTRAP_PASSWORD: &str = "bootstrap-secret";
pub const ENROLL_USER: &str = "test-001";
pub const ENROLL_PASSWORD: &str = "enroll-secret";

/// RSA-2048 CSR for `CN=test-001`
pub const TEST_001_CSR: &[u8] = include_bytes!("../fixtures/csr/test-001.csr.der");

/// A throwaway CA.
pub struct TestCa {
    pub cert_pem: String,
    pub key_pem: String,
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestCa {
    pub fn new(common_name: &str) -> Self {
        let key = KeyPair::generate().expect("CA key");
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.distinguished_name.push(DnType::OrganizationName, "EST Test");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let cert = params.self_signed(&key).expect("CA certificate");

        Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert,
            key,
        }
    }

    /// DER of the CA certificate.
    pub fn der(&self) -> Vec<u8> {
        self.cert.der().to_vec()
    }

    /// A clientAuth certificate for `common_name`, valid for a year.
    pub fn client_cert(&self, common_name: &str) -> (rcgen::Certificate, KeyPair) {
        let now = OffsetDateTime::now_utc();
        self.client_cert_valid(common_name, now - Duration::hours(1), now + Duration::days(365))
    }

    /// A clientAuth certificate for `common_name` with an explicit window.
    pub fn client_cert_valid(
        &self,
        common_name: &str,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> (rcgen::Certificate, KeyPair) {
        let key = KeyPair::generate().expect("client key");
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.not_before = not_before;
        params.not_after = not_after;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .expect("client certificate");
        (cert, key)
    }

    /// A serverAuth identity for `localhost` and 127.0.0.1.
    pub fn server_identity(&self) -> (String, String) {
        let key = KeyPair::generate().expect("server key");
        let mut params =
            CertificateParams::new(vec!["localhost".to_string()]).expect("server params");
        params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        params.distinguished_name.push(DnType::CommonName, "localhost");
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .expect("server certificate");
        (cert.pem(), key.serialize_pem())
    }
}

/// A fully loaded server context backed by files in a temporary directory.
pub struct TestServer {
    pub ca: TestCa,
    pub ctx: Arc<ServerContext>,
    pub app: Router,
    dir: TempDir,
}

impl TestServer {
    pub fn start() -> Self {
        Self::with_config(|builder| builder)
    }

    pub fn with_config(configure: impl FnOnce(ServerConfigBuilder) -> ServerConfigBuilder) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let ca = TestCa::new("Integration Test CA");
        let (server_cert, server_key) = ca.server_identity();

        std::fs::write(dir.path().join("ca.pem"), &ca.cert_pem).unwrap();
        std::fs::write(dir.path().join("ca.key"), &ca.key_pem).unwrap();
        std::fs::write(dir.path().join("server.pem"), server_cert).unwrap();
        std::fs::write(dir.path().join("server.key"), server_key).unwrap();

        let user_db = dir.path().join("users.db");
        let store = CredentialStore::load(&user_db, 1000).unwrap();
        store.add_user(BOOTSTRAP_USER, BOOTSTRAP_PASSWORD).unwrap();
        store.add_user(ENROLL_USER, ENROLL_PASSWORD).unwrap();
        store.save().unwrap();

        let builder = ServerConfig::builder()
            .bind("127.0.0.1:0".parse().unwrap())
            .tls_identity(dir.path().join("server.pem"), dir.path().join("server.key"))
            .ca_files(dir.path().join("ca.pem"), dir.path().join("ca.key"))
            .user_db(&user_db)
            .pbkdf2_iterations(1000);
        let config = configure(builder).build().expect("valid config");

        let ctx = Arc::new(ServerContext::load(config).expect("context loads"));
        let app = router(ctx.clone()).expect("router");

        Self { ca, ctx, app, dir }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        TestResponse {
            status,
            headers,
            body: body.to_vec(),
        }
    }
}

/// A CSR POST builder.
pub struct CsrPost {
    path: &'static str,
    csr: Vec<u8>,
    basic: Option<(String, String)>,
    peer: Option<PeerCertificate>,
}

impl CsrPost {
    pub fn new(path: &'static str, csr: &[u8]) -> Self {
        Self {
            path,
            csr: csr.to_vec(),
            basic: None,
            peer: None,
        }
    }

    pub fn basic(mut self, username: &str, password: &str) -> Self {
        self.basic = Some((username.to_string(), password.to_string()));
        self
    }

    pub fn peer(mut self, der: &[u8]) -> Self {
        self.peer = Some(PeerCertificate::unverified(der));
        self
    }

    pub fn build(self) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.path)
            .header(header::CONTENT_TYPE, content_types::PKCS10)
            .header("content-transfer-encoding", "base64");
        if let Some((username, password)) = &self.basic {
            builder = builder.header(header::AUTHORIZATION, basic_header(username, password));
        }

        let mut request = builder
            .body(Body::from(BASE64_STANDARD.encode(&self.csr)))
            .unwrap();
        if let Some(peer) = self.peer {
            request.extensions_mut().insert(peer);
        }
        request
    }
}

pub fn basic_header(username: &str, password: &str) -> String {
    format!(
        "Basic {}",
        BASE64_STANDARD.encode(format!("{username}:{password}"))
    )
}

/// Captured response.
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode a PKCS#7 certs-only body using its transfer encoding.
    pub fn certificates(&self) -> Vec<Certificate> {
        let content_type = self.header("content-type").unwrap_or_default();
        assert!(
            content_type.starts_with(content_types::PKCS7_MIME),
            "not a PKCS#7 response: {} {}",
            self.status,
            self.text()
        );
        let encoding = TransferEncoding::from_header(self.header("content-transfer-encoding"));
        decode_certs_only(&self.body, encoding).expect("valid certs-only body")
    }
}

/// A fresh ECDSA CSR for `common_name`.
pub fn csr_for(common_name: &str) -> Vec<u8> {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.serialize_request(&key).unwrap().der().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_fixture_loads_users() {
        let server = TestServer::start();
        assert_eq!(server.ctx.credentials().len(), 2);
        assert!(server.path("users.db").exists());
        assert!(server
            .ctx
            .credentials()
            .verify(ENROLL_USER, ENROLL_PASSWORD));
    }
}
