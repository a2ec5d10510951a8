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

//! HTTPS front end.
//!
//! [`router`] maps the EST well-known paths onto [`dispatch`] and adds the
//! JSON status API. [`EstServer`] terminates TLS with `tokio-rustls` and
//! attaches the client certificate of each connection to its requests as
//! a [`PeerCertificate`] extension. Nothing in a request can set that
//! extension; forwarded certificate headers are ignored.
//!
//! | Route | Method | Description |
//! |---|---|---|
//! | `/.well-known/est/{cacerts,simpleenroll,simplereenroll,bootstrap}` | per endpoint | EST |
//! | `/api/status` | GET | Service identification |
//! | `/api/stats` | GET | Request and issuance counters |
//! | `/api/devices` | GET | Device registry |
//! | `/api/devices/recent?hours=N` | GET | Devices active in the last N hours (default 24) |
//! | `/metrics` | GET | Prometheus text format (`metrics-prometheus` feature) |

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Extension, Json, Router};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::PeerCertificate;
use crate::config::ChainVerification;
use crate::dispatcher::{dispatch, Endpoint, EstRequest, ServerContext};
use crate::error::{EstError, Result};
use crate::metrics::{format_metrics_summary, TlsMetrics};
use crate::registry::DeviceRecord;
use crate::tls::build_server_config;

#[cfg(feature = "metrics-prometheus")]
use crate::metrics::prometheus::PrometheusExporter;

/// Default window for `/api/devices/recent`.
const DEFAULT_RECENT_HOURS: u32 = 24;

#[derive(Clone)]
struct AppState {
    ctx: Arc<ServerContext>,
    #[cfg(feature = "metrics-prometheus")]
    exporter: Arc<PrometheusExporter>,
}

/// Build the HTTP router for `ctx`.
pub fn router(ctx: Arc<ServerContext>) -> Result<Router> {
    let timeout = ctx.config().server.request_timeout();
    let state = AppState {
        #[cfg(feature = "metrics-prometheus")]
        exporter: Arc::new(
            PrometheusExporter::new("est_server")
                .map_err(|e| EstError::config(format!("Failed to register metrics: {e}")))?,
        ),
        ctx,
    };

    let app = Router::new()
        .route("/.well-known/est/:operation", any(est_handler))
        .route("/api/status", get(status_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/devices", get(devices_handler))
        .route("/api/devices/recent", get(recent_devices_handler));

    #[cfg(feature = "metrics-prometheus")]
    let app = app.route("/metrics", get(metrics_handler));

    Ok(app
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

async fn est_handler(
    State(state): State<AppState>,
    Path(operation): Path<String>,
    method: Method,
    headers: HeaderMap,
    peer: Option<Extension<PeerCertificate>>,
    body: Bytes,
) -> Response {
    let Some(endpoint) = Endpoint::from_path(&operation) else {
        tracing::debug!("Unknown EST operation '{}'", operation);
        return StatusCode::NOT_FOUND.into_response();
    };

    let request = EstRequest::from_parts(
        endpoint,
        method,
        &headers,
        peer.map(|Extension(peer)| peer),
        body.to_vec(),
    );
    dispatch(&state.ctx, request).await.into_response()
}

/// `/api/status` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Service name.
    pub service: String,
    /// Crate version.
    pub version: String,
    /// Implemented protocol.
    pub protocol: String,
    /// Always `running`.
    pub status: String,
}

async fn status_handler() -> Json<StatusReport> {
    Json(StatusReport {
        service: crate::SERVER_NAME.to_string(),
        version: crate::VERSION.to_string(),
        protocol: "RFC 7030".to_string(),
        status: "running".to_string(),
    })
}

/// Per-endpoint counters in `/api/stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    /// Requests handled.
    pub total: u64,
    /// Requests answered with 200.
    pub success: u64,
    /// Requests answered with an error.
    pub failed: u64,
    /// Mean handling time in milliseconds.
    pub avg_latency_ms: f64,
}

/// `/api/stats` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    /// Seconds since the server context was built.
    pub uptime_secs: i64,
    /// Requests across all EST endpoints.
    pub total_requests: u64,
    /// Requests to `/bootstrap`.
    pub bootstrap_requests: u64,
    /// Requests to `/simpleenroll` and `/simplereenroll`.
    pub enrollment_requests: u64,
    /// Requests answered with an error.
    pub failed_requests: u64,
    /// Certificates signed.
    pub certificates_issued: u64,
    /// Devices in the registry.
    pub total_devices: usize,
    /// Devices holding an enrollment certificate.
    pub enrolled_devices: usize,
    /// Devices active in the last 24 hours.
    pub active_devices: usize,
    /// Per-endpoint counters keyed by operation name.
    pub endpoints: BTreeMap<String, EndpointStats>,
    /// TLS handshake counters.
    pub tls: TlsStats,
}

/// TLS counters in `/api/stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsStats {
    /// Handshakes attempted.
    pub total_handshakes: u64,
    /// Handshakes that failed or timed out.
    pub failed_handshakes: u64,
    /// Handshakes with a client certificate.
    pub client_certificates: u64,
}

impl From<&TlsMetrics> for TlsStats {
    fn from(tls: &TlsMetrics) -> Self {
        Self {
            total_handshakes: tls.total_handshakes,
            failed_handshakes: tls.failed_handshakes,
            client_certificates: tls.client_certificates,
        }
    }
}

async fn stats_handler(State(state): State<AppState>) -> Json<StatsReport> {
    let ctx = &state.ctx;
    let summary = ctx.metrics().get_summary().await;
    let registry = ctx.registry();

    let endpoints = Endpoint::ALL
        .iter()
        .map(|endpoint| {
            let m = summary.endpoint(*endpoint);
            (
                endpoint.as_str().to_string(),
                EndpointStats {
                    total: m.total,
                    success: m.success,
                    failed: m.failed,
                    avg_latency_ms: m.average_duration().as_secs_f64() * 1000.0,
                },
            )
        })
        .collect();

    Json(StatsReport {
        uptime_secs: (OffsetDateTime::now_utc() - ctx.started_at()).whole_seconds(),
        total_requests: summary.total_requests(),
        bootstrap_requests: summary.bootstrap_requests(),
        enrollment_requests: summary.enrollment_requests(),
        failed_requests: summary.failed_requests(),
        certificates_issued: summary.certificates_issued,
        total_devices: registry.len(),
        enrolled_devices: registry.enrolled_count(),
        active_devices: registry.recent(DEFAULT_RECENT_HOURS).len(),
        endpoints,
        tls: TlsStats::from(&summary.tls),
    })
}

async fn devices_handler(State(state): State<AppState>) -> Json<Vec<DeviceRecord>> {
    Json(state.ctx.registry().all())
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    hours: Option<u32>,
}

async fn recent_devices_handler(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Json<Vec<DeviceRecord>> {
    let hours = query.hours.unwrap_or(DEFAULT_RECENT_HOURS);
    Json(state.ctx.registry().recent(hours))
}

#[cfg(feature = "metrics-prometheus")]
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.exporter.export(state.ctx.metrics()).await {
        Ok(text) => (
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Prometheus export failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    axum::http::header::CONTENT_TYPE,
                    crate::types::content_types::TEXT_PLAIN,
                )],
                "Internal Server Error",
            )
                .into_response()
        }
    }
}

/// TLS listener serving the router.
pub struct EstServer {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
}

impl std::fmt::Debug for EstServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish_non_exhaustive()
    }
}

impl EstServer {
    /// Bind the configured address and load the TLS identity.
    ///
    /// In `delegated` chain verification mode the TLS layer verifies client
    /// certificates against the CA before the request reaches the core.
    pub async fn bind(ctx: Arc<ServerContext>) -> Result<Self> {
        let config = ctx.config();
        let client_root = match config.auth.chain_verification {
            ChainVerification::Delegated => Some(ctx.anchor().certificate_der()),
            ChainVerification::Direct => None,
        };
        let tls = build_server_config(&config.tls, client_root)?;

        let listener = TcpListener::bind(config.server.bind).await?;
        let router = router(ctx.clone())?;

        tracing::info!(
            "EST server listening on https://{}",
            listener.local_addr()?
        );

        Ok(Self {
            ctx,
            listener,
            acceptor: TlsAcceptor::from(tls),
            router,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until Ctrl-C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` completes.
    ///
    /// New connections stop being accepted at shutdown; connections in
    /// flight finish on their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let chain_verified =
            self.ctx.config().auth.chain_verification == ChainVerification::Delegated;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let connection = Connection {
                        ctx: self.ctx.clone(),
                        acceptor: self.acceptor.clone(),
                        router: self.router.clone(),
                        chain_verified,
                    };
                    tokio::spawn(connection.serve(stream, remote));
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutting down EST server");
                    break;
                }
            }
        }

        let summary = self.ctx.metrics().get_summary().await;
        tracing::info!("{}", format_metrics_summary(&summary));
        Ok(())
    }
}

struct Connection {
    ctx: Arc<ServerContext>,
    acceptor: TlsAcceptor,
    router: Router,
    chain_verified: bool,
}

impl Connection {
    async fn serve(self, stream: TcpStream, remote: SocketAddr) {
        let metrics = self.ctx.metrics();
        let handshake_timeout = self.ctx.config().server.request_timeout();
        let start = Instant::now();

        let tls = match tokio::time::timeout(handshake_timeout, self.acceptor.accept(stream)).await
        {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                metrics.record_tls_handshake(start.elapsed(), false, false).await;
                tracing::debug!("TLS handshake with {} failed: {}", remote, e);
                return;
            }
            Err(_) => {
                metrics.record_tls_handshake(start.elapsed(), false, false).await;
                tracing::debug!("TLS handshake with {} timed out", remote);
                return;
            }
        };

        let peer = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|leaf| PeerCertificate {
                der: leaf.as_ref().to_vec(),
                chain_verified: self.chain_verified,
            });
        metrics
            .record_tls_handshake(start.elapsed(), true, peer.is_some())
            .await;
        tracing::debug!(
            "TLS session from {} ({})",
            remote,
            if peer.is_some() { "client certificate" } else { "anonymous" }
        );

        let router = self.router;
        let service = tower::service_fn(move |mut request: Request<Incoming>| {
            if let Some(peer) = &peer {
                request.extensions_mut().insert(peer.clone());
            }
            router.clone().oneshot(request)
        });

        if let Err(e) = auto::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(tls), TowerToHyperService::new(service))
            .await
        {
            tracing::debug!("Connection from {} ended with error: {}", remote, e);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
