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

//! Request metrics for the EST endpoints.
//!
//! The dispatcher records every request against its [`Endpoint`]; the
//! listener records TLS handshakes. Summaries back the `/api/stats` JSON
//! and, with the `metrics-prometheus` feature, the `/metrics` exporter in
//! [`prometheus`].
//!
//! # Example
//!
//! ```no_run
//! use usg_est_server::dispatcher::Endpoint;
//! use usg_est_server::metrics::MetricsCollector;
//! use std::time::Instant;
//!
//! # async fn example() {
//! let metrics = MetricsCollector::new();
//!
//! let start = Instant::now();
//! // ... handle a request ...
//! metrics.record_operation(Endpoint::SimpleEnroll, start.elapsed(), true).await;
//!
//! let summary = metrics.get_summary().await;
//! println!("Enrollment success rate: {:.2}%", summary.endpoint(Endpoint::SimpleEnroll).success_rate());
//! # }
//! ```

#[cfg(feature = "metrics-prometheus")]
pub mod prometheus;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::dispatcher::Endpoint;

/// Metrics for one endpoint.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct OperationMetrics {
    /// Total number of requests.
    pub total: u64,
    /// Number of successful requests.
    pub success: u64,
    /// Number of failed requests.
    pub failed: u64,
    /// Total duration of all requests (nanoseconds).
    #[serde(skip)]
    pub total_duration_nanos: u64,
    /// Minimum request duration (nanoseconds).
    #[serde(skip)]
    pub min_duration_nanos: u64,
    /// Maximum request duration (nanoseconds).
    #[serde(skip)]
    pub max_duration_nanos: u64,
}

impl OperationMetrics {
    /// Success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.success as f64 / self.total as f64) * 100.0
        }
    }

    /// Average request duration.
    pub fn average_duration(&self) -> Duration {
        if self.total == 0 {
            Duration::from_nanos(0)
        } else {
            Duration::from_nanos(self.total_duration_nanos / self.total)
        }
    }

    /// Minimum request duration.
    pub fn min_duration(&self) -> Duration {
        Duration::from_nanos(self.min_duration_nanos)
    }

    /// Maximum request duration.
    pub fn max_duration(&self) -> Duration {
        Duration::from_nanos(self.max_duration_nanos)
    }

    fn record(&mut self, duration: Duration, success: bool) {
        self.total += 1;
        if success {
            self.success += 1;
        } else {
            self.failed += 1;
        }

        let duration_nanos = duration.as_nanos() as u64;
        self.total_duration_nanos += duration_nanos;

        if self.min_duration_nanos == 0 || duration_nanos < self.min_duration_nanos {
            self.min_duration_nanos = duration_nanos;
        }
        if duration_nanos > self.max_duration_nanos {
            self.max_duration_nanos = duration_nanos;
        }
    }
}

/// TLS handshake metrics.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TlsMetrics {
    /// Total number of TLS handshakes.
    pub total_handshakes: u64,
    /// Number of successful TLS handshakes.
    pub successful_handshakes: u64,
    /// Number of failed TLS handshakes.
    pub failed_handshakes: u64,
    /// Handshakes whose client presented a certificate.
    pub client_certificates: u64,
    /// Total duration of all TLS handshakes (nanoseconds).
    #[serde(skip)]
    pub total_handshake_duration_nanos: u64,
}

impl TlsMetrics {
    /// Handshake success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total_handshakes == 0 {
            0.0
        } else {
            (self.successful_handshakes as f64 / self.total_handshakes as f64) * 100.0
        }
    }

    /// Average handshake duration.
    pub fn average_handshake_duration(&self) -> Duration {
        if self.total_handshakes == 0 {
            Duration::from_nanos(0)
        } else {
            Duration::from_nanos(self.total_handshake_duration_nanos / self.total_handshakes)
        }
    }
}

/// Snapshot of all collected metrics.
#[derive(Debug, Default, Clone)]
pub struct MetricsSummary {
    /// Per-endpoint request metrics.
    pub endpoints: HashMap<Endpoint, OperationMetrics>,
    /// Certificates signed.
    pub certificates_issued: u64,
    /// TLS handshake metrics.
    pub tls: TlsMetrics,
}

impl MetricsSummary {
    /// Metrics for one endpoint (zeroed if it has seen no traffic).
    pub fn endpoint(&self, endpoint: Endpoint) -> OperationMetrics {
        self.endpoints.get(&endpoint).cloned().unwrap_or_default()
    }

    /// Requests across all endpoints.
    pub fn total_requests(&self) -> u64 {
        self.endpoints.values().map(|m| m.total).sum()
    }

    /// Successful requests across all endpoints.
    pub fn total_successful(&self) -> u64 {
        self.endpoints.values().map(|m| m.success).sum()
    }

    /// Failed requests across all endpoints.
    pub fn failed_requests(&self) -> u64 {
        self.endpoints.values().map(|m| m.failed).sum()
    }

    /// Requests to `/bootstrap`.
    pub fn bootstrap_requests(&self) -> u64 {
        self.endpoint(Endpoint::Bootstrap).total
    }

    /// Requests to `/simpleenroll` and `/simplereenroll`.
    pub fn enrollment_requests(&self) -> u64 {
        self.endpoint(Endpoint::SimpleEnroll).total + self.endpoint(Endpoint::SimpleReenroll).total
    }

    /// Overall success rate as a percentage.
    pub fn overall_success_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            (self.total_successful() as f64 / total as f64) * 100.0
        }
    }
}

/// Thread-safe metrics collector.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

#[derive(Default)]
struct MetricsCollectorInner {
    endpoints: RwLock<HashMap<Endpoint, OperationMetrics>>,
    certificates_issued: RwLock<u64>,
    tls: RwLock<TlsMetrics>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dispatched request.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - The endpoint that handled the request
    /// * `duration` - How long the request took
    /// * `success` - Whether the request succeeded
    pub async fn record_operation(&self, endpoint: Endpoint, duration: Duration, success: bool) {
        let mut endpoints = self.inner.endpoints.write().await;
        endpoints.entry(endpoint).or_default().record(duration, success);
    }

    /// Record a signed certificate.
    pub async fn record_issuance(&self) {
        *self.inner.certificates_issued.write().await += 1;
    }

    /// Record a TLS handshake.
    pub async fn record_tls_handshake(
        &self,
        duration: Duration,
        success: bool,
        client_certificate: bool,
    ) {
        let mut tls = self.inner.tls.write().await;
        tls.total_handshakes += 1;

        if success {
            tls.successful_handshakes += 1;
        } else {
            tls.failed_handshakes += 1;
        }
        if client_certificate {
            tls.client_certificates += 1;
        }

        tls.total_handshake_duration_nanos += duration.as_nanos() as u64;
    }

    /// Get a summary of all collected metrics.
    pub async fn get_summary(&self) -> MetricsSummary {
        MetricsSummary {
            endpoints: self.inner.endpoints.read().await.clone(),
            certificates_issued: *self.inner.certificates_issued.read().await,
            tls: self.inner.tls.read().await.clone(),
        }
    }

    /// Reset all metrics to zero.
    pub async fn reset(&self) {
        self.inner.endpoints.write().await.clear();
        *self.inner.certificates_issued.write().await = 0;
        *self.inner.tls.write().await = TlsMetrics::default();
    }
}

/// Format a metrics summary as human-readable text.
pub fn format_metrics_summary(summary: &MetricsSummary) -> String {
    let mut output = String::new();

    output.push_str("=== EST Server Metrics Summary ===\n\n");
    output.push_str(&format!("Total Requests: {}\n", summary.total_requests()));
    output.push_str(&format!(
        "Overall Success Rate: {:.2}%\n",
        summary.overall_success_rate()
    ));
    output.push_str(&format!(
        "Certificates Issued: {}\n\n",
        summary.certificates_issued
    ));

    for endpoint in Endpoint::ALL {
        output.push_str(&format_operation_metrics(
            &endpoint.path(),
            &summary.endpoint(endpoint),
        ));
    }

    output.push_str("--- TLS Handshakes ---\n");
    output.push_str(&format!("Total: {}\n", summary.tls.total_handshakes));
    output.push_str(&format!("Success Rate: {:.2}%\n", summary.tls.success_rate()));
    output.push_str(&format!(
        "With Client Certificate: {}\n",
        summary.tls.client_certificates
    ));
    output.push_str(&format!(
        "Avg Duration: {:?}\n\n",
        summary.tls.average_handshake_duration()
    ));

    output
}

fn format_operation_metrics(name: &str, metrics: &OperationMetrics) -> String {
    if metrics.total == 0 {
        return String::new();
    }

    let mut output = String::new();
    output.push_str(&format!("--- {} ---\n", name));
    output.push_str(&format!("Total: {}\n", metrics.total));
    output.push_str(&format!("Success: {}\n", metrics.success));
    output.push_str(&format!("Failed: {}\n", metrics.failed));
    output.push_str(&format!("Success Rate: {:.2}%\n", metrics.success_rate()));
    output.push_str(&format!("Avg Duration: {:?}\n", metrics.average_duration()));
    output.push_str(&format!("Min Duration: {:?}\n", metrics.min_duration()));
    output.push_str(&format!("Max Duration: {:?}\n\n", metrics.max_duration()));
    output
}
