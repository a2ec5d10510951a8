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

//! Prometheus metrics exporter.
//!
//! Renders a [`MetricsCollector`] in the Prometheus text format for the
//! `/metrics` route.
//!
//! # Example
//!
//! ```no_run
//! use usg_est_server::metrics::MetricsCollector;
//! use usg_est_server::metrics::prometheus::PrometheusExporter;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let metrics = MetricsCollector::new();
//! let exporter = PrometheusExporter::new("est_server")?;
//!
//! let prometheus_text = exporter.export(&metrics).await?;
//! println!("{}", prometheus_text);
//! # Ok(())
//! # }
//! ```

use std::error::Error as StdError;

use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::dispatcher::Endpoint;
use crate::metrics::{MetricsCollector, MetricsSummary, OperationMetrics};

/// Prometheus exporter for EST server metrics.
pub struct PrometheusExporter {
    registry: Registry,

    // Request counters
    requests_total: IntCounterVec,
    requests_success: IntCounterVec,
    requests_failed: IntCounterVec,
    certificates_issued: IntCounter,

    // Request duration gauges
    request_duration_min_seconds: GaugeVec,
    request_duration_max_seconds: GaugeVec,
    request_duration_avg_seconds: GaugeVec,
    request_success_rate: GaugeVec,

    // TLS metrics
    tls_handshakes_total: IntCounter,
    tls_handshakes_failed: IntCounter,
    tls_client_certificates: IntCounter,
    tls_handshake_avg_seconds: Gauge,
}

impl std::fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusExporter").finish_non_exhaustive()
    }
}

impl PrometheusExporter {
    /// Create an exporter whose metric names start with `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if metrics cannot be registered with Prometheus.
    pub fn new(namespace: &str) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new(
                format!("{}_requests_total", namespace),
                "Total number of EST requests by endpoint",
            ),
            &["endpoint"],
        )?;

        let requests_success = IntCounterVec::new(
            Opts::new(
                format!("{}_requests_success_total", namespace),
                "Total number of successful EST requests by endpoint",
            ),
            &["endpoint"],
        )?;

        let requests_failed = IntCounterVec::new(
            Opts::new(
                format!("{}_requests_failed_total", namespace),
                "Total number of failed EST requests by endpoint",
            ),
            &["endpoint"],
        )?;

        let certificates_issued = IntCounter::with_opts(Opts::new(
            format!("{}_certificates_issued_total", namespace),
            "Total number of certificates signed",
        ))?;

        let request_duration_min_seconds = GaugeVec::new(
            Opts::new(
                format!("{}_request_duration_min_seconds", namespace),
                "Minimum EST request duration in seconds by endpoint",
            ),
            &["endpoint"],
        )?;

        let request_duration_max_seconds = GaugeVec::new(
            Opts::new(
                format!("{}_request_duration_max_seconds", namespace),
                "Maximum EST request duration in seconds by endpoint",
            ),
            &["endpoint"],
        )?;

        let request_duration_avg_seconds = GaugeVec::new(
            Opts::new(
                format!("{}_request_duration_avg_seconds", namespace),
                "Average EST request duration in seconds by endpoint",
            ),
            &["endpoint"],
        )?;

        let request_success_rate = GaugeVec::new(
            Opts::new(
                format!("{}_request_success_rate", namespace),
                "EST request success rate (0-100) by endpoint",
            ),
            &["endpoint"],
        )?;

        let tls_handshakes_total = IntCounter::with_opts(Opts::new(
            format!("{}_tls_handshakes_total", namespace),
            "Total number of TLS handshakes",
        ))?;

        let tls_handshakes_failed = IntCounter::with_opts(Opts::new(
            format!("{}_tls_handshakes_failed_total", namespace),
            "Total number of failed TLS handshakes",
        ))?;

        let tls_client_certificates = IntCounter::with_opts(Opts::new(
            format!("{}_tls_client_certificates_total", namespace),
            "TLS handshakes in which the client presented a certificate",
        ))?;

        let tls_handshake_avg_seconds = Gauge::with_opts(Opts::new(
            format!("{}_tls_handshake_avg_seconds", namespace),
            "Average TLS handshake duration in seconds",
        ))?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(requests_success.clone()))?;
        registry.register(Box::new(requests_failed.clone()))?;
        registry.register(Box::new(certificates_issued.clone()))?;
        registry.register(Box::new(request_duration_min_seconds.clone()))?;
        registry.register(Box::new(request_duration_max_seconds.clone()))?;
        registry.register(Box::new(request_duration_avg_seconds.clone()))?;
        registry.register(Box::new(request_success_rate.clone()))?;
        registry.register(Box::new(tls_handshakes_total.clone()))?;
        registry.register(Box::new(tls_handshakes_failed.clone()))?;
        registry.register(Box::new(tls_client_certificates.clone()))?;
        registry.register(Box::new(tls_handshake_avg_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            requests_success,
            requests_failed,
            certificates_issued,
            request_duration_min_seconds,
            request_duration_max_seconds,
            request_duration_avg_seconds,
            request_success_rate,
            tls_handshakes_total,
            tls_handshakes_failed,
            tls_client_certificates,
            tls_handshake_avg_seconds,
        })
    }

    /// Render the collector's current state in Prometheus text format.
    pub async fn export(
        &self,
        collector: &MetricsCollector,
    ) -> Result<String, Box<dyn StdError + Send + Sync>> {
        let summary = collector.get_summary().await;
        self.update_metrics(&summary);

        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        Ok(String::from_utf8(buffer)?)
    }

    fn update_metrics(&self, summary: &MetricsSummary) {
        for endpoint in Endpoint::ALL {
            self.update_endpoint_metrics(endpoint, &summary.endpoint(endpoint));
        }

        advance(&self.certificates_issued, summary.certificates_issued);
        advance(&self.tls_handshakes_total, summary.tls.total_handshakes);
        advance(&self.tls_handshakes_failed, summary.tls.failed_handshakes);
        advance(&self.tls_client_certificates, summary.tls.client_certificates);
        self.tls_handshake_avg_seconds
            .set(summary.tls.average_handshake_duration().as_secs_f64());
    }

    fn update_endpoint_metrics(&self, endpoint: Endpoint, metrics: &OperationMetrics) {
        let label = [endpoint.as_str()];

        advance(&self.requests_total.with_label_values(&label), metrics.total);
        advance(&self.requests_success.with_label_values(&label), metrics.success);
        advance(&self.requests_failed.with_label_values(&label), metrics.failed);

        if metrics.total == 0 {
            return;
        }

        self.request_duration_min_seconds
            .with_label_values(&label)
            .set(metrics.min_duration().as_secs_f64());
        self.request_duration_max_seconds
            .with_label_values(&label)
            .set(metrics.max_duration().as_secs_f64());
        self.request_duration_avg_seconds
            .with_label_values(&label)
            .set(metrics.average_duration().as_secs_f64());
        self.request_success_rate
            .with_label_values(&label)
            .set(metrics.success_rate());
    }

    /// The underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Move a counter up to `target`. Counters never go down, so a collector
/// reset leaves them where they are.
fn advance(counter: &IntCounter, target: u64) {
    let current = counter.get();
    if target > current {
        counter.inc_by(target - current);
    }
}
