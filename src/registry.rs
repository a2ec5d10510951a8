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

//! In-memory registry of devices that received certificates.
//!
//! A device is identified by the commonName of its CSR, or by the full
//! subject when the request has no commonName. The registry is process
//! local and starts empty. With a retention period set, devices idle for
//! longer are swept out while new certificates are recorded.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::auth::{AuthMethod, Principal};
use crate::dispatcher::Endpoint;
use crate::issuance::IssuedCertificate;

/// Enrollment state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Holds only a bootstrap certificate.
    Bootstrapped,
    /// Holds a certificate from simpleenroll or simplereenroll.
    Enrolled,
}

/// What the server knows about one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    /// Device identifier.
    pub device_id: String,
    /// Subject of the latest certificate.
    pub subject: String,
    /// Principal that requested the latest certificate.
    pub principal: String,
    /// How that principal authenticated.
    pub auth_method: AuthMethod,
    /// Enrollment state.
    pub status: DeviceStatus,
    /// Endpoint that issued the latest certificate.
    pub last_endpoint: Endpoint,
    /// Serial of the latest certificate.
    pub serial: String,
    /// Serial of the latest bootstrap certificate.
    pub bootstrap_serial: Option<String>,
    /// Serial of the latest enrollment certificate.
    pub enrolled_serial: Option<String>,
    /// Certificates issued to this device.
    pub certificates_issued: u32,
    /// First issuance.
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    /// Latest issuance.
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
    /// Expiry of the latest certificate.
    #[serde(with = "time::serde::rfc3339")]
    pub not_after: OffsetDateTime,
}

/// Minimum time between retention sweeps.
const SWEEP_INTERVAL: Duration = Duration::hours(1);

/// Thread-safe device registry.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceRecord>>,
    retention_days: Option<u32>,
    last_sweep: Mutex<Option<OffsetDateTime>>,
}

impl DeviceRegistry {
    /// Create an empty registry that keeps every device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry that drops devices idle for more than
    /// `days` days. Zero keeps every device.
    pub fn with_retention(days: u32) -> Self {
        Self {
            retention_days: (days > 0).then_some(days),
            ..Self::default()
        }
    }

    /// Record a certificate issued through `endpoint`.
    pub fn record(&self, endpoint: Endpoint, principal: &Principal, issued: &IssuedCertificate) {
        self.record_at(endpoint, principal, issued, OffsetDateTime::now_utc());
    }

    fn record_at(
        &self,
        endpoint: Endpoint,
        principal: &Principal,
        issued: &IssuedCertificate,
        now: OffsetDateTime,
    ) {
        let device_id = issued
            .common_name
            .clone()
            .unwrap_or_else(|| issued.subject.clone());
        let serial = issued.serial_hex();
        let status = match endpoint {
            Endpoint::Bootstrap => DeviceStatus::Bootstrapped,
            _ => DeviceStatus::Enrolled,
        };

        self.sweep_if_due(now);

        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        let record = devices
            .entry(device_id.clone())
            .or_insert_with(|| DeviceRecord {
                device_id: device_id.clone(),
                subject: issued.subject.clone(),
                principal: principal.id.clone(),
                auth_method: principal.method,
                status,
                last_endpoint: endpoint,
                serial: serial.clone(),
                bootstrap_serial: None,
                enrolled_serial: None,
                certificates_issued: 0,
                first_seen: now,
                last_activity: now,
                not_after: issued.not_after,
            });

        record.subject = issued.subject.clone();
        record.principal = principal.id.clone();
        record.auth_method = principal.method;
        record.status = status;
        record.last_endpoint = endpoint;
        record.serial = serial.clone();
        match status {
            DeviceStatus::Bootstrapped => record.bootstrap_serial = Some(serial),
            DeviceStatus::Enrolled => record.enrolled_serial = Some(serial),
        }
        record.certificates_issued += 1;
        record.last_activity = now;
        record.not_after = issued.not_after;

        tracing::debug!("Registry: {} is {:?}", device_id, status);
    }

    /// Look up one device.
    pub fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        self.read().get(device_id).cloned()
    }

    /// All devices, most recently active first.
    pub fn all(&self) -> Vec<DeviceRecord> {
        let mut devices: Vec<_> = self.read().values().cloned().collect();
        sort_recent_first(&mut devices);
        devices
    }

    /// Devices active within the last `hours` hours, most recent first.
    pub fn recent(&self, hours: u32) -> Vec<DeviceRecord> {
        self.recent_at(hours, OffsetDateTime::now_utc())
    }

    fn recent_at(&self, hours: u32, now: OffsetDateTime) -> Vec<DeviceRecord> {
        // A window reaching past the earliest representable time has no cutoff.
        let cutoff = now.checked_sub(Duration::hours(i64::from(hours)));
        let mut devices: Vec<_> = self
            .read()
            .values()
            .filter(|d| cutoff.map_or(true, |cutoff| d.last_activity > cutoff))
            .cloned()
            .collect();
        sort_recent_first(&mut devices);
        devices
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no device has been recorded.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Number of devices holding an enrollment certificate.
    pub fn enrolled_count(&self) -> usize {
        self.read()
            .values()
            .filter(|d| d.status == DeviceStatus::Enrolled)
            .count()
    }

    /// Drop devices idle for more than `days` days. Returns how many.
    pub fn cleanup(&self, days: u32) -> usize {
        self.cleanup_at(days, OffsetDateTime::now_utc())
    }

    fn cleanup_at(&self, days: u32, now: OffsetDateTime) -> usize {
        let Some(cutoff) = now.checked_sub(Duration::days(i64::from(days))) else {
            return 0;
        };
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        let before = devices.len();
        devices.retain(|_, d| d.last_activity >= cutoff);
        let removed = before - devices.len();
        if removed > 0 {
            tracing::info!("Removed {} idle device record(s)", removed);
        }
        removed
    }

    fn sweep_if_due(&self, now: OffsetDateTime) {
        let Some(days) = self.retention_days else {
            return;
        };
        {
            let mut last_sweep = self.last_sweep.lock().unwrap_or_else(|e| e.into_inner());
            if last_sweep.is_some_and(|at| now - at < SWEEP_INTERVAL) {
                return;
            }
            *last_sweep = Some(now);
        }
        self.cleanup_at(days, now);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, DeviceRecord>> {
        self.devices.read().unwrap_or_else(|e| e.into_inner())
    }
}

fn sort_recent_first(devices: &mut [DeviceRecord]) {
    devices.sort_by(|a, b| {
        b.last_activity
            .cmp(&a.last_activity)
            .then_with(|| a.device_id.cmp(&b.device_id))
    });
}
