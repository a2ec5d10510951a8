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

//! Logging setup for the EST server.
//!
//! Installs a `tracing` subscriber driven by the `[logging]` section:
//!
//! ```toml
//! [logging]
//! level = "info"
//! json = false
//! ```
//!
//! `RUST_LOG`, when set, overrides `level`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{EstError, Result};

/// Filter directive used when `RUST_LOG` is unset.
///
/// `verbose` raises the level to `debug`.
pub fn default_directive(config: &LoggingConfig, verbose: bool) -> String {
    if verbose {
        "debug".to_string()
    } else if config.level.trim().is_empty() {
        "info".to_string()
    } else {
        config.level.clone()
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails if the level is not a valid filter directive or a subscriber is
/// already installed.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive(config, verbose))
            .map_err(|e| EstError::config(format!("Invalid log level '{}': {e}", config.level)))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };

    installed.map_err(|e| EstError::config(format!("Logging already initialized: {e}")))
}
