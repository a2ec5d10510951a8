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

//! EST Server Command-Line Tool
//!
//! Runs the EST (RFC 7030) server and manages its password database and
//! Registration Authority certificates.
//!
//! # Usage
//!
//! ```text
//! est-server [OPTIONS] <COMMAND>
//!
//! Commands:
//!   serve         Run the server
//!   check-config  Load the configuration, CA and TLS identity, then exit
//!   user          Manage password users
//!   issue-ra      Issue a Registration Authority client certificate
//!
//! Options:
//!   -c, --config <PATH>   Path to configuration file [default: /etc/est/server.toml]
//!   -v, --verbose         Enable verbose output
//!   -h, --help            Print help
//!   -V, --version         Print version
//! ```
//!
//! # Examples
//!
//! ```bash
//! # Create the bootstrap user, reading the password from stdin
//! echo 's3cret' | est-server user add device-bootstrap
//!
//! # Provision an RA
//! est-server issue-ra --out-cert ra.pem --out-key ra.key
//!
//! # Run
//! est-server --config ./server.toml serve
//! ```

use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use zeroize::Zeroizing;

use usg_est_server::issuance::{RA_COMMON_NAME, RA_ORGANIZATION, RA_VALIDITY_DAYS};
use usg_est_server::{
    logging, tls, CredentialStore, EstServer, IssuanceEngine, ServerConfig, ServerContext,
    TrustAnchor,
};

/// EST Server Command-Line Tool
#[derive(Parser)]
#[command(name = "est-server")]
#[command(author = "U.S. Federal Government")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Certificate enrollment server using EST (RFC 7030)", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        value_name = "PATH",
        default_value = "/etc/est/server.toml"
    )]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve,

    /// Load the configuration, CA and TLS identity, then exit
    CheckConfig,

    /// Manage password users
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Issue a Registration Authority client certificate
    IssueRa {
        /// Subject commonName
        #[arg(long, default_value = RA_COMMON_NAME)]
        cn: String,

        /// Subject organization
        #[arg(long, default_value = RA_ORGANIZATION)]
        org: String,

        /// Validity in days
        #[arg(long, default_value_t = RA_VALIDITY_DAYS)]
        days: u32,

        /// Where to write the PEM certificate
        #[arg(long, value_name = "PATH")]
        out_cert: PathBuf,

        /// Where to write the PEM private key
        #[arg(long, value_name = "PATH")]
        out_key: PathBuf,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Add a user
    Add {
        /// Identity (username)
        identity: String,

        /// Password (read from stdin when omitted)
        #[arg(long)]
        password: Option<String>,
    },

    /// Remove a user
    Remove {
        /// Identity (username)
        identity: String,
    },

    /// Change a user's password
    Passwd {
        /// Identity (username)
        identity: String,

        /// New password (read from stdin when omitted)
        #[arg(long)]
        password: Option<String>,
    },

    /// List users
    List,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run_command(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_command(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::load(&cli.config)?;
    logging::init(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Serve => cmd_serve(config).await,
        Commands::CheckConfig => cmd_check_config(&cli.config, &config),
        Commands::User { action } => cmd_user(&config, action),
        Commands::IssueRa {
            cn,
            org,
            days,
            out_cert,
            out_key,
        } => cmd_issue_ra(&config, cn, org, *days, out_cert, out_key),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Arc::new(ServerContext::load(config)?);
    EstServer::bind(ctx).await?.run().await?;
    Ok(())
}

fn cmd_check_config(path: &Path, config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let anchor = TrustAnchor::load(&config.ca)?;
    let credentials = open_store(config)?;
    tls::build_server_config(&config.tls, Some(anchor.certificate_der()))?;

    println!("Configuration OK: {}", path.display());
    println!("  Listen:          {}", config.server.bind);
    println!("  CA subject:      {}", anchor.subject());
    println!("  Chain verify:    {:?}", config.auth.chain_verification);
    println!("  Password users:  {}", credentials.len());
    println!(
        "  Bootstrap:       {}",
        if config.est.bootstrap_enabled { "enabled" } else { "disabled" }
    );
    println!(
        "  Validity (days): {} enrollment, {} bootstrap",
        config.signing.validity_days, config.signing.bootstrap_validity_days
    );
    Ok(())
}

fn cmd_user(config: &ServerConfig, action: &UserAction) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(config)?;

    match action {
        UserAction::Add { identity, password } => {
            let password = password_arg(password.as_deref())?;
            store.add_user(identity, &password)?;
            store.save()?;
            println!("Added user '{}'", identity);
        }
        UserAction::Remove { identity } => {
            if !store.remove_user(identity)? {
                return Err(format!("user '{}' not found", identity).into());
            }
            store.save()?;
            println!("Removed user '{}'", identity);
        }
        UserAction::Passwd { identity, password } => {
            let password = password_arg(password.as_deref())?;
            store.change_password(identity, &password)?;
            store.save()?;
            println!("Changed password for '{}'", identity);
        }
        UserAction::List => {
            for user in store.list_users() {
                println!("{}", user);
            }
        }
    }
    Ok(())
}

fn cmd_issue_ra(
    config: &ServerConfig,
    cn: &str,
    org: &str,
    days: u32,
    out_cert: &Path,
    out_key: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let anchor = TrustAnchor::load(&config.ca)?;
    let ra = IssuanceEngine::new().issue_ra_certificate(&anchor, cn, org, days)?;

    std::fs::write(out_cert, &ra.certificate_pem)?;
    write_private_key(out_key, &ra.key_pem)?;

    println!("Issued RA certificate");
    println!("  Subject:     CN={}, O={}", cn, org);
    println!("  Serial:      {}", ra.serial);
    println!("  Not after:   {}", ra.not_after);
    println!("  Certificate: {}", out_cert.display());
    println!("  Private key: {}", out_key.display());
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn open_store(config: &ServerConfig) -> usg_est_server::Result<CredentialStore> {
    CredentialStore::load(
        &config.credentials.user_db,
        config.credentials.pbkdf2_iterations,
    )
}

/// The `--password` value, or the first line of stdin.
fn password_arg(arg: Option<&str>) -> Result<Zeroizing<String>, Box<dyn std::error::Error>> {
    if let Some(password) = arg {
        return Ok(Zeroizing::new(password.to_string()));
    }

    let mut line = Zeroizing::new(String::new());
    std::io::stdin().lock().read_line(&mut line)?;
    let password = Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string());
    if password.is_empty() {
        return Err("no password given on stdin".into());
    }
    Ok(password)
}

#[cfg(unix)]
fn write_private_key(path: &Path, pem: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(pem.as_bytes())
}

#[cfg(not(unix))]
fn write_private_key(path: &Path, pem: &str) -> std::io::Result<()> {
    std::fs::write(path, pem)
}
