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

//! Password credential store.
//!
//! Each principal is stored as `identity:salt:verifier`, one per line, where
//! `verifier` is the hex PBKDF2-HMAC-SHA256 of the password keyed by the salt
//! string. Plaintext passwords are never stored.
//!
//! The in-memory set is an immutable snapshot behind an `Arc`. Readers clone
//! the `Arc` and never block provisioning; provisioning builds a new snapshot
//! and swaps it in whole.
//!
//! # Example
//!
//! ```no_run
//! use usg_est_server::credentials::CredentialStore;
//!
//! # fn example() -> usg_est_server::Result<()> {
//! let store = CredentialStore::load("/var/lib/est/users.db", 100_000)?;
//! store.add_user("device-001", "correct horse battery staple")?;
//! store.save()?;
//!
//! assert!(store.verify("device-001", "correct horse battery staple"));
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{EstError, Result};

/// Length of a derived verifier in bytes.
const VERIFIER_LEN: usize = 32;

/// Random bytes in a generated salt (hex-encoded on disk).
const SALT_BYTES: usize = 32;

/// Maximum accepted identity length.
const MAX_IDENTITY_LEN: usize = 128;

/// Salt used to burn the same PBKDF2 work for unknown identities.
const DUMMY_SALT: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One password principal.
#[derive(Clone)]
pub struct CredentialEntry {
    identity: String,
    salt: String,
    verifier: [u8; VERIFIER_LEN],
}

impl CredentialEntry {
    /// The principal identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn to_line(&self) -> String {
        format!("{}:{}:{}", self.identity, self.salt, hex::encode(self.verifier))
    }
}

impl std::fmt::Debug for CredentialEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialEntry")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Clone)]
struct Snapshot {
    entries: HashMap<String, CredentialEntry>,
}

/// Thread-safe credential store.
pub struct CredentialStore {
    snapshot: RwLock<Arc<Snapshot>>,
    iterations: u32,
    path: Option<PathBuf>,
    rng: SystemRandom,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("users", &self.len())
            .field("iterations", &self.iterations)
            .field("path", &self.path)
            .finish()
    }
}

impl CredentialStore {
    /// Create an empty in-memory store.
    pub fn new(iterations: u32) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            iterations,
            path: None,
            rng: SystemRandom::new(),
        }
    }

    /// Load a store from `path`.
    ///
    /// A missing file yields an empty store bound to that path, so that
    /// `user add` can create it.
    pub fn load(path: impl AsRef<Path>, iterations: u32) -> Result<Self> {
        let path = path.as_ref();
        let snapshot = match fs::read_to_string(path) {
            Ok(contents) => parse_database(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Credential database {} not found, starting empty", path.display());
                Snapshot::default()
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            "Loaded {} credential(s) from {}",
            snapshot.entries.len(),
            path.display()
        );

        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            iterations,
            path: Some(path.to_path_buf()),
            rng: SystemRandom::new(),
        })
    }

    /// Parse a store from database text.
    pub fn from_database(contents: &str, iterations: u32) -> Result<Self> {
        let store = Self::new(iterations);
        store.swap(parse_database(contents)?);
        Ok(store)
    }

    /// Verify a password for `identity` in constant time.
    ///
    /// Unknown identities run the same key derivation against a dummy salt
    /// so timing does not reveal whether the identity exists.
    pub fn verify(&self, identity: &str, password: &str) -> bool {
        let snapshot = self.current();
        match snapshot.entries.get(identity) {
            Some(entry) => {
                let derived = derive(password, &entry.salt, self.iterations);
                derived[..].ct_eq(&entry.verifier[..]).into()
            }
            None => {
                let _ = derive(password, DUMMY_SALT, self.iterations);
                false
            }
        }
    }

    /// Add a new principal.
    pub fn add_user(&self, identity: &str, password: &str) -> Result<()> {
        validate_identity(identity)?;
        if password.is_empty() {
            return Err(EstError::credential("password must not be empty"));
        }

        let entry = self.make_entry(identity, password)?;
        self.update(|snapshot| {
            if snapshot.entries.contains_key(identity) {
                return Err(EstError::credential(format!("user '{identity}' already exists")));
            }
            snapshot.entries.insert(identity.to_string(), entry);
            Ok(())
        })?;

        tracing::info!("Added credential for '{}'", identity);
        Ok(())
    }

    /// Replace the password of an existing principal.
    pub fn change_password(&self, identity: &str, password: &str) -> Result<()> {
        if password.is_empty() {
            return Err(EstError::credential("password must not be empty"));
        }

        let entry = self.make_entry(identity, password)?;
        self.update(|snapshot| match snapshot.entries.get_mut(identity) {
            Some(existing) => {
                *existing = entry;
                Ok(())
            }
            None => Err(EstError::credential(format!("user '{identity}' not found"))),
        })?;

        tracing::info!("Changed password for '{}'", identity);
        Ok(())
    }

    /// Remove a principal. Returns `false` if it did not exist.
    pub fn remove_user(&self, identity: &str) -> Result<bool> {
        let mut removed = false;
        self.update(|snapshot| {
            removed = snapshot.entries.remove(identity).is_some();
            Ok(())
        })?;

        if removed {
            tracing::info!("Removed credential for '{}'", identity);
        }
        Ok(removed)
    }

    /// Sorted list of known identities.
    pub fn list_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.current().entries.keys().cloned().collect();
        users.sort();
        users
    }

    /// Returns true if `identity` is known.
    pub fn contains(&self, identity: &str) -> bool {
        self.current().entries.contains_key(identity)
    }

    /// Number of principals.
    pub fn len(&self) -> usize {
        self.current().entries.len()
    }

    /// Returns true if the store has no principals.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the store back to the path it was loaded from.
    pub fn save(&self) -> Result<()> {
        match &self.path {
            Some(path) => self.save_to(path),
            None => Err(EstError::credential("store has no backing file")),
        }
    }

    /// Write the store to `path`, replacing the file atomically.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let snapshot = self.current();

        let mut entries: Vec<&CredentialEntry> = snapshot.entries.values().collect();
        entries.sort_by(|a, b| a.identity.cmp(&b.identity));

        let mut text = String::from("# identity:salt:verifier (PBKDF2-HMAC-SHA256)\n");
        for entry in entries {
            text.push_str(&entry.to_line());
            text.push('\n');
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, path)?;

        tracing::debug!("Saved credential database to {}", path.display());
        Ok(())
    }

    fn current(&self) -> Arc<Snapshot> {
        let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    fn swap(&self, snapshot: Snapshot) {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(snapshot);
    }

    fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Snapshot) -> Result<()>,
    {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let mut next = Snapshot::clone(&guard);
        f(&mut next)?;
        *guard = Arc::new(next);
        Ok(())
    }

    fn make_entry(&self, identity: &str, password: &str) -> Result<CredentialEntry> {
        let mut salt_bytes = [0u8; SALT_BYTES];
        self.rng
            .fill(&mut salt_bytes)
            .map_err(|_| EstError::credential("system RNG failure"))?;
        let salt = hex::encode(salt_bytes);
        let verifier = *derive(password, &salt, self.iterations);

        Ok(CredentialEntry {
            identity: identity.to_string(),
            salt,
            verifier,
        })
    }
}

fn derive(password: &str, salt: &str, iterations: u32) -> Zeroizing<[u8; VERIFIER_LEN]> {
    let mut out = Zeroizing::new([0u8; VERIFIER_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), iterations, &mut out[..]);
    out
}

fn validate_identity(identity: &str) -> Result<()> {
    if identity.is_empty() || identity.len() > MAX_IDENTITY_LEN {
        return Err(EstError::credential(format!(
            "identity must be 1..={MAX_IDENTITY_LEN} bytes"
        )));
    }
    if identity.contains(':') || identity.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(EstError::credential(
            "identity must not contain ':' or whitespace",
        ));
    }
    Ok(())
}

fn parse_database(contents: &str) -> Result<Snapshot> {
    let mut snapshot = Snapshot::default();

    for (idx, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line_no = idx + 1;
        let mut parts = line.splitn(3, ':');
        let (identity, salt, verifier_hex) = match (parts.next(), parts.next(), parts.next()) {
            (Some(i), Some(s), Some(v)) => (i, s, v),
            _ => {
                return Err(EstError::credential(format!(
                    "line {line_no}: expected identity:salt:verifier"
                )))
            }
        };

        validate_identity(identity)
            .map_err(|e| EstError::credential(format!("line {line_no}: {e}")))?;
        if salt.is_empty() {
            return Err(EstError::credential(format!("line {line_no}: empty salt")));
        }

        let decoded = hex::decode(verifier_hex)
            .map_err(|e| EstError::credential(format!("line {line_no}: bad verifier hex: {e}")))?;
        let verifier: [u8; VERIFIER_LEN] = decoded.as_slice().try_into().map_err(|_| {
            EstError::credential(format!(
                "line {line_no}: verifier must be {VERIFIER_LEN} bytes"
            ))
        })?;

        if snapshot.entries.contains_key(identity) {
            return Err(EstError::credential(format!(
                "line {line_no}: duplicate identity '{identity}'"
            )));
        }

        snapshot.entries.insert(
            identity.to_string(),
            CredentialEntry {
                identity: identity.to_string(),
                salt: salt.to_string(),
                verifier,
            },
        );
    }

    Ok(snapshot)
}
