//! Enrollment credentials ("shared secret records").
//!
//! A record is regenerated on the client every time it is needed from the
//! machine identity, the hostname and the optional username/password. Only a
//! one-way digest of those inputs is ever handed to the server.

use std::fmt;
use std::fs;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::integrity::sha256_hex;
use crate::identity::{IdentityError, MachineIdentityProvider};

/// Protocol version carried by records and tokens.
pub const PROTOCOL_VERSION: &str = "v2";

/// Hostname override value that disables hostname checking for a record.
pub const ANY_HOST: &str = "*";

const SECRET_DIGEST_HEX_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum DeriveError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("local hostname unavailable; pass one explicitly")]
    HostnameUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedSecretRecord {
    pub version_tag: String,
    pub hostname: String,
    pub username: String,
    pub secret_digest: String,
    /// Server-side only. Never part of the digest material.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_override_hostname: Option<String>,
}

impl SharedSecretRecord {
    /// Hostname the server expects requests for this record to come from.
    pub fn expected_hostname(&self) -> &str {
        self.server_override_hostname.as_deref().unwrap_or(&self.hostname)
    }

    /// Key the registration store files this record under.
    pub fn lookup_key(&self) -> String {
        lookup_key(self.expected_hostname(), &self.username)
    }

    /// String form mixed into every token digest. Excludes the server override
    /// so client and server compute the same value.
    pub fn canonical(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.version_tag, self.hostname, self.username, self.secret_digest
        )
    }
}

impl fmt::Display for SharedSecretRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(text) => f.write_str(&text),
            Err(_) => Err(fmt::Error),
        }
    }
}

pub fn lookup_key(hostname: &str, username: &str) -> String {
    format!("{hostname}:{username}")
}

/// Builds the shared secret record for this machine. Call it identically at
/// enrollment time and before minting every token; never cache the result.
pub fn derive_shared_secret(
    provider: &MachineIdentityProvider,
    username: &str,
    password: &str,
    hostname_override: Option<&str>,
) -> Result<SharedSecretRecord, DeriveError> {
    let hostname = match hostname_override {
        Some(hostname) => hostname.to_string(),
        None => local_hostname().ok_or(DeriveError::HostnameUnavailable)?,
    };
    let machine_identity = provider.machine_identity()?;
    Ok(record_from_parts(&hostname, &machine_identity, username, password))
}

/// Pure part of the derivation, separated so it can be checked without a
/// machine identity source.
pub fn record_from_parts(
    hostname: &str,
    machine_identity: &str,
    username: &str,
    password: &str,
) -> SharedSecretRecord {
    let digest_input = format!("{hostname}:{machine_identity}:{username}:{password}");
    let mut secret_digest = sha256_hex(digest_input.as_bytes());
    secret_digest.truncate(SECRET_DIGEST_HEX_LEN);

    SharedSecretRecord {
        version_tag: PROTOCOL_VERSION.to_string(),
        hostname: hostname.to_string(),
        username: username.to_string(),
        secret_digest,
        server_override_hostname: None,
    }
}

/// Kernel hostname, falling back to `$HOSTNAME`.
pub fn local_hostname() -> Option<String> {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}
