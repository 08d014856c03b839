//! Bootstrap secrets and their access lists, plus the sealed secrets file the
//! offline administrator tool edits.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::sealed::{self, write_replacing, KdfParams, SealError};
use crate::textfile::{self, TextFileError};

#[derive(Debug, Error)]
pub enum SecretsFileError {
    #[error("secrets file {0} does not exist")]
    Missing(PathBuf),
    #[error("secrets file unreadable: {0}")]
    Io(String),
    #[error("secrets file could not be unsealed: {0}")]
    Seal(#[from] SealError),
    #[error("secrets file corrupt: {0}")]
    Format(#[from] TextFileError),
    #[error("secrets file is not valid utf-8")]
    Utf8,
    #[error("invalid acl pattern {0:?}; expected user@host with optional * wildcards")]
    InvalidAcl(String),
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRecord {
    pub secret_value: String,
    #[serde(default)]
    pub acl: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretRecord")
            .field("secret_value", &"<redacted>")
            .field("acl", &self.acl)
            .field("comment", &self.comment)
            .finish()
    }
}

impl Drop for SecretRecord {
    fn drop(&mut self) {
        self.secret_value.zeroize();
    }
}

impl SecretRecord {
    pub fn new(secret_value: impl Into<String>, acl: Vec<String>) -> Self {
        Self {
            secret_value: secret_value.into(),
            acl,
            comment: None,
        }
    }

    /// True when any ACL pattern matches the verified caller.
    pub fn allows(&self, username: &str, hostname: &str) -> bool {
        self.acl
            .iter()
            .any(|pattern| acl_pattern_matches(pattern, username, hostname))
    }
}

/// All secrets, keyed by name.
pub type SecretCollection = BTreeMap<String, SecretRecord>;

/// Matches one `user@host` pattern. Either side may be `*` or contain `*`
/// wildcards; the split happens at the last `@`.
pub fn acl_pattern_matches(pattern: &str, username: &str, hostname: &str) -> bool {
    let Some((user_pattern, host_pattern)) = pattern.rsplit_once('@') else {
        return false;
    };
    glob_matches(user_pattern, username) && glob_matches(host_pattern, hostname)
}

pub fn validate_acl_pattern(pattern: &str) -> Result<(), SecretsFileError> {
    match pattern.rsplit_once('@') {
        Some((user, host)) if !user.is_empty() && !host.is_empty() => Ok(()),
        _ => Err(SecretsFileError::InvalidAcl(pattern.to_string())),
    }
}

fn glob_matches(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };
    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        // No wildcard at all.
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// Sealed on-disk secrets collection.
pub struct SecretsFile {
    path: PathBuf,
    kdf: KdfParams,
}

impl SecretsFile {
    pub fn new(path: impl Into<PathBuf>, kdf: KdfParams) -> Self {
        Self {
            path: path.into(),
            kdf,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decrypts the whole collection. A missing file is an error here: the
    /// service must never come up "ready" with nothing to serve.
    pub fn load(&self, passphrase: &str) -> Result<SecretCollection, SecretsFileError> {
        let sealed_bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SecretsFileError::Missing(self.path.clone()))
            }
            Err(e) => return Err(SecretsFileError::Io(format!("{}: {e}", self.path.display()))),
        };
        let plaintext = sealed::open(&sealed_bytes, passphrase)?;
        let text = std::str::from_utf8(&plaintext).map_err(|_| SecretsFileError::Utf8)?;
        Ok(textfile::decode_lines(text)?)
    }

    pub fn save(&self, secrets: &SecretCollection, passphrase: &str) -> Result<(), SecretsFileError> {
        for record in secrets.values() {
            for pattern in &record.acl {
                validate_acl_pattern(pattern)?;
            }
        }
        let text = Zeroizing::new(textfile::encode_lines(secrets)?);
        let sealed_bytes = sealed::seal(text.as_bytes(), passphrase, self.kdf)?;
        write_replacing(&self.path, &sealed_bytes).map_err(SecretsFileError::Io)
    }

    /// Adds or replaces one secret, creating the file if needed.
    pub fn set_secret(&self, passphrase: &str, name: &str, record: SecretRecord) -> Result<(), SecretsFileError> {
        let mut secrets = match self.load(passphrase) {
            Ok(secrets) => secrets,
            Err(SecretsFileError::Missing(_)) => SecretCollection::new(),
            Err(e) => return Err(e),
        };
        secrets.insert(name.to_string(), record);
        self.save(&secrets, passphrase)
    }

    pub fn remove_secret(&self, passphrase: &str, name: &str) -> Result<bool, SecretsFileError> {
        let mut secrets = self.load(passphrase)?;
        let removed = secrets.remove(name).is_some();
        if removed {
            self.save(&secrets, passphrase)?;
        }
        Ok(removed)
    }

    pub fn names(&self, passphrase: &str) -> Result<Vec<String>, SecretsFileError> {
        Ok(self.load(passphrase)?.into_keys().collect())
    }
}
