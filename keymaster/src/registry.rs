//! Registration store: the sealed file mapping enrolled clients to their shared
//! secret records.
//!
//! Records are keyed `hostname:username`, where the hostname is the server-side
//! override when one was given at registration. The file is opened with the
//! caller's passphrase on first use and kept in memory afterwards; every write
//! re-seals the whole collection.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;
use zeroize::Zeroizing;

use crate::crypto::sealed::{self, write_replacing, KdfParams, SealError};
use crate::shared_secret::{lookup_key, SharedSecretRecord, ANY_HOST, PROTOCOL_VERSION};
use crate::textfile::{self, TextFileError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registration uses protocol {found}, expected {expected}")]
    WrongVersion { found: String, expected: String },
    #[error("registration store unreadable: {0}")]
    Io(String),
    #[error("registration store could not be unsealed: {0}")]
    Seal(#[from] SealError),
    #[error("registration store corrupt: {0}")]
    Format(#[from] TextFileError),
    #[error("registration store is not valid utf-8")]
    Utf8,
}

/// Source of enrolled shared secrets for the token verifier.
pub trait Registrations {
    /// Finds the record for `username`, trying the claimed hostname, then the
    /// observed client address, then the `*` wildcard registration.
    fn lookup(
        &mut self,
        claimed_hostname: &str,
        client_address: Option<&str>,
        username: &str,
        passphrase: &str,
    ) -> Result<Option<SharedSecretRecord>, RegistryError>;
}

struct Loaded {
    passphrase: Zeroizing<String>,
    records: BTreeMap<String, SharedSecretRecord>,
}

pub struct RegistrationStore {
    path: PathBuf,
    kdf: KdfParams,
    loaded: Option<Loaded>,
}

impl RegistrationStore {
    pub fn new(path: impl Into<PathBuf>, kdf: KdfParams) -> Self {
        Self {
            path: path.into(),
            kdf,
            loaded: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds or replaces a registration and persists the store. Returns the key
    /// the record was filed under.
    pub fn register(
        &mut self,
        mut record: SharedSecretRecord,
        passphrase: &str,
        override_hostname: Option<&str>,
    ) -> Result<String, RegistryError> {
        if record.version_tag != PROTOCOL_VERSION {
            return Err(RegistryError::WrongVersion {
                found: record.version_tag,
                expected: PROTOCOL_VERSION.to_string(),
            });
        }
        if let Some(host) = override_hostname.filter(|h| !h.is_empty()) {
            record.server_override_hostname = Some(host.to_string());
        }

        let key = record.lookup_key();
        self.records(passphrase)?.insert(key.clone(), record);
        self.persist(passphrase)?;
        info!(key = %key, "client registered");
        Ok(key)
    }

    /// Removes a registration by its `hostname:username` key.
    pub fn unregister(&mut self, key: &str, passphrase: &str) -> Result<bool, RegistryError> {
        let removed = self.records(passphrase)?.remove(key).is_some();
        if removed {
            self.persist(passphrase)?;
            info!(key = %key, "client unregistered");
        }
        Ok(removed)
    }

    pub fn list(&mut self, passphrase: &str) -> Result<Vec<SharedSecretRecord>, RegistryError> {
        Ok(self.records(passphrase)?.values().cloned().collect())
    }

    /// Drops the in-memory copy; the next access unseals the file again.
    pub fn forget(&mut self) {
        self.loaded = None;
    }

    fn records(&mut self, passphrase: &str) -> Result<&mut BTreeMap<String, SharedSecretRecord>, RegistryError> {
        let cached = self
            .loaded
            .as_ref()
            .is_some_and(|loaded| loaded.passphrase.as_str() == passphrase);
        if !cached {
            let records = self.read(passphrase)?;
            self.loaded = Some(Loaded {
                passphrase: Zeroizing::new(passphrase.to_string()),
                records,
            });
        }
        match self.loaded.as_mut() {
            Some(loaded) => Ok(&mut loaded.records),
            None => Err(RegistryError::Io("registration cache unavailable".to_string())),
        }
    }

    fn read(&self, passphrase: &str) -> Result<BTreeMap<String, SharedSecretRecord>, RegistryError> {
        let sealed_bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            // Nothing enrolled yet; the first register() creates the file.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(RegistryError::Io(format!("{}: {e}", self.path.display()))),
        };
        let plaintext = sealed::open(&sealed_bytes, passphrase)?;
        let text = std::str::from_utf8(&plaintext).map_err(|_| RegistryError::Utf8)?;
        Ok(textfile::decode_lines(text)?)
    }

    fn persist(&self, passphrase: &str) -> Result<(), RegistryError> {
        let Some(loaded) = self.loaded.as_ref() else {
            return Ok(());
        };
        let text = Zeroizing::new(textfile::encode_lines(&loaded.records)?);
        let sealed_bytes = sealed::seal(text.as_bytes(), passphrase, self.kdf)?;
        write_replacing(&self.path, &sealed_bytes).map_err(RegistryError::Io)
    }
}

impl Registrations for RegistrationStore {
    fn lookup(
        &mut self,
        claimed_hostname: &str,
        client_address: Option<&str>,
        username: &str,
        passphrase: &str,
    ) -> Result<Option<SharedSecretRecord>, RegistryError> {
        let records = self.records(passphrase)?;
        let candidates = [Some(claimed_hostname), client_address, Some(ANY_HOST)];
        Ok(candidates
            .into_iter()
            .flatten()
            .find_map(|host| records.get(&lookup_key(host, username)))
            .cloned())
    }
}
