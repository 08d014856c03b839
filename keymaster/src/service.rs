//! The keymaster service: a self-locking holder of decrypted bootstrap secrets.
//!
//! The service starts `Locked`. An administrator submits the passphrase, the
//! secrets file is decrypted into memory and the service becomes `Ready`. From
//! then on every request must carry a token that verifies against the
//! registration store and a caller that matches the secret's ACL. Anything that
//! looks like probing wipes the secrets and locks the service again, unless
//! stability mode is on.
//!
//! Secrets, the passphrase, the registration cache and the replay ratchet are
//! all touched under one mutex, so a lockdown never interleaves with a read.

use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::registry::RegistrationStore;
use crate::secrets::{SecretCollection, SecretsFile, SecretsFileError};
use crate::verifier::{Rejection, TokenVerifier, VerifyOptions};

/// Target used for alert-severity events.
pub const ALERT_TARGET: &str = "keymaster::alert";

pub const HEALTH_OK: &str = "ok";
pub const HEALTH_NOT_READY: &str = "error not ready";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not ready")]
    NotReady,
    #[error("no such secret")]
    NotFound,
    #[error("caller not in secret acl")]
    Unauthorized,
    #[error("token rejected: {0}")]
    Rejected(Rejection),
    #[error("passphrase already accepted")]
    AlreadyReady,
    #[error("reset disabled in stability mode")]
    ResetDisabled,
    #[error(transparent)]
    Secrets(#[from] SecretsFileError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Locked,
    Ready,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceSettings {
    pub verify: VerifyOptions,
    /// Degrades every lockdown to an error log.
    pub stability_mode: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub served: u64,
    pub rejected: u64,
    pub benign_rejections: u64,
    pub lockdowns: u64,
    pub passphrase_failures: u64,
}

struct Unlocked {
    secrets: SecretCollection,
    passphrase: Zeroizing<String>,
}

struct Inner {
    unlocked: Option<Unlocked>,
    registry: RegistrationStore,
    stats: ServiceStats,
}

pub struct KeymasterService {
    inner: Mutex<Inner>,
    verifier: TokenVerifier,
    secrets_file: SecretsFile,
    settings: ServiceSettings,
}

impl KeymasterService {
    pub fn new(
        settings: ServiceSettings,
        registry: RegistrationStore,
        secrets_file: SecretsFile,
        verifier: TokenVerifier,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                unlocked: None,
                registry,
                stats: ServiceStats::default(),
            }),
            verifier,
            secrets_file,
            settings,
        }
    }

    // Every critical section leaves Inner consistent, so a poisoned lock is
    // still safe to use.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> StoreState {
        if self.lock().unlocked.is_some() {
            StoreState::Ready
        } else {
            StoreState::Locked
        }
    }

    pub fn health(&self) -> &'static str {
        match self.state() {
            StoreState::Ready => HEALTH_OK,
            StoreState::Locked => HEALTH_NOT_READY,
        }
    }

    pub fn stats(&self) -> ServiceStats {
        self.lock().stats.clone()
    }

    /// Decrypts the secrets file and moves to `Ready`. The passphrase is kept
    /// in memory because the registration store is sealed with it too.
    pub fn submit_passphrase(&self, passphrase: &str) -> Result<(), ServiceError> {
        let mut inner = self.lock();
        if inner.unlocked.is_some() {
            warn!("passphrase submitted while already ready; ignored");
            return Err(ServiceError::AlreadyReady);
        }

        match self.secrets_file.load(passphrase) {
            Ok(secrets) => {
                info!(secrets = secrets.len(), "secrets unlocked");
                inner.registry.forget();
                inner.unlocked = Some(Unlocked {
                    secrets,
                    passphrase: Zeroizing::new(passphrase.to_string()),
                });
                Ok(())
            }
            Err(e) => {
                inner.stats.passphrase_failures += 1;
                error!(error = %e, "passphrase rejected");
                Err(e.into())
            }
        }
    }

    /// Returns the named secret to a caller holding a valid token for it.
    pub fn get_secret(
        &self,
        key_name: &str,
        token: &str,
        client_address: Option<&str>,
    ) -> Result<Zeroizing<String>, ServiceError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(unlocked) = inner.unlocked.as_ref() else {
            return Err(ServiceError::NotReady);
        };

        if !unlocked.secrets.contains_key(key_name) {
            let reason = format!("request for unknown secret {key_name:?}");
            self.raise(inner, &reason, false);
            return Err(ServiceError::NotFound);
        }

        let verified = match self.verifier.verify(
            &mut inner.registry,
            token,
            key_name,
            client_address,
            &unlocked.passphrase,
            self.settings.verify,
        ) {
            Ok(verified) => verified,
            Err(rejection) => {
                let reason = format!("{key_name}: {rejection}");
                self.raise(inner, &reason, rejection.is_benign());
                return Err(ServiceError::Rejected(rejection));
            }
        };

        let record = unlocked.secrets.get(key_name).filter(|record| {
            record.allows(&verified.username, &verified.hostname)
        });
        match record {
            Some(record) => {
                let value = Zeroizing::new(record.secret_value.clone());
                inner.stats.served += 1;
                info!(
                    key = key_name,
                    username = %verified.username,
                    hostname = %verified.hostname,
                    "secret served"
                );
                Ok(value)
            }
            None => {
                let reason = format!(
                    "{}@{} not permitted to read {key_name:?}",
                    verified.username, verified.hostname
                );
                self.raise(inner, &reason, false);
                Err(ServiceError::Unauthorized)
            }
        }
    }

    /// Privileged wipe. Refused in stability mode.
    pub fn reset(&self) -> Result<(), ServiceError> {
        if self.settings.stability_mode {
            warn!("reset refused: stability mode is on");
            return Err(ServiceError::ResetDisabled);
        }
        let mut inner = self.lock();
        self.lockdown(&mut inner, "reset requested");
        Ok(())
    }

    /// Panic evaluation for a failed request.
    fn raise(&self, inner: &mut Inner, reason: &str, benign: bool) {
        inner.stats.rejected += 1;
        if benign {
            inner.stats.benign_rejections += 1;
            error!(reason, "request rejected");
        } else if self.settings.stability_mode {
            error!(reason, "request rejected; lockdown suppressed by stability mode");
        } else {
            self.lockdown(inner, reason);
        }
    }

    fn lockdown(&self, inner: &mut Inner, reason: &str) {
        // Dropping the collection zeroizes every value.
        inner.unlocked = None;
        inner.registry.forget();
        inner.stats.lockdowns += 1;
        error!(
            target: ALERT_TARGET,
            alert = true,
            reason,
            lockdowns = inner.stats.lockdowns,
            "PANIC: secrets wiped, service locked"
        );
    }
}
