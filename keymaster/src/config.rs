//! Configuration loader. Settings come from a JSON file whose keys are all
//! optional; passphrases never live in it, only the names of the environment
//! variables that carry them.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::crypto::sealed::KdfParams;
use crate::identity::{MachineIdentityProvider, MACHINE_ID_ENV};
use crate::registry::RegistrationStore;
use crate::secrets::SecretsFile;
use crate::service::{KeymasterService, ServiceSettings};
use crate::verifier::{TokenVerifier, VerifyOptions};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "KEYMASTER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "keymaster.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file unreadable: {0}")]
    Io(String),
    #[error("config parse failed: {0}")]
    Parse(String),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct KeymasterConfig {
    pub registrations_path: PathBuf,
    pub secrets_path: PathBuf,
    pub max_time_delta_seconds: u64,
    pub require_ratchet: bool,
    pub stability_mode: bool,
    /// Environment variable holding the passphrase for unattended unlock.
    pub passphrase_env: Option<String>,
    pub machine_id_override: Option<String>,
    pub kdf: KdfParams,
}

impl Default for KeymasterConfig {
    fn default() -> Self {
        Self {
            registrations_path: PathBuf::from("registrations.sealed"),
            secrets_path: PathBuf::from("secrets.sealed"),
            max_time_delta_seconds: VerifyOptions::default().max_time_delta_seconds,
            require_ratchet: true,
            stability_mode: false,
            passphrase_env: None,
            machine_id_override: None,
            kdf: KdfParams::default(),
        }
    }
}

impl KeymasterConfig {
    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            verify: VerifyOptions {
                max_time_delta_seconds: self.max_time_delta_seconds,
                require_ratchet: self.require_ratchet,
            },
            stability_mode: self.stability_mode,
        }
    }

    pub fn registration_store(&self) -> RegistrationStore {
        RegistrationStore::new(&self.registrations_path, self.kdf)
    }

    pub fn secrets_file(&self) -> SecretsFile {
        SecretsFile::new(&self.secrets_path, self.kdf)
    }

    /// Wires the service from these settings. When `passphraseEnv` names a
    /// variable that is present, the service is unlocked before it is returned;
    /// a wrong passphrase leaves it `Locked` for an administrator to unlock.
    pub fn build_service(&self) -> KeymasterService {
        let service = KeymasterService::new(
            self.service_settings(),
            self.registration_store(),
            self.secrets_file(),
            TokenVerifier::default(),
        );
        if let Some(passphrase) = self.startup_passphrase() {
            match service.submit_passphrase(&passphrase) {
                Ok(()) => info!("service unlocked from startup passphrase"),
                Err(e) => warn!(error = %e, "startup unlock failed; waiting for passphrase"),
            }
        }
        service
    }

    /// `KEYMASTER_MACHINE_ID` wins over the configured override.
    pub fn identity_provider(&self) -> MachineIdentityProvider {
        let provider = MachineIdentityProvider::new();
        if std::env::var_os(MACHINE_ID_ENV).is_some() {
            provider
        } else {
            provider.with_override(self.machine_id_override.clone())
        }
    }

    /// Passphrase for unattended unlock, if configured and present.
    pub fn startup_passphrase(&self) -> Option<Zeroizing<String>> {
        let var = self.passphrase_env.as_deref()?;
        std::env::var(var).ok().filter(|v| !v.is_empty()).map(Zeroizing::new)
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.registrations_path.as_os_str().is_empty() || self.secrets_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("store paths must not be empty".to_string()));
        }
        if self.kdf.memory_kib < 8 || self.kdf.iterations == 0 {
            return Err(ConfigError::Invalid("kdf parameters too weak for argon2".to_string()));
        }
        self.kdf
            .check_bounds()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(self)
    }
}

/// Loads the config file. A missing file means defaults; anything unreadable
/// or malformed is an error.
pub fn load_config(path: impl AsRef<Path>) -> Result<KeymasterConfig, ConfigError> {
    let path = path.as_ref();
    let raw_json = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return KeymasterConfig::default().validate(),
        Err(e) => return Err(ConfigError::Io(format!("{}: {e}", path.display()))),
    };
    let config: KeymasterConfig =
        serde_json::from_str(&raw_json).map_err(|e| ConfigError::Parse(format!("{e}")))?;
    config.validate()
}

/// Loads the file named by `KEYMASTER_CONFIG`, or `keymaster.json`.
pub fn load_from_env() -> Result<KeymasterConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_config(path)
}

#[cfg(test)]
mod tests {
    use super::{load_config, ConfigError, KeymasterConfig};
    use crate::crypto::sealed::KdfParams;
    use crate::secrets::SecretRecord;
    use crate::service::StoreState;
    use serde_json::json;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(dir.path().join("absent.json")).expect("defaults");
        assert_eq!(config, KeymasterConfig::default());
        assert_eq!(config.max_time_delta_seconds, 90);
        assert!(config.require_ratchet);
        assert!(!config.stability_mode);
    }

    #[test]
    fn loads_partial_config() {
        let payload = json!({
            "secretsPath": "/var/lib/keymaster/secrets.sealed",
            "maxTimeDeltaSeconds": 60,
            "stabilityMode": true,
            "passphraseEnv": "KM_TEST_UNUSED",
            "kdf": { "memoryKib": 64, "iterations": 1 }
        });
        let file = NamedTempFile::new().expect("temp file");
        fs::write(file.path(), serde_json::to_vec(&payload).expect("json")).expect("write");

        let config = load_config(file.path()).expect("config should load");
        assert_eq!(config.secrets_path, PathBuf::from("/var/lib/keymaster/secrets.sealed"));
        assert_eq!(config.registrations_path, PathBuf::from("registrations.sealed"));
        assert_eq!(config.kdf, KdfParams::light());

        let settings = config.service_settings();
        assert_eq!(settings.verify.max_time_delta_seconds, 60);
        assert!(settings.verify.require_ratchet);
        assert!(settings.stability_mode);
    }

    #[test]
    fn rejects_unknown_keys_and_weak_kdf() {
        let file = NamedTempFile::new().expect("temp file");
        fs::write(file.path(), br#"{"stabilitymode": true}"#).expect("write");
        assert!(matches!(load_config(file.path()), Err(ConfigError::Parse(_))));

        fs::write(file.path(), br#"{"kdf": {"memoryKib": 1, "iterations": 1}}"#).expect("write");
        assert!(matches!(load_config(file.path()), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn build_service_unlocks_from_startup_passphrase() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = KeymasterConfig {
            secrets_path: dir.path().join("secrets.sealed"),
            registrations_path: dir.path().join("reg.sealed"),
            passphrase_env: Some("KEYMASTER_TEST_BUILD_PASSPHRASE".to_string()),
            kdf: KdfParams::light(),
            ..KeymasterConfig::default()
        };
        config
            .secrets_file()
            .set_secret("boot-pass", "db-password", SecretRecord::new("s3cr3t", vec!["*@*".to_string()]))
            .expect("seed");

        assert_eq!(config.build_service().state(), StoreState::Locked);

        std::env::set_var("KEYMASTER_TEST_BUILD_PASSPHRASE", "wrong-pass");
        assert_eq!(config.build_service().state(), StoreState::Locked);

        std::env::set_var("KEYMASTER_TEST_BUILD_PASSPHRASE", "boot-pass");
        assert_eq!(config.build_service().state(), StoreState::Ready);
    }

    #[test]
    fn rejects_kdf_cost_beyond_envelope_limits() {
        let file = NamedTempFile::new().expect("temp file");
        fs::write(file.path(), br#"{"kdf": {"memoryKib": 4294967295, "iterations": 3}}"#).expect("write");
        assert!(matches!(load_config(file.path()), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn startup_passphrase_reads_named_variable() {
        let var = "KEYMASTER_TEST_STARTUP_PASSPHRASE";
        std::env::set_var(var, "pa55phrase");
        let config = KeymasterConfig {
            passphrase_env: Some(var.to_string()),
            ..KeymasterConfig::default()
        };
        assert_eq!(config.startup_passphrase().expect("set").as_str(), "pa55phrase");
        assert!(KeymasterConfig::default().startup_passphrase().is_none());
    }
}
