//! Passphrase-sealed files built on Argon2id and ChaCha20-Poly1305.
//!
//! Both the registration database and the secrets database go through this
//! one capability: `seal` turns plaintext into a self-describing JSON envelope
//! and `open` reverses it or fails loudly. The envelope carries the salt and the
//! Argon2id cost parameters so a file can always be opened with the settings it
//! was sealed with, even after the defaults change.

use std::fs;
use std::path::{Path, PathBuf};

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

const ENVELOPE_VERSION: u32 = 1;
const TAG_SIZE: usize = 16;
const SALT_LEN: usize = 16;
const DERIVED_KEY_LEN: usize = 32;
/// Upper bounds on envelope cost parameters: 1 GiB and 64 passes.
pub const MAX_MEMORY_KIB: u32 = 1024 * 1024;
pub const MAX_ITERATIONS: u32 = 64;

#[derive(Debug, Error)]
pub enum SealError {
    #[error("argon2 derivation failed: {0}")]
    DerivationFailed(String),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: wrong passphrase or corrupted file")]
    Decrypt,
    #[error("sealed envelope malformed: {0}")]
    Malformed(String),
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),
    #[error("kdf cost out of range: {memory_kib} KiB, {iterations} iterations")]
    KdfOutOfRange { memory_kib: u32, iterations: u32 },
}

/// Argon2id cost parameters used when sealing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for KdfParams {
    /// 19 MiB and three passes: slow enough to hurt offline guessing, fast
    /// enough for a once-per-lifetime unlock.
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 3,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests and fixtures. Never use for real data.
    pub fn light() -> Self {
        Self {
            memory_kib: 64,
            iterations: 1,
        }
    }

    /// Refuses costs that would stall or exhaust the host before any work is done.
    pub fn check_bounds(&self) -> Result<(), SealError> {
        if self.memory_kib > MAX_MEMORY_KIB || self.iterations == 0 || self.iterations > MAX_ITERATIONS {
            return Err(SealError::KdfOutOfRange {
                memory_kib: self.memory_kib,
                iterations: self.iterations,
            });
        }
        Ok(())
    }

    fn derive_key(&self, passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>, SealError> {
        let params = Params::new(self.memory_kib, self.iterations, 1, Some(DERIVED_KEY_LEN))
            .map_err(|e| SealError::DerivationFailed(format!("{e}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut output = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, output.as_mut_slice())
            .map_err(|e| SealError::DerivationFailed(format!("{e}")))?;
        Ok(output)
    }
}

/// Serialized form of a sealed file. Binary fields are base64 without padding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SealedEnvelope {
    pub version: u32,
    pub memory_kib: u32,
    pub iterations: u32,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
    pub tag: String,
}

/// Encrypts `plaintext` under a key derived from `passphrase` and returns the
/// envelope as JSON bytes ready to be written to disk.
pub fn seal(plaintext: &[u8], passphrase: &str, kdf: KdfParams) -> Result<Vec<u8>, SealError> {
    kdf.check_bounds()?;
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key = kdf.derive_key(passphrase, &salt)?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let mut ciphertext_and_tag = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| SealError::EncryptionFailed(format!("{e}")))?;
    if ciphertext_and_tag.len() < TAG_SIZE {
        return Err(SealError::EncryptionFailed(
            "ciphertext shorter than authentication tag".to_string(),
        ));
    }
    let tag_start = ciphertext_and_tag.len() - TAG_SIZE;
    let tag = ciphertext_and_tag.split_off(tag_start);

    let envelope = SealedEnvelope {
        version: ENVELOPE_VERSION,
        memory_kib: kdf.memory_kib,
        iterations: kdf.iterations,
        salt: STANDARD_NO_PAD.encode(salt),
        nonce: STANDARD_NO_PAD.encode(nonce),
        ciphertext: STANDARD_NO_PAD.encode(ciphertext_and_tag),
        tag: STANDARD_NO_PAD.encode(tag),
    };
    serde_json::to_vec_pretty(&envelope).map_err(|e| SealError::EncryptionFailed(format!("{e}")))
}

/// Decrypts a sealed envelope. A wrong passphrase and a tampered file are
/// indistinguishable and both surface as [`SealError::Decrypt`].
pub fn open(sealed: &[u8], passphrase: &str) -> Result<Zeroizing<Vec<u8>>, SealError> {
    let envelope: SealedEnvelope =
        serde_json::from_slice(sealed).map_err(|e| SealError::Malformed(format!("{e}")))?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(SealError::UnsupportedVersion(envelope.version));
    }
    let kdf = KdfParams {
        memory_kib: envelope.memory_kib,
        iterations: envelope.iterations,
    };
    kdf.check_bounds()?;

    let salt = decode_field("salt", &envelope.salt)?;
    let nonce = decode_field("nonce", &envelope.nonce)?;
    let ciphertext = decode_field("ciphertext", &envelope.ciphertext)?;
    let tag = decode_field("tag", &envelope.tag)?;
    if nonce.len() != 12 {
        return Err(SealError::Malformed("nonce length mismatch".to_string()));
    }
    if tag.len() != TAG_SIZE {
        return Err(SealError::Malformed("tag length mismatch".to_string()));
    }

    let key = kdf.derive_key(passphrase, &salt)?;

    let mut combined = Vec::with_capacity(ciphertext.len() + tag.len());
    combined.extend_from_slice(&ciphertext);
    combined.extend_from_slice(&tag);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    cipher
        .decrypt(Nonce::from_slice(&nonce), combined.as_ref())
        .map(Zeroizing::new)
        .map_err(|_| SealError::Decrypt)
}

/// Writes through a sibling temp file and renames it into place so a crash
/// never leaves a half-written sealed file.
pub fn write_replacing(path: &Path, bytes: &[u8]) -> Result<(), String> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(|e| format!("{}: {e}", tmp.display()))?;
    fs::rename(&tmp, path).map_err(|e| format!("{}: {e}", path.display()))
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, SealError> {
    STANDARD_NO_PAD
        .decode(value.as_bytes())
        .map_err(|e| SealError::Malformed(format!("{name}: {e}")))
}
