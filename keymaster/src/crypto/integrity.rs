//! Hashing and keyed-digest helpers. Token digests and shared-secret digests are
//! both built here so the rest of the crate never touches the hash primitives.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("hmac failed: {0}")]
    HmacFailed(String),
}

type HmacSha256 = Hmac<Sha256>;

/// Returns the lowercase hexadecimal SHA-256 digest of the provided bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Generates an HMAC-SHA256 tag for the provided data, hex encoded.
pub fn hmac_sha256_hex(key: &[u8], data: &[u8]) -> Result<String, IntegrityError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| IntegrityError::HmacFailed(format!("{e}")))?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a hex encoded HMAC-SHA256 tag in constant time. Anything that is not
/// lowercase-or-uppercase hex of the right length simply fails to verify.
pub fn verify_hmac_sha256_hex(key: &[u8], data: &[u8], tag_hex: &str) -> bool {
    let Ok(tag) = hex::decode(tag_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(data);
    mac.verify_slice(&tag).is_ok()
}
