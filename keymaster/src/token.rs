//! Token wire format: `version:hostname:username:timestamp:digest`.
//!
//! The digest is an HMAC-SHA256 keyed with the canonical form of the shared
//! secret record over `version:hostname:username:timestamp:command`, so a token
//! is only good for one command at one point in time.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::crypto::integrity::{hmac_sha256_hex, verify_hmac_sha256_hex, IntegrityError};
use crate::shared_secret::{SharedSecretRecord, PROTOCOL_VERSION};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

/// Parsed token. Only [`Token::to_string`] produces the wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub version: String,
    pub hostname: String,
    pub username: String,
    pub timestamp: i64,
    pub digest: String,
}

impl Token {
    fn context(&self) -> String {
        token_context(&self.version, &self.hostname, &self.username, self.timestamp)
    }

    /// Recomputes the digest for `command` under `secret` and compares it in
    /// constant time.
    pub fn digest_matches(&self, command: &str, secret: &SharedSecretRecord) -> bool {
        let message = format!("{}:{command}", self.context());
        verify_hmac_sha256_hex(secret.canonical().as_bytes(), message.as_bytes(), &self.digest)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.context(), self.digest)
    }
}

fn token_context(version: &str, hostname: &str, username: &str, timestamp: i64) -> String {
    format!("{version}:{hostname}:{username}:{timestamp}")
}

/// Seconds since the Unix epoch. A clock before 1970 reads as zero.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Mints a token authorising `command`. `now_override` pins the timestamp for
/// deterministic tests; production callers pass `None`.
pub fn mint_token(
    command: &str,
    secret: &SharedSecretRecord,
    hostname: &str,
    username: &str,
    now_override: Option<i64>,
) -> Result<Token, TokenError> {
    let timestamp = now_override.unwrap_or_else(unix_now);
    let context = token_context(PROTOCOL_VERSION, hostname, username, timestamp);
    let message = format!("{context}:{command}");
    let digest = hmac_sha256_hex(secret.canonical().as_bytes(), message.as_bytes())?;

    Ok(Token {
        version: PROTOCOL_VERSION.to_string(),
        hostname: hostname.to_string(),
        username: username.to_string(),
        timestamp,
        digest,
    })
}

/// Splits on the first four colons. Fewer than five fields or a non-integer
/// timestamp is malformed.
pub fn parse_token(wire: &str) -> Result<Token, TokenError> {
    let mut fields = wire.trim().splitn(5, ':');
    let (Some(version), Some(hostname), Some(username), Some(timestamp), Some(digest)) = (
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
    ) else {
        return Err(TokenError::Malformed("expected 5 colon-separated fields".to_string()));
    };

    let timestamp = timestamp
        .parse::<i64>()
        .map_err(|_| TokenError::Malformed(format!("timestamp {timestamp:?} is not an integer")))?;

    Ok(Token {
        version: version.to_string(),
        hostname: hostname.to_string(),
        username: username.to_string(),
        timestamp,
        digest: digest.to_string(),
    })
}
