//! Token verification: version, hostname, clock skew, replay ratchet and digest
//! checks against the registration store.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Mutex;

use thiserror::Error;

use crate::registry::Registrations;
use crate::shared_secret::{ANY_HOST, PROTOCOL_VERSION};
use crate::token::{parse_token, unix_now};

/// Why a token was refused. The display strings are the status lines written
/// to the local log; clients never see them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("wrong protocol version {0:?}")]
    WrongVersion(String),
    #[error("no registration for {username}@{hostname}")]
    UnknownClient { hostname: String, username: String },
    #[error("hostname mismatch: expected {expected}, request came from {client}")]
    HostnameMismatch { expected: String, client: String },
    #[error("clock skew of {delta}s exceeds {allowed}s")]
    ClockSkew { delta: i64, allowed: u64 },
    #[error("replayed token: sent {sent} not after last accepted {last}")]
    Replay { sent: i64, last: i64 },
    #[error("digest mismatch")]
    DigestMismatch,
    #[error("registration lookup failed: {0}")]
    Registry(String),
}

impl Rejection {
    /// Skew and replay failures happen during ordinary client retries and must
    /// not drive the service into lockdown.
    pub fn is_benign(&self) -> bool {
        matches!(self, Rejection::ClockSkew { .. } | Rejection::Replay { .. })
    }
}

/// Identity established by a successfully verified token. `hostname` comes
/// from the registration (the server override when one is set), never from
/// the token alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub hostname: String,
    pub username: String,
    pub sent_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOptions {
    /// Zero disables the skew check.
    pub max_time_delta_seconds: u64,
    pub require_ratchet: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            max_time_delta_seconds: 90,
            require_ratchet: true,
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        unix_now()
    }
}

/// Turns a hostname or address literal into addresses.
pub trait HostResolver: Send + Sync {
    fn resolve(&self, host: &str) -> Vec<IpAddr>;
}

/// Resolves through the operating system resolver.
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str) -> Vec<IpAddr> {
        if let Ok(addr) = host.parse::<IpAddr>() {
            return vec![addr];
        }
        (host, 0)
            .to_socket_addrs()
            .map(|addrs| addrs.map(|a| a.ip()).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RatchetKey {
    hostname: String,
    username: String,
    command: String,
}

/// Owns the replay ratchet. The map lives for the process lifetime only; a
/// restart accepts anything inside the skew window again.
pub struct TokenVerifier {
    ratchet: Mutex<HashMap<RatchetKey, i64>>,
    resolver: Box<dyn HostResolver>,
    clock: Box<dyn Clock>,
}

impl Default for TokenVerifier {
    fn default() -> Self {
        Self::new(Box::new(SystemResolver), Box::new(SystemClock))
    }
}

impl TokenVerifier {
    pub fn new(resolver: Box<dyn HostResolver>, clock: Box<dyn Clock>) -> Self {
        Self {
            ratchet: Mutex::new(HashMap::new()),
            resolver,
            clock,
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// True when both names are equal or resolve to at least one common address.
    pub fn same_host(&self, a: &str, b: &str) -> bool {
        if a.eq_ignore_ascii_case(b) {
            return true;
        }
        let left: HashSet<IpAddr> = self.resolver.resolve(a).into_iter().collect();
        !left.is_empty() && self.resolver.resolve(b).iter().any(|addr| left.contains(addr))
    }

    pub fn verify(
        &self,
        registrations: &mut dyn Registrations,
        wire: &str,
        command: &str,
        client_address: Option<&str>,
        passphrase: &str,
        options: VerifyOptions,
    ) -> Result<Verified, Rejection> {
        let token = parse_token(wire).map_err(|e| Rejection::Malformed(e.to_string()))?;
        if token.version != PROTOCOL_VERSION {
            return Err(Rejection::WrongVersion(token.version));
        }

        let record = registrations
            .lookup(&token.hostname, client_address, &token.username, passphrase)
            .map_err(|e| Rejection::Registry(e.to_string()))?
            .ok_or_else(|| Rejection::UnknownClient {
                hostname: token.hostname.clone(),
                username: token.username.clone(),
            })?;

        // The token must name the host the record was enrolled under; a client
        // cannot borrow another machine's hostname through the lookup fallbacks.
        if token.hostname != record.hostname {
            return Err(Rejection::HostnameMismatch {
                expected: record.hostname,
                client: token.hostname,
            });
        }

        let expected_hostname = record.expected_hostname().to_string();
        let verified_hostname = if expected_hostname == ANY_HOST {
            record.hostname.clone()
        } else {
            expected_hostname.clone()
        };
        if let Some(client) = client_address {
            if expected_hostname != ANY_HOST && !self.same_host(&expected_hostname, client) {
                return Err(Rejection::HostnameMismatch {
                    expected: expected_hostname,
                    client: client.to_string(),
                });
            }
        }

        if options.max_time_delta_seconds != 0 {
            let delta = self.clock.now().saturating_sub(token.timestamp);
            if delta.unsigned_abs() > options.max_time_delta_seconds {
                return Err(Rejection::ClockSkew {
                    delta,
                    allowed: options.max_time_delta_seconds,
                });
            }
        }

        // Held across the digest check so two copies of one token cannot both pass.
        let mut ratchet = self.ratchet.lock().unwrap_or_else(|e| e.into_inner());
        let key = RatchetKey {
            hostname: expected_hostname,
            username: token.username.clone(),
            command: command.to_string(),
        };
        if options.require_ratchet {
            if let Some(&last) = ratchet.get(&key) {
                if token.timestamp <= last {
                    return Err(Rejection::Replay {
                        sent: token.timestamp,
                        last,
                    });
                }
            }
        }

        if !token.digest_matches(command, &record) {
            return Err(Rejection::DigestMismatch);
        }

        if options.require_ratchet {
            ratchet.insert(key, token.timestamp);
        }

        Ok(Verified {
            hostname: verified_hostname,
            username: token.username,
            sent_time: token.timestamp,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ManualClock, StaticResolver};
    use super::{Rejection, TokenVerifier, VerifyOptions};
    use crate::crypto::sealed::KdfParams;
    use crate::registry::RegistrationStore;
    use crate::shared_secret::{record_from_parts, SharedSecretRecord};
    use crate::token::mint_token;
    use tempfile::TempDir;

    const NOW: i64 = 1_700_000_000;
    const PASS: &str = "registry-pass";

    struct Fixture {
        _dir: TempDir,
        store: RegistrationStore,
        clock: ManualClock,
        verifier: TokenVerifier,
        secret: SharedSecretRecord,
    }

    fn fixture(override_hostname: Option<&str>) -> Fixture {
        let dir = TempDir::new().expect("temp dir");
        let mut store = RegistrationStore::new(dir.path().join("reg.sealed"), KdfParams::light());
        let secret = record_from_parts("h1", "override:test-box", "u1", "p1");
        store.register(secret.clone(), PASS, override_hostname).expect("register");
        let clock = ManualClock::at(NOW);
        let resolver = StaticResolver::default()
            .with("h1", "192.0.2.10")
            .with("h1-alias", "192.0.2.10")
            .with("h2", "192.0.2.20");
        let verifier = TokenVerifier::new(Box::new(resolver), Box::new(clock.clone()));
        Fixture {
            _dir: dir,
            store,
            clock,
            verifier,
            secret,
        }
    }

    impl Fixture {
        fn token(&self, command: &str, sent: i64) -> String {
            mint_token(command, &self.secret, "h1", "u1", Some(sent))
                .expect("mint")
                .to_string()
        }

        fn verify(&mut self, wire: &str, command: &str, client: Option<&str>, options: VerifyOptions) -> Result<super::Verified, Rejection> {
            self.verifier.verify(&mut self.store, wire, command, client, PASS, options)
        }
    }

    #[test]
    fn accepts_freshly_minted_tokens() {
        let mut fx = fixture(None);
        let wire = fx.token("db-password", NOW);
        let verified = fx
            .verify(&wire, "db-password", Some("h1"), VerifyOptions::default())
            .expect("token should verify");
        assert_eq!(verified.hostname, "h1");
        assert_eq!(verified.username, "u1");
        assert_eq!(verified.sent_time, NOW);
    }

    #[test]
    fn client_address_is_compared_by_resolution() {
        let mut fx = fixture(None);
        let wire = fx.token("k", NOW);
        assert!(fx.verify(&wire, "k", Some("192.0.2.10"), VerifyOptions::default()).is_ok());

        let wire = fx.token("k", NOW + 1);
        let err = fx.verify(&wire, "k", Some("h2"), VerifyOptions::default()).unwrap_err();
        assert!(matches!(err, Rejection::HostnameMismatch { .. }));
    }

    #[test]
    fn wildcard_override_skips_hostname_check() {
        let mut fx = fixture(Some("*"));
        let wire = fx.token("k", NOW);
        let verified = fx
            .verify(&wire, "k", Some("198.51.100.7"), VerifyOptions::default())
            .expect("wildcard registration verifies from anywhere");
        assert_eq!(verified.hostname, "h1");
    }

    #[test]
    fn override_hostname_replaces_claimed_hostname() {
        let mut fx = fixture(Some("h1-alias"));
        let wire = fx.token("k", NOW);
        // Registered under h1-alias:u1, reached through the client address fallback.
        let verified = fx
            .verify(&wire, "k", Some("h1-alias"), VerifyOptions::default())
            .expect("override registration verifies");
        assert_eq!(verified.hostname, "h1-alias");
        let wire = fx.token("k", NOW + 1);
        assert!(matches!(
            fx.verify(&wire, "k", Some("h2"), VerifyOptions::default()).unwrap_err(),
            Rejection::UnknownClient { .. }
        ));
    }

    #[test]
    fn clock_skew_boundary() {
        let mut fx = fixture(None);
        let options = VerifyOptions {
            max_time_delta_seconds: 60,
            require_ratchet: true,
        };
        let wire = fx.token("k", NOW - 59);
        assert!(fx.verify(&wire, "k", Some("h1"), options).is_ok());

        let wire = fx.token("k", NOW - 61);
        let err = fx.verify(&wire, "k", Some("h1"), options).unwrap_err();
        assert!(matches!(err, Rejection::ClockSkew { delta: 61, allowed: 60 }));
        assert!(err.is_benign());

        let wire = fx.token("k", NOW + 61);
        assert!(matches!(
            fx.verify(&wire, "k", Some("h1"), options).unwrap_err(),
            Rejection::ClockSkew { .. }
        ));
    }

    #[test]
    fn replay_is_rejected_per_command() {
        let mut fx = fixture(None);
        let wire = fx.token("db-password", NOW);
        assert!(fx.verify(&wire, "db-password", Some("h1"), VerifyOptions::default()).is_ok());

        let err = fx
            .verify(&wire, "db-password", Some("h1"), VerifyOptions::default())
            .unwrap_err();
        assert_eq!(err, Rejection::Replay { sent: NOW, last: NOW });
        assert!(err.is_benign());

        // Same second, different secret: not a replay.
        let other = fx.token("api-key", NOW);
        assert!(fx.verify(&other, "api-key", Some("h1"), VerifyOptions::default()).is_ok());
    }

    #[test]
    fn replay_accepted_when_ratchet_and_skew_disabled() {
        let mut fx = fixture(None);
        let options = VerifyOptions {
            max_time_delta_seconds: 0,
            require_ratchet: false,
        };
        let wire = fx.token("k", NOW - 10_000);
        assert!(fx.verify(&wire, "k", Some("h1"), options).is_ok());
        fx.clock.set(NOW + 10_000);
        assert!(fx.verify(&wire, "k", Some("h1"), options).is_ok());
    }

    #[test]
    fn forged_tokens_do_not_advance_the_ratchet() {
        let mut fx = fixture(None);
        let forged = format!("v2:h1:u1:{}:{}", NOW + 5, "0".repeat(64));
        assert_eq!(
            fx.verify(&forged, "k", Some("h1"), VerifyOptions::default()).unwrap_err(),
            Rejection::DigestMismatch
        );
        let wire = fx.token("k", NOW);
        assert!(fx.verify(&wire, "k", Some("h1"), VerifyOptions::default()).is_ok());
    }

    #[test]
    fn any_changed_field_breaks_the_digest() {
        let mut fx = fixture(None);
        let options = VerifyOptions {
            max_time_delta_seconds: 0,
            require_ratchet: false,
        };
        let wire = fx.token("db-password", NOW);

        let err = fx.verify(&wire, "db-passwore", Some("h1"), options).unwrap_err();
        assert_eq!(err, Rejection::DigestMismatch);

        let bumped = wire.replace(&NOW.to_string(), &(NOW + 1).to_string());
        assert_eq!(fx.verify(&bumped, "db-password", Some("h1"), options).unwrap_err(), Rejection::DigestMismatch);

        let other_secret = record_from_parts("h1", "override:test-box", "u1", "p2");
        let wrong = mint_token("db-password", &other_secret, "h1", "u1", Some(NOW)).expect("mint").to_string();
        assert_eq!(fx.verify(&wrong, "db-password", Some("h1"), options).unwrap_err(), Rejection::DigestMismatch);

        let mut digest_flip = wire.clone();
        let last = digest_flip.pop().expect("non-empty");
        digest_flip.push(if last == '0' { '1' } else { '0' });
        assert_eq!(fx.verify(&digest_flip, "db-password", Some("h1"), options).unwrap_err(), Rejection::DigestMismatch);
    }

    #[test]
    fn edited_hostname_or_username_is_rejected() {
        let mut fx = fixture(None);
        let neighbour = record_from_parts("h1", "override:test-box", "u2", "p1");
        fx.store.register(neighbour, PASS, None).expect("register u2");
        let options = VerifyOptions {
            max_time_delta_seconds: 0,
            require_ratchet: false,
        };
        let wire = fx.token("k", NOW);

        let other_host = wire.replacen("v2:h1:", "v2:h2:", 1);
        assert!(matches!(
            fx.verify(&other_host, "k", Some("h1"), options).unwrap_err(),
            Rejection::HostnameMismatch { .. }
        ));
        assert!(matches!(
            fx.verify(&other_host, "k", None, options).unwrap_err(),
            Rejection::UnknownClient { .. }
        ));

        let other_user = wire.replacen(":u1:", ":u2:", 1);
        assert_eq!(fx.verify(&other_user, "k", Some("h1"), options).unwrap_err(), Rejection::DigestMismatch);
    }

    #[test]
    fn own_secret_cannot_claim_another_hostname() {
        let mut fx = fixture(None);
        let claimed = mint_token("k", &fx.secret, "db-host", "u1", Some(NOW)).expect("mint").to_string();
        let err = fx.verify(&claimed, "k", Some("h1"), VerifyOptions::default()).unwrap_err();
        assert_eq!(
            err,
            Rejection::HostnameMismatch {
                expected: "h1".to_string(),
                client: "db-host".to_string(),
            }
        );
        assert!(!err.is_benign());

        // The rejection left the ratchet alone.
        let wire = fx.token("k", NOW);
        assert!(fx.verify(&wire, "k", Some("h1"), VerifyOptions::default()).is_ok());
    }

    #[test]
    fn rejects_malformed_and_foreign_versions() {
        let mut fx = fixture(None);
        assert!(matches!(
            fx.verify("garbage", "k", None, VerifyOptions::default()).unwrap_err(),
            Rejection::Malformed(_)
        ));
        let wire = fx.token("k", NOW).replacen("v2", "v1", 1);
        assert_eq!(
            fx.verify(&wire, "k", None, VerifyOptions::default()).unwrap_err(),
            Rejection::WrongVersion("v1".to_string())
        );
    }

    #[test]
    fn unknown_usernames_are_rejected() {
        let mut fx = fixture(None);
        let wire = mint_token("k", &fx.secret, "h1", "u9", Some(NOW)).expect("mint").to_string();
        assert!(matches!(
            fx.verify(&wire, "k", Some("h1"), VerifyOptions::default()).unwrap_err(),
            Rejection::UnknownClient { .. }
        ));
    }

    #[test]
    fn wrong_registry_passphrase_is_reported() {
        let mut fx = fixture(None);
        fx.store.forget();
        let wire = fx.token("k", NOW);
        let err = fx
            .verifier
            .verify(&mut fx.store, &wire, "k", Some("h1"), "not-the-pass", VerifyOptions::default())
            .unwrap_err();
        assert!(matches!(err, Rejection::Registry(_)));
        assert!(!err.is_benign());
    }
}
