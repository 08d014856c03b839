//! Operator CLI. Client-side commands derive shared secrets and mint tokens;
//! administrator commands edit the sealed registration and secrets files.
//! Passphrases are read from `KEYMASTER_PASSPHRASE`, never from arguments.

use std::env;
use std::process::ExitCode;

use keymaster::config::{self, ConfigError, KeymasterConfig};
use keymaster::crypto::integrity::sha256_hex;
use keymaster::handlers::{self, Request};
use keymaster::identity::IdentityError;
use keymaster::registry::RegistryError;
use keymaster::secrets::{validate_acl_pattern, SecretRecord, SecretsFileError};
use keymaster::service::StoreState;
use keymaster::shared_secret::{derive_shared_secret, DeriveError, SharedSecretRecord};
use keymaster::token::{mint_token, TokenError};
use thiserror::Error;
use tracing::info;
use zeroize::Zeroizing;

const PASSPHRASE_ENV: &str = "KEYMASTER_PASSPHRASE";

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Derive(#[from] DeriveError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Secrets(#[from] SecretsFileError),
    #[error("KEYMASTER_PASSPHRASE is not set")]
    MissingPassphrase,
    #[error("invalid record json: {0}")]
    Record(String),
}

fn print_usage() {
    eprintln!(
        "Commands:\n  \
         machine-id\n  \
         shared-secret <username> [password] [--hostname <host>]\n  \
         token <command> <username> [password] [--hostname <host>]\n  \
         register <record-json> [--override <host>]\n  \
         unregister <host:username>\n  \
         list-registrations\n  \
         set-secret <name> <value> <user@host>... [--comment <text>]\n  \
         remove-secret <name>\n  \
         list-secrets\n  \
         get <name> <token> <client-address>"
    );
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Usage(msg)) => {
            eprintln!("{msg}");
            print_usage();
            ExitCode::from(2)
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &[String]) -> Result<(), CliError> {
    let Some((command, rest)) = args.split_first() else {
        return Err(CliError::Usage("missing command".to_string()));
    };
    let config = config::load_from_env()?;

    match command.as_str() {
        "machine-id" => {
            expect_args(rest, 0, 0)?;
            let identity = Zeroizing::new(config.identity_provider().machine_identity()?);
            let source = identity.split(':').next().unwrap_or_default();
            // The identity itself stays private; show where it came from and a fingerprint.
            println!("source: {source}");
            println!("fingerprint: {}", &sha256_hex(identity.as_bytes())[..16]);
        }
        "shared-secret" => {
            let (rest, hostname) = take_flag(rest, "--hostname")?;
            expect_args(&rest, 1, 2)?;
            let record = client_record(&config, &rest, hostname.as_deref())?;
            println!("{record}");
        }
        "token" => {
            let (rest, hostname) = take_flag(rest, "--hostname")?;
            expect_args(&rest, 2, 3)?;
            let record = client_record(&config, &rest[1..], hostname.as_deref())?;
            let token = mint_token(&rest[0], &record, &record.hostname, &record.username, None)?;
            println!("{token}");
        }
        "register" => {
            let (rest, override_hostname) = take_flag(rest, "--override")?;
            expect_args(&rest, 1, 1)?;
            let record: SharedSecretRecord =
                serde_json::from_str(&rest[0]).map_err(|e| CliError::Record(format!("{e}")))?;
            let passphrase = admin_passphrase(&config)?;
            let key = config
                .registration_store()
                .register(record, &passphrase, override_hostname.as_deref())?;
            println!("registered {key}");
        }
        "unregister" => {
            expect_args(rest, 1, 1)?;
            let passphrase = admin_passphrase(&config)?;
            let removed = config.registration_store().unregister(&rest[0], &passphrase)?;
            println!("{}", if removed { "removed" } else { "not registered" });
        }
        "list-registrations" => {
            expect_args(rest, 0, 0)?;
            let passphrase = admin_passphrase(&config)?;
            for record in config.registration_store().list(&passphrase)? {
                println!("{}: {record}", record.lookup_key());
            }
        }
        "set-secret" => {
            let (rest, comment) = take_flag(rest, "--comment")?;
            if rest.len() < 3 {
                return Err(CliError::Usage("set-secret needs a name, a value and at least one acl entry".to_string()));
            }
            let acl = rest[2..].to_vec();
            for pattern in &acl {
                validate_acl_pattern(pattern)?;
            }
            let mut record = SecretRecord::new(rest[1].as_str(), acl);
            record.comment = comment;
            let passphrase = admin_passphrase(&config)?;
            config.secrets_file().set_secret(&passphrase, &rest[0], record)?;
            info!(name = %rest[0], "secret stored");
        }
        "remove-secret" => {
            expect_args(rest, 1, 1)?;
            let passphrase = admin_passphrase(&config)?;
            let removed = config.secrets_file().remove_secret(&passphrase, &rest[0])?;
            println!("{}", if removed { "removed" } else { "no such secret" });
        }
        "list-secrets" => {
            expect_args(rest, 0, 0)?;
            let passphrase = admin_passphrase(&config)?;
            for name in config.secrets_file().names(&passphrase)? {
                println!("{name}");
            }
        }
        "get" => {
            expect_args(rest, 3, 3)?;
            let service = config.build_service();
            if service.state() == StoreState::Locked {
                let passphrase = admin_passphrase(&config)?;
                let unlocked = handlers::handle(&service, Request::SubmitPassphrase { passphrase: &passphrase });
                if !unlocked.is_ok() {
                    println!("{}", unlocked.body.as_str());
                    return Ok(());
                }
            }
            let reply = handlers::handle(
                &service,
                Request::GetSecret {
                    key_name: &rest[0],
                    token: &rest[1],
                    client_address: Some(rest[2].as_str()),
                },
            );
            println!("{}", reply.body.as_str());
        }
        other => return Err(CliError::Usage(format!("unknown command {other:?}"))),
    }
    Ok(())
}

/// `rest` is `[username, password?]`.
fn client_record(
    config: &KeymasterConfig,
    rest: &[String],
    hostname: Option<&str>,
) -> Result<SharedSecretRecord, CliError> {
    let username = rest.first().map(String::as_str).unwrap_or_default();
    let password = Zeroizing::new(rest.get(1).cloned().unwrap_or_default());
    Ok(derive_shared_secret(&config.identity_provider(), username, &password, hostname)?)
}

/// `KEYMASTER_PASSPHRASE`, falling back to the variable named by `passphraseEnv`.
fn admin_passphrase(config: &KeymasterConfig) -> Result<Zeroizing<String>, CliError> {
    env::var(PASSPHRASE_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .map(Zeroizing::new)
        .or_else(|| config.startup_passphrase())
        .ok_or(CliError::MissingPassphrase)
}

fn expect_args(args: &[String], min: usize, max: usize) -> Result<(), CliError> {
    if args.len() < min || args.len() > max {
        return Err(CliError::Usage(format!("expected {min}..={max} arguments, got {}", args.len())));
    }
    Ok(())
}

/// Pulls `name <value>` out of the argument list wherever it appears.
fn take_flag(args: &[String], name: &str) -> Result<(Vec<String>, Option<String>), CliError> {
    let mut rest = Vec::with_capacity(args.len());
    let mut value = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == name {
            let Some(v) = iter.next() else {
                return Err(CliError::Usage(format!("{name} requires a value")));
            };
            value = Some(v.clone());
        } else {
            rest.push(arg.clone());
        }
    }
    Ok((rest, value))
}
