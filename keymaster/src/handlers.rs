//! Transport-agnostic request boundary. Whatever carries requests (HTTP,
//! a socket, the CLI) turns them into a [`Request`] and sends back the
//! [`Reply`] body. Failures collapse to a few generic strings so a client can
//! never learn which check it tripped; the full reason only goes to the log.

use zeroize::Zeroizing;

use crate::service::{KeymasterService, ServiceError, HEALTH_NOT_READY};

pub const REPLY_OK: &str = "ok";
pub const REPLY_ERROR: &str = "error";
pub const REPLY_NOT_AUTHORIZED: &str = "not authorized";

pub enum Request<'a> {
    GetSecret {
        key_name: &'a str,
        token: &'a str,
        client_address: Option<&'a str>,
    },
    SubmitPassphrase {
        passphrase: &'a str,
    },
    Health,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    NotReady,
    Denied,
    Error,
}

/// Response body plus a coarse status a transport can map onto its own codes.
#[derive(Debug)]
pub struct Reply {
    pub status: ReplyStatus,
    pub body: Zeroizing<String>,
}

impl Reply {
    fn new(status: ReplyStatus, body: &str) -> Self {
        Self {
            status,
            body: Zeroizing::new(body.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }
}

pub fn handle(service: &KeymasterService, request: Request<'_>) -> Reply {
    match request {
        Request::GetSecret {
            key_name,
            token,
            client_address,
        } => match service.get_secret(key_name, token, client_address) {
            Ok(value) => Reply {
                status: ReplyStatus::Ok,
                body: value,
            },
            Err(ServiceError::NotReady) => Reply::new(ReplyStatus::NotReady, HEALTH_NOT_READY),
            Err(_) => Reply::new(ReplyStatus::Denied, REPLY_NOT_AUTHORIZED),
        },
        Request::SubmitPassphrase { passphrase } => match service.submit_passphrase(passphrase) {
            Ok(()) => Reply::new(ReplyStatus::Ok, REPLY_OK),
            Err(_) => Reply::new(ReplyStatus::Error, REPLY_ERROR),
        },
        Request::Health => {
            let body = service.health();
            let status = if body == HEALTH_NOT_READY {
                ReplyStatus::NotReady
            } else {
                ReplyStatus::Ok
            };
            Reply::new(status, body)
        }
        Request::Reset => match service.reset() {
            Ok(()) => Reply::new(ReplyStatus::Ok, REPLY_OK),
            Err(_) => Reply::new(ReplyStatus::Error, REPLY_ERROR),
        },
    }
}
