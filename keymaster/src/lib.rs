//! Keymaster: machine-bound token authentication and a self-locking service
//! that hands bootstrap secrets to enrolled machines.
//!
//! Clients regenerate their shared secret from the machine identity on every
//! use and mint a one-shot token per secret they request. The server keeps its
//! secrets sealed on disk until an administrator supplies the passphrase, and
//! drops them from memory the moment a request looks hostile.

pub mod config;
pub mod crypto;
pub mod handlers;
pub mod identity;
pub mod registry;
pub mod secrets;
pub mod service;
pub mod shared_secret;
pub mod textfile;
pub mod token;
pub mod verifier;
