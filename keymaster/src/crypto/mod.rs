//! Cryptography used by the keymaster: digest helpers for the token protocol and
//! the passphrase-sealed file format shared by both on-disk stores.

pub mod integrity;
pub mod sealed;
