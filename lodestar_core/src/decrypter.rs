//! Pluggable decryption for confidential config values.
//!
//! The core never ships a cipher; callers inject an implementation through
//! the client options. Without one, resolving a value that carries
//! `decrypt_with` fails.

/// Error returned by a [`Decrypter`] implementation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct DecryptError(pub String);

pub trait Decrypter: Send + Sync {
    /// Decrypt `value` using `secret_key` (the resolved string value of the
    /// config named by `decrypt_with`).
    fn decrypt_value(&self, secret_key: &str, value: &str) -> Result<String, DecryptError>;
}

/// Default stand-in used when no decrypter is configured.
pub struct NoDecrypter;

impl Decrypter for NoDecrypter {
    fn decrypt_value(&self, _secret_key: &str, _value: &str) -> Result<String, DecryptError> {
        Err(DecryptError("no decrypter configured".to_owned()))
    }
}
