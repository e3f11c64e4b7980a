//! Vault error types.

use healthvault_crypto::CryptoError;
use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault is locked")]
    Locked,
    #[error("invalid password")]
    InvalidPassword,
    #[error("invalid recovery key")]
    InvalidRecoveryKey,
    #[error("password too short (min {min} characters)")]
    PasswordTooShort { min: usize },
    #[error("session belongs to a different user")]
    WrongUser,
    #[error("key derivation task failed: {0}")]
    Task(String),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}
