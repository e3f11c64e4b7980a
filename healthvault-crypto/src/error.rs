//! Crypto error types.

use healthvault_types::UserId;
use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur in key derivation and envelope encryption.
///
/// Integrity failures (`KeyUnwrap`, `FieldTampered`) never come with partial
/// key material or plaintext attached.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("key unwrap failed: {0}")]
    KeyUnwrap(String),

    #[error("field '{field}' failed authentication")]
    FieldTampered { field: String },

    #[error("access denied: no wrapped key for user {user}")]
    AccessDenied { user: UserId },

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
