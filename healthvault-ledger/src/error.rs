//! Dual-write error types.

use healthvault_types::UserId;
use std::time::Duration;
use thiserror::Error;

/// Result type for document-store and ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors that can occur while keeping the document store and the access
/// ledger in step.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger write failed: {0}")]
    LedgerWrite(String),

    #[error("ledger call timed out after {0:?}")]
    Timeout(Duration),

    #[error("document conflict on {collection}/{id}: expected version {expected}")]
    Conflict {
        collection: String,
        id: String,
        expected: u64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("user {0} has no public key on file")]
    NoPublicKey(UserId),

    #[error("session is locked")]
    Locked,

    #[error("operation denied: {0}")]
    Denied(String),

    #[error("{kind} {id} failed on ledger: {reason}")]
    AttestationFailed {
        kind: &'static str,
        id: String,
        reason: String,
    },

    #[error("blob storage error: {0}")]
    Blob(String),

    #[error("document store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] healthvault_crypto::CryptoError),
}

impl LedgerError {
    /// Whether a later replay of the same ledger call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::LedgerWrite(_) | LedgerError::Timeout(_))
    }
}

impl From<healthvault_vault::VaultError> for LedgerError {
    fn from(err: healthvault_vault::VaultError) -> Self {
        match err {
            healthvault_vault::VaultError::Locked => LedgerError::Locked,
            healthvault_vault::VaultError::Crypto(e) => LedgerError::Crypto(e),
            other => LedgerError::Denied(other.to_string()),
        }
    }
}
