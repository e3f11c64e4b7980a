//! Recovery key: a BIP39 mnemonic that can reconstruct the master key.
//!
//! At enrollment the master key is encrypted under a key derived from the
//! mnemonic and the resulting blob is stored with the user profile. The
//! mnemonic itself is shown once and never stored.

use crate::cipher::{self, EncryptedData};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{DerivedKey, KEY_SIZE, KdfParams, MasterKey, Salt, derive_key};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

const RECOVERY_AAD: &[u8] = b"healthvault:recovery:v1";

/// 24-word BIP39 mnemonic (256 bits of entropy).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryKey(String);

impl RecoveryKey {
    /// Generates a fresh mnemonic from OS randomness.
    pub fn generate() -> CryptoResult<Self> {
        let mut entropy = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut entropy);
        let mnemonic = bip39::Mnemonic::from_entropy(&entropy)
            .map_err(|e| CryptoError::KeyDerivation(format!("mnemonic generation failed: {e}")));
        entropy.zeroize();
        Ok(Self(mnemonic?.to_string()))
    }

    /// Parses a user-entered phrase, normalizing whitespace and case.
    pub fn parse(phrase: &str) -> CryptoResult<Self> {
        let normalized = phrase
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        if normalized.is_empty() {
            return Err(CryptoError::InvalidInput("recovery key is empty".into()));
        }
        bip39::Mnemonic::parse_in_normalized(bip39::Language::English, &normalized)
            .map_err(|e| CryptoError::InvalidInput(format!("invalid recovery key: {e}")))?;
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn word_count(&self) -> usize {
        self.0.split(' ').count()
    }
}

impl fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryKey([REDACTED])")
    }
}

/// Master key encrypted with a recovery-key-derived key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryBlob {
    pub salt: Salt,
    pub kdf_params: KdfParams,
    pub encrypted_key: EncryptedData,
    /// Unix timestamp when this blob was created.
    pub created_at: i64,
}

fn recovery_wrapping_key(
    recovery_key: &RecoveryKey,
    salt: &Salt,
    params: &KdfParams,
) -> CryptoResult<DerivedKey> {
    derive_key(recovery_key.as_str(), salt, params)
}

/// Generates a new recovery key and encrypts `master_key` with it.
///
/// Returns `(recovery_key, blob)`. The key must be shown to the user once.
pub fn create_recovery_blob(
    master_key: &MasterKey,
    params: &KdfParams,
) -> CryptoResult<(RecoveryKey, RecoveryBlob)> {
    let recovery_key = RecoveryKey::generate()?;
    let blob = create_recovery_blob_with_key(master_key, &recovery_key, params)?;
    Ok((recovery_key, blob))
}

/// Encrypts `master_key` under an existing recovery key.
pub fn create_recovery_blob_with_key(
    master_key: &MasterKey,
    recovery_key: &RecoveryKey,
    params: &KdfParams,
) -> CryptoResult<RecoveryBlob> {
    let salt = Salt::random();
    let wrapping = recovery_wrapping_key(recovery_key, &salt, params)?;
    let encrypted_key = cipher::encrypt_with_aad(&wrapping, master_key.as_bytes(), RECOVERY_AAD)?;

    Ok(RecoveryBlob {
        salt,
        kdf_params: *params,
        encrypted_key,
        created_at: chrono::Utc::now().timestamp(),
    })
}

/// Reconstructs the master key from the recovery key.
///
/// For a given enrollment this yields the same key as the password path.
pub fn derive_from_recovery(
    recovery_key: &RecoveryKey,
    blob: &RecoveryBlob,
) -> CryptoResult<MasterKey> {
    let wrapping = recovery_wrapping_key(recovery_key, &blob.salt, &blob.kdf_params)?;
    let mut plaintext = cipher::decrypt_with_aad(&wrapping, &blob.encrypted_key, RECOVERY_AAD)
        .map_err(|_| CryptoError::KeyUnwrap("recovery key does not open this blob".into()))?;

    let key = DerivedKey::from_slice(&plaintext).map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_SIZE,
        actual: plaintext.len(),
    });
    plaintext.zeroize();
    Ok(MasterKey::from_bytes(*key?.as_bytes()))
}

/// Re-encrypts a blob for a new master key, keeping the same recovery key.
///
/// Verifies the recovery key against the old blob first, so a mistyped
/// phrase cannot silently replace a working blob.
pub fn reencrypt_recovery_blob(
    blob: &RecoveryBlob,
    recovery_key: &RecoveryKey,
    new_master_key: &MasterKey,
) -> CryptoResult<RecoveryBlob> {
    let _ = derive_from_recovery(recovery_key, blob)?;
    let mut fresh = create_recovery_blob_with_key(new_master_key, recovery_key, &blob.kdf_params)?;
    fresh.created_at = blob.created_at;
    Ok(fresh)
}
