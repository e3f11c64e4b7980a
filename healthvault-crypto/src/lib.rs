//! Encryption layer for HealthVault.
//!
//! Provides envelope encryption for health records using:
//! - Argon2id for master-key derivation from passwords
//! - ChaCha20-Poly1305 for authenticated field encryption
//! - X25519 sealed boxes for sharing content keys with other users
//! - BIP39 mnemonics as recovery keys
//!
//! # Architecture
//!
//! 1. **Master Key**: derived from the user's password and a stored salt.
//!    Never persisted; re-derived at every unlock.
//!
//! 2. **Content Key**: random per record. Encrypts every field of that
//!    record, each under its own nonce.
//!
//! 3. **Wrapped keys**: the content key wrapped once per reader, under the
//!    owner's master key or under a recipient's public key.
//!
//! Granting access wraps the existing content key again; record ciphertext
//! is never rewritten.

pub mod cipher;
pub mod encoding;
pub mod envelope;
mod error;
pub mod key;
pub mod record;
pub mod recovery;

pub use cipher::{
    EncryptedData, NONCE_SIZE, TAG_SIZE, decrypt, decrypt_string, decrypt_with_aad, encrypt,
    encrypt_string, encrypt_with_aad,
};
pub use envelope::{
    EncryptedField, KeyMaterial, SealedEnvelope, SharingKeyPair, WrapAlgorithm, WrapMode,
    WrappedKey, decrypt_field, encrypt_field, unwrap_key, wrap_key,
};
pub use error::{CryptoError, CryptoResult};
pub use key::{
    ContentKey, DerivedKey, KEY_SIZE, KdfParams, MasterKey, SALT_SIZE, Salt, derive_key,
    derive_master_key, generate_random_key,
};
pub use record::{
    DecryptMode, DecryptedRecord, EncryptedRecord, Party, WrappedKeyEntry, decrypt_record,
    encrypt_record, reencrypt_for_new_recipient, record_hash, unwrap_content_key,
};
pub use recovery::{
    RecoveryBlob, RecoveryKey, create_recovery_blob, create_recovery_blob_with_key,
    derive_from_recovery, reencrypt_recovery_blob,
};

/// Re-exported so callers can name sharing keys without a direct crypto_box dependency.
pub use crypto_box::{PublicKey, SecretKey};
