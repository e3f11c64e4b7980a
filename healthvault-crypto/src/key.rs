//! Key derivation and key types.
//!
//! The master key is derived from the user's password with Argon2id. The
//! parameters are fixed per enrollment and stored next to the salt, so the
//! same password always reproduces the same key.

use crate::error::{CryptoError, CryptoResult};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of every symmetric key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of a KDF salt in bytes.
pub const SALT_SIZE: usize = 16;

/// Raw 256-bit symmetric key, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_SIZE]);

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Builds a key from a slice, rejecting anything that is not 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

/// The user's long-lived key. Only ever held in memory.
#[derive(Clone, Debug, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey(DerivedKey);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(DerivedKey::from_bytes(bytes))
    }

    pub fn key(&self) -> &DerivedKey {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        self.0.as_bytes()
    }
}

impl PartialEq for MasterKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for MasterKey {}

/// Per-record data key. Generated fresh for every record.
#[derive(Clone, Debug, Zeroize, ZeroizeOnDrop)]
pub struct ContentKey(DerivedKey);

impl ContentKey {
    pub fn generate() -> Self {
        Self(generate_random_key())
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(DerivedKey::from_bytes(bytes))
    }

    pub fn key(&self) -> &DerivedKey {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        self.0.as_bytes()
    }
}

impl PartialEq for ContentKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for ContentKey {}

/// Per-user KDF salt. Not secret; stored with the user profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt(#[serde(with = "crate::encoding::base64_array")] [u8; SALT_SIZE]);

impl Salt {
    pub fn random() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parses a stored salt; an empty or short salt is `InvalidInput`.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.is_empty() {
            return Err(CryptoError::InvalidInput("salt is empty".into()));
        }
        let arr: [u8; SALT_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidInput(format!(
                "salt must be {SALT_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }
}

/// Argon2id work factor.
///
/// The default (64 MiB, 3 passes, 4 lanes) is the production setting. It is
/// recorded with each enrollment so later derivations use the same cost.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests. Never use for real enrollments.
    pub fn test() -> Self {
        Self {
            memory_kib: 256,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn argon2(&self) -> CryptoResult<Argon2<'static>> {
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CryptoError::KeyDerivation(format!("invalid argon2 params: {e}")))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Derives a 256-bit key from a password and salt.
///
/// Deterministic and side-effect free. CPU and memory heavy, so async
/// callers should run it on a blocking thread.
pub fn derive_key(password: &str, salt: &Salt, params: &KdfParams) -> CryptoResult<DerivedKey> {
    if password.is_empty() {
        return Err(CryptoError::InvalidInput("password is empty".into()));
    }

    let mut out = [0u8; KEY_SIZE];
    params
        .argon2()?
        .hash_password_into(password.as_bytes(), salt.as_bytes(), &mut out)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let key = DerivedKey::from_bytes(out);
    out.zeroize();
    Ok(key)
}

/// Derives the master key from the user's password.
pub fn derive_master_key(
    password: &str,
    salt: &Salt,
    params: &KdfParams,
) -> CryptoResult<MasterKey> {
    derive_key(password, salt, params).map(MasterKey)
}

/// Generates a random 256-bit key.
pub fn generate_random_key() -> DerivedKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let key = DerivedKey::from_bytes(bytes);
    bytes.zeroize();
    key
}
