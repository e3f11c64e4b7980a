//! ChaCha20-Poly1305 authenticated encryption.
//!
//! Every call draws a fresh 96-bit nonce from the OS RNG. There is no API
//! that accepts a caller-supplied nonce, so nonce reuse under one key cannot
//! be expressed.

use crate::error::{CryptoError, CryptoResult};
use crate::key::DerivedKey;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};

/// Nonce size in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Ciphertext plus the nonce it was sealed under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    #[serde(with = "crate::encoding::base64_array")]
    pub nonce: [u8; NONCE_SIZE],
    #[serde(with = "crate::encoding::base64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Total stored size (nonce + ciphertext + tag).
    pub fn len(&self) -> usize {
        NONCE_SIZE + self.ciphertext.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }
}

fn cipher_for(key: &DerivedKey) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()))
}

/// Encrypts `plaintext` under `key`.
pub fn encrypt(key: &DerivedKey, plaintext: &[u8]) -> CryptoResult<EncryptedData> {
    encrypt_with_aad(key, plaintext, &[])
}

/// Decrypts data produced by [`encrypt`].
pub fn decrypt(key: &DerivedKey, data: &EncryptedData) -> CryptoResult<Vec<u8>> {
    decrypt_with_aad(key, data, &[])
}

/// Encrypts `plaintext` and binds `aad` into the authentication tag.
pub fn encrypt_with_aad(
    key: &DerivedKey,
    plaintext: &[u8],
    aad: &[u8],
) -> CryptoResult<EncryptedData> {
    let nonce = ChaCha20Poly1305::generate_nonce(&mut rand::rngs::OsRng);
    let ciphertext = cipher_for(key)
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(&nonce);
    Ok(EncryptedData {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Decrypts data produced by [`encrypt_with_aad`] with the same `aad`.
pub fn decrypt_with_aad(
    key: &DerivedKey,
    data: &EncryptedData,
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    cipher_for(key)
        .decrypt(
            Nonce::from_slice(&data.nonce),
            Payload {
                msg: &data.ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption("wrong key or tampered data".to_string()))
}

/// Encrypts a UTF-8 string.
pub fn encrypt_string(key: &DerivedKey, plaintext: &str) -> CryptoResult<EncryptedData> {
    encrypt(key, plaintext.as_bytes())
}

/// Decrypts to a UTF-8 string.
pub fn decrypt_string(key: &DerivedKey, data: &EncryptedData) -> CryptoResult<String> {
    let bytes = decrypt(key, data)?;
    String::from_utf8(bytes).map_err(|e| CryptoError::Decryption(format!("invalid utf-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::generate_random_key;

    #[test]
    fn roundtrip() {
        let key = generate_random_key();
        let enc = encrypt(&key, b"hello").unwrap();
        assert_eq!(decrypt(&key, &enc).unwrap(), b"hello");
        assert_eq!(enc.ciphertext.len(), 5 + TAG_SIZE);
    }

    #[test]
    fn aad_mismatch_fails() {
        let key = generate_random_key();
        let enc = encrypt_with_aad(&key, b"hello", b"title").unwrap();
        assert!(decrypt_with_aad(&key, &enc, b"notes").is_err());
        assert!(decrypt_with_aad(&key, &enc, b"title").is_ok());
    }

    #[test]
    fn string_roundtrip() {
        let key = generate_random_key();
        let enc = encrypt_string(&key, "BP 120/80").unwrap();
        assert_eq!(decrypt_string(&key, &enc).unwrap(), "BP 120/80");
    }

    #[test]
    fn json_uses_base64() {
        let key = generate_random_key();
        let enc = encrypt(&key, b"x").unwrap();
        let value = serde_json::to_value(&enc).unwrap();
        assert!(value["nonce"].is_string());
        assert!(value["ciphertext"].is_string());
        let back: EncryptedData = serde_json::from_value(value).unwrap();
        assert_eq!(back, enc);
    }
}
