//! Envelope cipher: per-field encryption and content-key wrapping.
//!
//! Record fields are encrypted with the record's content key. The content
//! key itself is wrapped once per reader: under the owner's master key
//! (ChaCha20-Poly1305) or under a recipient's X25519 public key (ephemeral
//! X25519 + XSalsa20-Poly1305 sealed box).

use crate::cipher::{self, EncryptedData, NONCE_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{ContentKey, DerivedKey, KEY_SIZE, MasterKey};
use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

const CONTENT_KEY_AAD: &[u8] = b"healthvault:content-key:v1";
const SHARING_KEY_AAD: &[u8] = b"healthvault:sharing-secret:v1";

/// X25519 keypair a user publishes for receiving shared records.
///
/// The secret key implements `ZeroizeOnDrop` (from crypto_box).
pub struct SharingKeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl SharingKeyPair {
    pub fn generate() -> Self {
        let secret = SecretKey::generate(&mut rand::rngs::OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = SecretKey::from(bytes);
        let public = secret.public_key();
        Self { secret, public }
    }
}

impl fmt::Debug for SharingKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharingKeyPair")
            .field("public", &crate::encoding::to_base64(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// One encrypted field of a record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedField {
    pub field_name: String,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "crate::encoding::base64_array")]
    pub iv: [u8; NONCE_SIZE],
}

/// Encrypts one field under the content key.
///
/// The field name is bound as associated data, so a ciphertext moved to a
/// different field fails authentication.
pub fn encrypt_field(
    field_name: &str,
    plaintext: &[u8],
    content_key: &ContentKey,
) -> CryptoResult<EncryptedField> {
    let sealed = cipher::encrypt_with_aad(content_key.key(), plaintext, field_name.as_bytes())?;
    Ok(EncryptedField {
        field_name: field_name.to_string(),
        ciphertext: sealed.ciphertext,
        iv: sealed.nonce,
    })
}

/// Decrypts one field. Any authentication failure is `FieldTampered`.
pub fn decrypt_field(field: &EncryptedField, content_key: &ContentKey) -> CryptoResult<Vec<u8>> {
    let sealed = EncryptedData {
        nonce: field.iv,
        ciphertext: field.ciphertext.clone(),
    };
    cipher::decrypt_with_aad(content_key.key(), &sealed, field.field_name.as_bytes()).map_err(
        |_| CryptoError::FieldTampered {
            field: field.field_name.clone(),
        },
    )
}

/// Key material a content key is wrapped under.
#[derive(Clone, Copy)]
pub enum WrapMode<'a> {
    /// The owner's own copy, wrapped under their master key.
    Symmetric(&'a MasterKey),
    /// A shared copy, sealed to the recipient's public key.
    Asymmetric(&'a PublicKey),
}

/// Key material a reader presents to unwrap their copy.
#[derive(Clone, Copy)]
pub enum KeyMaterial<'a> {
    Symmetric(&'a MasterKey),
    Asymmetric(&'a SecretKey),
}

/// Algorithm tag persisted with each wrapped key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrapAlgorithm {
    #[serde(rename = "chacha20poly1305-master")]
    MasterKeyAead,
    #[serde(rename = "x25519-xsalsa20poly1305")]
    SealedBox,
}

/// A content key wrapped for one reader.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "wrapAlgorithm", rename_all_fields = "camelCase")]
pub enum WrappedKey {
    #[serde(rename = "chacha20poly1305-master")]
    Symmetric { sealed: EncryptedData },
    #[serde(rename = "x25519-xsalsa20poly1305")]
    Sealed { envelope: SealedEnvelope },
}

impl WrappedKey {
    pub fn algorithm(&self) -> WrapAlgorithm {
        match self {
            WrappedKey::Symmetric { .. } => WrapAlgorithm::MasterKeyAead,
            WrappedKey::Sealed { .. } => WrapAlgorithm::SealedBox,
        }
    }
}

/// Content key sealed with a recipient's X25519 public key.
///
/// Uses an ephemeral keypair per seal; the ephemeral public key travels with
/// the ciphertext so the recipient can rebuild the shared secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedEnvelope {
    #[serde(with = "crate::encoding::base64_array")]
    pub ephemeral_public_key: [u8; 32],
    #[serde(with = "crate::encoding::base64_array")]
    pub nonce: [u8; 24],
    #[serde(with = "crate::encoding::base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Seals arbitrary key bytes for a recipient.
pub fn seal_for_recipient(secret: &[u8], recipient_pk: &PublicKey) -> CryptoResult<SealedEnvelope> {
    let ephemeral = SecretKey::generate(&mut rand::rngs::OsRng);
    let ephemeral_pk = ephemeral.public_key();
    let salsa_box = SalsaBox::new(recipient_pk, &ephemeral);

    let mut nonce_bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = salsa_box
        .encrypt(crypto_box::Nonce::from_slice(&nonce_bytes), secret)
        .map_err(|e| CryptoError::Encryption(format!("envelope seal failed: {e}")))?;

    Ok(SealedEnvelope {
        ephemeral_public_key: *ephemeral_pk.as_bytes(),
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Opens a sealed envelope with the recipient's secret key.
pub fn open_sealed(envelope: &SealedEnvelope, recipient_sk: &SecretKey) -> CryptoResult<Vec<u8>> {
    let ephemeral_pk = PublicKey::from(envelope.ephemeral_public_key);
    let salsa_box = SalsaBox::new(&ephemeral_pk, recipient_sk);

    salsa_box
        .decrypt(
            crypto_box::Nonce::from_slice(&envelope.nonce),
            envelope.ciphertext.as_ref(),
        )
        .map_err(|_| {
            CryptoError::KeyUnwrap("envelope open failed (wrong key or tampered data)".to_string())
        })
}

/// Wraps a content key for one reader.
pub fn wrap_key(content_key: &ContentKey, mode: WrapMode<'_>) -> CryptoResult<WrappedKey> {
    match mode {
        WrapMode::Symmetric(master) => {
            let sealed =
                cipher::encrypt_with_aad(master.key(), content_key.as_bytes(), CONTENT_KEY_AAD)?;
            Ok(WrappedKey::Symmetric { sealed })
        }
        WrapMode::Asymmetric(public_key) => {
            let envelope = seal_for_recipient(content_key.as_bytes(), public_key)?;
            Ok(WrappedKey::Sealed { envelope })
        }
    }
}

/// Unwraps a content key. Fails closed on any mismatch or tag failure.
pub fn unwrap_key(wrapped: &WrappedKey, material: KeyMaterial<'_>) -> CryptoResult<ContentKey> {
    let mut bytes = match (wrapped, material) {
        (WrappedKey::Symmetric { sealed }, KeyMaterial::Symmetric(master)) => {
            cipher::decrypt_with_aad(master.key(), sealed, CONTENT_KEY_AAD).map_err(|_| {
                CryptoError::KeyUnwrap("master-key wrap failed authentication".to_string())
            })?
        }
        (WrappedKey::Sealed { envelope }, KeyMaterial::Asymmetric(secret)) => {
            open_sealed(envelope, secret)?
        }
        (wrapped, _) => {
            return Err(CryptoError::KeyUnwrap(format!(
                "key material does not match wrap algorithm {:?}",
                wrapped.algorithm()
            )));
        }
    };

    let result = DerivedKey::from_slice(&bytes)
        .map(|k| ContentKey::from_bytes(*k.as_bytes()))
        .map_err(|_| CryptoError::KeyUnwrap(format!("unwrapped key is not {KEY_SIZE} bytes")));
    zeroize::Zeroize::zeroize(&mut bytes);
    result
}

/// Encrypts the user's sharing secret key under their master key.
pub fn encrypt_secret_key(secret: &SecretKey, master: &MasterKey) -> CryptoResult<EncryptedData> {
    cipher::encrypt_with_aad(master.key(), &secret.to_bytes(), SHARING_KEY_AAD)
}

/// Decrypts a sharing secret key stored by [`encrypt_secret_key`].
pub fn decrypt_secret_key(data: &EncryptedData, master: &MasterKey) -> CryptoResult<SecretKey> {
    let mut plaintext = cipher::decrypt_with_aad(master.key(), data, SHARING_KEY_AAD)
        .map_err(|_| CryptoError::KeyUnwrap("sharing secret key failed authentication".into()))?;
    if plaintext.len() != 32 {
        let actual = plaintext.len();
        zeroize::Zeroize::zeroize(&mut plaintext);
        return Err(CryptoError::InvalidKeyLength {
            expected: 32,
            actual,
        });
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&plaintext);
    zeroize::Zeroize::zeroize(&mut plaintext);
    let secret = SecretKey::from(bytes);
    zeroize::Zeroize::zeroize(&mut bytes);
    Ok(secret)
}
