//! Record-level envelope encryption.
//!
//! A record is a set of named fields (title, extracted text, structured
//! data, attachment). All fields share one fresh content key, each with its
//! own nonce, and the content key is wrapped once per authorized reader.
//! Sharing a record adds a wrapped key; it never touches field ciphertext.

use crate::envelope::{
    self, EncryptedField, KeyMaterial, WrapAlgorithm, WrapMode, WrappedKey,
};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{ContentKey, MasterKey};
use crypto_box::PublicKey;
use healthvault_types::{RecordHash, UserId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Well-known field names.
pub mod fields {
    pub const TITLE: &str = "title";
    pub const EXTRACTED_TEXT: &str = "extractedText";
    pub const STRUCTURED_DATA: &str = "structuredData";
    pub const ATTACHMENT: &str = "attachment";
}

/// One reader's copy of the record's content key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKeyEntry {
    pub subject_user_id: UserId,
    pub wrapped_content_key: WrappedKey,
    pub is_creator: bool,
}

impl WrappedKeyEntry {
    pub fn wrap_algorithm(&self) -> WrapAlgorithm {
        self.wrapped_content_key.algorithm()
    }
}

/// A party the content key is wrapped for.
#[derive(Clone, Copy)]
pub struct Party<'a> {
    pub user_id: &'a UserId,
    pub wrap: WrapMode<'a>,
}

/// Output of [`encrypt_record`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedRecord {
    pub encrypted_fields: Vec<EncryptedField>,
    pub wrapped_keys: Vec<WrappedKeyEntry>,
}

/// How [`decrypt_record`] treats fields that fail authentication.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DecryptMode {
    /// Return whatever decrypts and list the tampered fields.
    #[default]
    Partial,
    /// Fail the whole call if any field is tampered.
    AllOrNothing,
}

/// Per-field outcome of decrypting a record.
#[derive(Debug, Default)]
pub struct DecryptedRecord {
    pub fields: BTreeMap<String, Vec<u8>>,
    pub tampered: Vec<String>,
}

impl DecryptedRecord {
    pub fn is_complete(&self) -> bool {
        self.tampered.is_empty()
    }

    /// One `FieldTampered` error per field that failed authentication.
    pub fn errors(&self) -> Vec<CryptoError> {
        self.tampered
            .iter()
            .map(|field| CryptoError::FieldTampered {
                field: field.clone(),
            })
            .collect()
    }

    /// Field as UTF-8, if present and valid.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(|b| std::str::from_utf8(b).ok())
    }
}

/// Encrypts every present field and wraps the content key for each party.
///
/// `creator` gets the one `is_creator = true` entry. Duplicate user ids across
/// parties are rejected.
pub fn encrypt_record(
    plaintext_fields: &BTreeMap<String, Vec<u8>>,
    creator: Party<'_>,
    others: &[Party<'_>],
) -> CryptoResult<EncryptedRecord> {
    let mut seen = HashSet::new();
    for party in std::iter::once(&creator).chain(others) {
        if !seen.insert(party.user_id) {
            return Err(CryptoError::InvalidInput(format!(
                "user {} listed more than once",
                party.user_id
            )));
        }
    }

    let content_key = ContentKey::generate();

    let encrypted_fields = plaintext_fields
        .iter()
        .map(|(name, plaintext)| envelope::encrypt_field(name, plaintext, &content_key))
        .collect::<CryptoResult<Vec<_>>>()?;

    let mut wrapped_keys = Vec::with_capacity(others.len() + 1);
    wrapped_keys.push(WrappedKeyEntry {
        subject_user_id: creator.user_id.clone(),
        wrapped_content_key: envelope::wrap_key(&content_key, creator.wrap)?,
        is_creator: true,
    });
    for party in others {
        wrapped_keys.push(WrappedKeyEntry {
            subject_user_id: party.user_id.clone(),
            wrapped_content_key: envelope::wrap_key(&content_key, party.wrap)?,
            is_creator: false,
        });
    }

    debug!(
        fields = encrypted_fields.len(),
        readers = wrapped_keys.len(),
        "encrypted record"
    );

    Ok(EncryptedRecord {
        encrypted_fields,
        wrapped_keys,
    })
}

/// Recovers the content key for `requester` from the record's wrapped keys.
///
/// No entry for the requester is `AccessDenied`, whatever role they hold
/// elsewhere.
pub fn unwrap_content_key(
    wrapped_keys: &[WrappedKeyEntry],
    requester: &UserId,
    material: KeyMaterial<'_>,
) -> CryptoResult<ContentKey> {
    let entry = wrapped_keys
        .iter()
        .find(|e| &e.subject_user_id == requester)
        .ok_or_else(|| CryptoError::AccessDenied {
            user: requester.clone(),
        })?;
    envelope::unwrap_key(&entry.wrapped_content_key, material)
}

/// Decrypts a record for `requester`.
///
/// Every field is attempted. In `Partial` mode tampered fields are listed on
/// the result; in `AllOrNothing` mode the first tampered field is returned as
/// `FieldTampered`.
pub fn decrypt_record(
    encrypted_fields: &[EncryptedField],
    wrapped_keys: &[WrappedKeyEntry],
    requester: &UserId,
    material: KeyMaterial<'_>,
    mode: DecryptMode,
) -> CryptoResult<DecryptedRecord> {
    let content_key = unwrap_content_key(wrapped_keys, requester, material)?;

    let mut out = DecryptedRecord::default();
    for field in encrypted_fields {
        match envelope::decrypt_field(field, &content_key) {
            Ok(plaintext) => {
                out.fields.insert(field.field_name.clone(), plaintext);
            }
            Err(CryptoError::FieldTampered { field }) => out.tampered.push(field),
            Err(e) => return Err(e),
        }
    }

    if mode == DecryptMode::AllOrNothing {
        if let Some(field) = out.tampered.first() {
            return Err(CryptoError::FieldTampered {
                field: field.clone(),
            });
        }
    }

    Ok(out)
}

/// Wraps an existing content key for a new recipient.
pub fn reencrypt_for_new_recipient(
    content_key: &ContentKey,
    recipient: &UserId,
    recipient_public_key: &PublicKey,
) -> CryptoResult<WrappedKeyEntry> {
    Ok(WrappedKeyEntry {
        subject_user_id: recipient.clone(),
        wrapped_content_key: envelope::wrap_key(
            content_key,
            WrapMode::Asymmetric(recipient_public_key),
        )?,
        is_creator: false,
    })
}

/// Moves the creator's own entry from an old master key to a new one.
///
/// An entry that already opens under `new_master` is returned unchanged, so
/// an interrupted password change can be run again.
pub fn rewrap_owner_entry(
    entry: &WrappedKeyEntry,
    old_master: &MasterKey,
    new_master: &MasterKey,
) -> CryptoResult<WrappedKeyEntry> {
    if envelope::unwrap_key(&entry.wrapped_content_key, KeyMaterial::Symmetric(new_master)).is_ok()
    {
        return Ok(entry.clone());
    }
    let content_key =
        envelope::unwrap_key(&entry.wrapped_content_key, KeyMaterial::Symmetric(old_master))?;
    Ok(WrappedKeyEntry {
        subject_user_id: entry.subject_user_id.clone(),
        wrapped_content_key: envelope::wrap_key(&content_key, WrapMode::Symmetric(new_master))?,
        is_creator: entry.is_creator,
    })
}

/// Checks the wrapped-key invariants: exactly one creator, no duplicates.
pub fn validate_wrapped_keys(wrapped_keys: &[WrappedKeyEntry]) -> CryptoResult<()> {
    let creators = wrapped_keys.iter().filter(|e| e.is_creator).count();
    if creators != 1 {
        return Err(CryptoError::InvalidInput(format!(
            "expected exactly one creator entry, found {creators}"
        )));
    }
    let mut seen = HashSet::new();
    for entry in wrapped_keys {
        if !seen.insert(&entry.subject_user_id) {
            return Err(CryptoError::InvalidInput(format!(
                "duplicate wrapped key for user {}",
                entry.subject_user_id
            )));
        }
    }
    Ok(())
}

/// Content hash anchored on the ledger for verification and disputes.
///
/// Covers field names, nonces and ciphertext in name order, so it is stable
/// across re-wraps and changes whenever any ciphertext changes.
pub fn record_hash(encrypted_fields: &[EncryptedField]) -> RecordHash {
    let mut sorted: Vec<&EncryptedField> = encrypted_fields.iter().collect();
    sorted.sort_by(|a, b| a.field_name.cmp(&b.field_name));

    let mut hasher = Sha256::new();
    for field in sorted {
        hasher.update((field.field_name.len() as u64).to_be_bytes());
        hasher.update(field.field_name.as_bytes());
        hasher.update(field.iv);
        hasher.update((field.ciphertext.len() as u64).to_be_bytes());
        hasher.update(&field.ciphertext);
    }
    RecordHash(hasher.finalize().into())
}
