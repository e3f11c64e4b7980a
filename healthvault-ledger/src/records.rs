//! Encrypted record documents.
//!
//! A record document embeds its encrypted fields and its `wrappedKeys`
//! array. An attachment's ciphertext lives in blob storage; the document
//! keeps only its path, URL and IV.

use crate::blob::{BlobStorage, attachment_path};
use crate::error::{LedgerError, LedgerResult};
use crate::locks::KeyedLocks;
use crate::store::{Filter, TypedStore};
use crate::types::collections;
use chrono::{DateTime, Utc};
use healthvault_crypto::encoding::base64_array;
use healthvault_crypto::record::{fields, rewrap_owner_entry};
use healthvault_crypto::{
    ContentKey, DecryptMode, DecryptedRecord, EncryptedField, KeyMaterial, MasterKey, NONCE_SIZE,
    Party, WrapMode, WrappedKeyEntry, decrypt_record, encrypt_record, record_hash,
    unwrap_content_key,
};
use healthvault_types::{RecordHash, RecordId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Where an attachment's ciphertext was uploaded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub path: String,
    pub url: String,
    #[serde(with = "base64_array")]
    pub iv: [u8; NONCE_SIZE],
}

/// Stored shape of one record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDocument {
    pub record_id: RecordId,
    pub owner_id: UserId,
    /// Inline fields; the attachment, if any, is in `attachment`.
    pub encrypted_fields: Vec<EncryptedField>,
    #[serde(default)]
    pub attachment: Option<AttachmentRef>,
    pub wrapped_keys: Vec<WrappedKeyEntry>,
    /// Subjects of `wrapped_keys`, for membership queries.
    pub reader_ids: Vec<UserId>,
    pub record_hash: RecordHash,
    pub created_at: DateTime<Utc>,
}

impl RecordDocument {
    pub fn has_reader(&self, user_id: &UserId) -> bool {
        self.wrapped_keys.iter().any(|e| &e.subject_user_id == user_id)
    }

    fn sync_readers(&mut self) {
        self.reader_ids = self
            .wrapped_keys
            .iter()
            .map(|e| e.subject_user_id.clone())
            .collect();
    }
}

/// Reads and writes record documents and their attachment blobs.
#[derive(Clone)]
pub struct RecordRepository {
    store: TypedStore,
    blobs: Arc<dyn BlobStorage>,
    creating: Arc<KeyedLocks<RecordId>>,
}

impl RecordRepository {
    pub fn new(store: TypedStore, blobs: Arc<dyn BlobStorage>) -> Self {
        Self {
            store,
            blobs,
            creating: Arc::new(KeyedLocks::new()),
        }
    }

    /// Encrypts `plaintext_fields` for `owner` and persists the record.
    ///
    /// The attachment ciphertext is uploaded before the document is written,
    /// so a stored document never points at a missing blob. A taken id is
    /// rejected before anything is uploaded, so the existing record's
    /// attachment is never overwritten.
    pub async fn create(
        &self,
        record_id: RecordId,
        owner: &UserId,
        master: &MasterKey,
        plaintext_fields: &BTreeMap<String, Vec<u8>>,
    ) -> LedgerResult<RecordDocument> {
        let encrypted = encrypt_record(
            plaintext_fields,
            Party {
                user_id: owner,
                wrap: WrapMode::Symmetric(master),
            },
            &[],
        )?;
        let hash = record_hash(&encrypted.encrypted_fields);

        let _guard = self.creating.lock(record_id.clone()).await;
        if self
            .store
            .raw()
            .get(collections::RECORDS, record_id.as_str())
            .await?
            .is_some()
        {
            return Err(LedgerError::Conflict {
                collection: collections::RECORDS.to_string(),
                id: record_id.to_string(),
                expected: 0,
            });
        }

        let mut inline = Vec::with_capacity(encrypted.encrypted_fields.len());
        let mut attachment = None;
        for field in encrypted.encrypted_fields {
            if field.field_name == fields::ATTACHMENT {
                let path = attachment_path(&record_id);
                let url = self.blobs.put(&path, field.ciphertext).await?;
                attachment = Some(AttachmentRef {
                    path,
                    url,
                    iv: field.iv,
                });
            } else {
                inline.push(field);
            }
        }

        let mut doc = RecordDocument {
            record_id: record_id.clone(),
            owner_id: owner.clone(),
            encrypted_fields: inline,
            attachment,
            wrapped_keys: encrypted.wrapped_keys,
            reader_ids: Vec::new(),
            record_hash: hash,
            created_at: Utc::now(),
        };
        doc.sync_readers();

        self.store
            .create(collections::RECORDS, record_id.as_str(), &doc)
            .await?;
        info!(record = %record_id, owner = %owner, "created encrypted record");
        Ok(doc)
    }

    pub async fn load(&self, record_id: &RecordId) -> LedgerResult<RecordDocument> {
        Ok(self
            .store
            .require::<RecordDocument>(collections::RECORDS, record_id.as_str())
            .await?
            .value)
    }

    /// Every encrypted field of the record, attachment included.
    pub async fn encrypted_fields(&self, doc: &RecordDocument) -> LedgerResult<Vec<EncryptedField>> {
        let mut all = doc.encrypted_fields.clone();
        if let Some(attachment) = &doc.attachment {
            let ciphertext = self.blobs.get(&attachment.path).await?;
            all.push(EncryptedField {
                field_name: fields::ATTACHMENT.to_string(),
                ciphertext,
                iv: attachment.iv,
            });
        }
        Ok(all)
    }

    /// Decrypts a record for `requester`.
    pub async fn decrypt(
        &self,
        record_id: &RecordId,
        requester: &UserId,
        material: KeyMaterial<'_>,
        mode: DecryptMode,
    ) -> LedgerResult<DecryptedRecord> {
        let doc = self.load(record_id).await?;
        if !doc.has_reader(requester) {
            return Err(healthvault_crypto::CryptoError::AccessDenied {
                user: requester.clone(),
            }
            .into());
        }
        let fields = self.encrypted_fields(&doc).await?;
        let out = decrypt_record(&fields, &doc.wrapped_keys, requester, material, mode)?;
        if !out.is_complete() {
            debug!(record = %record_id, tampered = ?out.tampered, "partial decryption");
        }
        Ok(out)
    }

    /// Content key via the owner's symmetric entry.
    pub fn owner_content_key(
        &self,
        doc: &RecordDocument,
        owner: &UserId,
        master: &MasterKey,
    ) -> LedgerResult<ContentKey> {
        if &doc.owner_id != owner {
            return Err(LedgerError::Denied(format!(
                "{owner} does not own record {}",
                doc.record_id
            )));
        }
        Ok(unwrap_content_key(
            &doc.wrapped_keys,
            owner,
            KeyMaterial::Symmetric(master),
        )?)
    }

    /// Adds or replaces a non-creator wrapped key. Returns only after the
    /// store acknowledged the write.
    pub async fn upsert_wrapped_key(
        &self,
        record_id: &RecordId,
        entry: WrappedKeyEntry,
    ) -> LedgerResult<RecordDocument> {
        if entry.is_creator {
            return Err(LedgerError::Denied(
                "creator entry cannot be added by sharing".to_string(),
            ));
        }
        self.store
            .modify(collections::RECORDS, record_id.as_str(), |doc: &mut RecordDocument| {
                match doc
                    .wrapped_keys
                    .iter_mut()
                    .find(|e| e.subject_user_id == entry.subject_user_id)
                {
                    Some(existing) if existing.is_creator => {
                        return Err(LedgerError::Denied(format!(
                            "{} is the record creator",
                            entry.subject_user_id
                        )));
                    }
                    Some(existing) => *existing = entry.clone(),
                    None => doc.wrapped_keys.push(entry.clone()),
                }
                doc.sync_readers();
                Ok(())
            })
            .await
    }

    /// Removes `user_id`'s wrapped key. Returns whether one was present.
    pub async fn remove_wrapped_key(
        &self,
        record_id: &RecordId,
        user_id: &UserId,
    ) -> LedgerResult<bool> {
        let mut removed = false;
        self.store
            .modify(collections::RECORDS, record_id.as_str(), |doc: &mut RecordDocument| {
                if doc
                    .wrapped_keys
                    .iter()
                    .any(|e| &e.subject_user_id == user_id && e.is_creator)
                {
                    return Err(LedgerError::Denied(format!(
                        "cannot remove the creator's key from {record_id}"
                    )));
                }
                let before = doc.wrapped_keys.len();
                doc.wrapped_keys.retain(|e| &e.subject_user_id != user_id);
                removed = doc.wrapped_keys.len() != before;
                doc.sync_readers();
                Ok(())
            })
            .await?;
        Ok(removed)
    }

    /// Records whose wrapped keys include `user_id`.
    pub async fn readable_by(&self, user_id: &UserId) -> LedgerResult<Vec<RecordDocument>> {
        Ok(self
            .store
            .query::<RecordDocument>(
                collections::RECORDS,
                &[Filter::array_contains("readerIds", user_id.as_str())],
            )
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    /// Moves every owner entry of `owner` from `old` to `new` after a
    /// password change. Field ciphertext is untouched.
    ///
    /// Entries already under `new` are left alone, so a partial run can be
    /// resumed. Returns the number of records that changed.
    pub async fn rewrap_owner_entries(
        &self,
        owner: &UserId,
        old: &MasterKey,
        new: &MasterKey,
    ) -> LedgerResult<usize> {
        let owned = self
            .store
            .query::<RecordDocument>(
                collections::RECORDS,
                &[Filter::eq("ownerId", owner.as_str())],
            )
            .await?;

        let mut count = 0;
        for versioned in owned {
            let record_id = versioned.value.record_id.clone();
            let mut changed = false;
            self.store
                .modify(collections::RECORDS, record_id.as_str(), |doc: &mut RecordDocument| {
                    changed = false;
                    for entry in doc.wrapped_keys.iter_mut() {
                        if &entry.subject_user_id == owner && entry.is_creator {
                            let moved = rewrap_owner_entry(entry, old, new)?;
                            if moved != *entry {
                                *entry = moved;
                                changed = true;
                            }
                        }
                    }
                    Ok(())
                })
                .await?;
            if changed {
                count += 1;
            }
        }
        info!(owner = %owner, records = count, "re-wrapped owner keys");
        Ok(count)
    }
}
