//! Opaque blob storage for attachment ciphertext.

use crate::error::{LedgerError, LedgerResult};
use async_trait::async_trait;
use healthvault_types::RecordId;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Blob path for a record's attachment ciphertext.
pub fn attachment_path(record_id: &RecordId) -> String {
    format!("records/{record_id}/attachment")
}

/// Get/put of opaque bytes at caller-chosen paths.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Stores `bytes` at `path`, returning a fetchable URL.
    async fn put(&self, path: &str, bytes: Vec<u8>) -> LedgerResult<String>;

    async fn get(&self, path: &str) -> LedgerResult<Vec<u8>>;
}

/// Bucket emulated in memory.
pub struct InMemoryBlobStorage {
    base_url: String,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStorage {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            blobs: RwLock::new(HashMap::new()),
        }
    }

    /// Overwrites a stored blob in place. Used to simulate bucket tampering.
    pub async fn overwrite(&self, path: &str, bytes: Vec<u8>) {
        self.blobs.write().await.insert(path.to_string(), bytes);
    }
}

impl Default for InMemoryBlobStorage {
    fn default() -> Self {
        Self::new("mem://blobs")
    }
}

#[async_trait]
impl BlobStorage for InMemoryBlobStorage {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> LedgerResult<String> {
        if path.is_empty() {
            return Err(LedgerError::Blob("empty blob path".to_string()));
        }
        self.blobs.write().await.insert(path.to_string(), bytes);
        Ok(format!("{}/{}", self.base_url, path))
    }

    async fn get(&self, path: &str) -> LedgerResult<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| LedgerError::Blob(format!("no blob at {path}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get() {
        let storage = InMemoryBlobStorage::default();
        let path = attachment_path(&RecordId::new("r1"));
        assert_eq!(path, "records/r1/attachment");

        let url = storage.put(&path, vec![1, 2, 3]).await.unwrap();
        assert_eq!(url, "mem://blobs/records/r1/attachment");
        assert_eq!(storage.get(&path).await.unwrap(), vec![1, 2, 3]);
        assert!(storage.get("records/r2/attachment").await.is_err());
    }
}
