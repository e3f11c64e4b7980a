//! Recipient public-key directory.

use crate::error::{LedgerError, LedgerResult};
use async_trait::async_trait;
use healthvault_crypto::PublicKey;
use healthvault_types::{UserId, WalletAddress};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Resolves a user's sharing key and ledger address.
///
/// Implementations must return `UserNotFound` for unknown users and
/// `NoPublicKey` for known users who never published a key.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    async fn public_key(&self, user_id: &UserId) -> LedgerResult<PublicKey>;

    async fn wallet_address(&self, user_id: &UserId) -> LedgerResult<WalletAddress>;
}

#[derive(Clone)]
struct DirectoryEntry {
    public_key: Option<[u8; 32]>,
    wallet: WalletAddress,
}

/// Directory backed by a map.
#[derive(Default)]
pub struct InMemoryDirectory {
    users: RwLock<HashMap<UserId, DirectoryEntry>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user with an optional public key.
    pub async fn register(
        &self,
        user_id: UserId,
        wallet: WalletAddress,
        public_key: Option<&PublicKey>,
    ) {
        let entry = DirectoryEntry {
            public_key: public_key.map(|pk| *pk.as_bytes()),
            wallet,
        };
        self.users.write().await.insert(user_id, entry);
    }

    async fn entry(&self, user_id: &UserId) -> LedgerResult<DirectoryEntry> {
        self.users
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| LedgerError::UserNotFound(user_id.clone()))
    }
}

#[async_trait]
impl KeyDirectory for InMemoryDirectory {
    async fn public_key(&self, user_id: &UserId) -> LedgerResult<PublicKey> {
        self.entry(user_id)
            .await?
            .public_key
            .map(PublicKey::from)
            .ok_or_else(|| LedgerError::NoPublicKey(user_id.clone()))
    }

    async fn wallet_address(&self, user_id: &UserId) -> LedgerResult<WalletAddress> {
        Ok(self.entry(user_id).await?.wallet)
    }
}
