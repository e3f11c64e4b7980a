//! Shared harness: in-memory collaborators wired into one `AccessLedgerSync`.

#![allow(dead_code)]

use healthvault_crypto::record::fields;
use healthvault_crypto::{KdfParams, MasterKey, SharingKeyPair};
use healthvault_ledger::blob::InMemoryBlobStorage;
use healthvault_ledger::contract::{InMemoryLedger, LocalSigner};
use healthvault_ledger::directory::InMemoryDirectory;
use healthvault_ledger::records::RecordDocument;
use healthvault_ledger::store::{Document, DocumentStore, Filter, InMemoryDocumentStore};
use healthvault_ledger::{AccessLedgerSync, Collaborators, LedgerError, LedgerResult, LedgerSyncConfig};
use healthvault_types::{RecordId, UserId, WalletAddress};
use healthvault_vault::{Enrollment, SessionKeyCache};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

pub const PASSWORD: &str = "correct horse battery staple 42!";

/// An enrolled user with their unlocked keys.
pub struct TestUser {
    pub id: UserId,
    pub enrollment: Enrollment,
    pub master: MasterKey,
    pub sharing: SharingKeyPair,
    pub wallet: WalletAddress,
}

impl TestUser {
    pub fn master_copy(&self) -> MasterKey {
        MasterKey::from_bytes(*self.master.as_bytes())
    }
}

pub struct Harness {
    pub sessions: SessionKeyCache,
    pub store: Arc<InMemoryDocumentStore>,
    pub blobs: Arc<InMemoryBlobStorage>,
    pub directory: Arc<InMemoryDirectory>,
    pub ledger: Arc<InMemoryLedger>,
    pub sync: AccessLedgerSync,
    next_wallet: AtomicU8,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(LedgerSyncConfig::test())
    }

    pub fn with_config(config: LedgerSyncConfig) -> Self {
        Self::with_store(config, |store| store as Arc<dyn DocumentStore>)
    }

    /// Like [`with_config`](Self::with_config), with the coordinator's store
    /// wrapped by `wrap`. `self.store` stays the unwrapped store.
    pub fn with_store(
        config: LedgerSyncConfig,
        wrap: impl FnOnce(Arc<InMemoryDocumentStore>) -> Arc<dyn DocumentStore>,
    ) -> Self {
        init_tracing();
        let sessions = SessionKeyCache::default();
        let store = Arc::new(InMemoryDocumentStore::new());
        let blobs = Arc::new(InMemoryBlobStorage::default());
        let directory = Arc::new(InMemoryDirectory::new());
        let ledger = Arc::new(InMemoryLedger::new());

        let sync = AccessLedgerSync::new(
            sessions.clone(),
            Collaborators {
                store: wrap(store.clone()),
                blobs: blobs.clone(),
                directory: directory.clone(),
                ledger: ledger.clone(),
                signer: Arc::new(LocalSigner::generate()),
            },
            config,
        )
        .unwrap();

        Self {
            sessions,
            store,
            blobs,
            directory,
            ledger,
            sync,
            next_wallet: AtomicU8::new(1),
        }
    }

    /// Enrolls a user and publishes their sharing key.
    pub async fn user(&self, name: &str) -> TestUser {
        let new = Enrollment::create(PASSWORD, KdfParams::test()).unwrap();
        let sharing = new.enrollment.sharing_keypair(&new.master_key).unwrap();
        let wallet = WalletAddress::from_bytes([self.next_wallet.fetch_add(1, Ordering::SeqCst); 20]);
        let id = UserId::new(name);
        self.directory
            .register(id.clone(), wallet.clone(), Some(&sharing.public))
            .await;
        TestUser {
            id,
            enrollment: new.enrollment,
            master: new.master_key,
            sharing,
            wallet,
        }
    }

    /// Puts `user`'s master key in the session cache.
    pub fn sign_in(&self, user: &TestUser) {
        self.sessions.initialize(user.id.clone(), user.master_copy());
    }

    /// Creates the lab-report record owned by `owner`.
    pub async fn lab_report(&self, owner: &TestUser, id: &str) -> RecordDocument {
        let plaintext = BTreeMap::from([
            (fields::TITLE.to_string(), b"Lab Report".to_vec()),
            ("notes".to_string(), b"BP 120/80".to_vec()),
            (fields::ATTACHMENT.to_string(), b"%PDF-1.7 fake scan".to_vec()),
        ]);
        self.sync
            .records()
            .create(RecordId::new(id), &owner.id, &owner.master, &plaintext)
            .await
            .unwrap()
    }
}

/// Store whose creates in one collection fail while `failing` is set.
pub struct FailingCreates {
    inner: Arc<InMemoryDocumentStore>,
    collection: &'static str,
    pub failing: AtomicBool,
}

impl FailingCreates {
    pub fn new(inner: Arc<InMemoryDocumentStore>, collection: &'static str) -> Self {
        Self {
            inner,
            collection,
            failing: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl DocumentStore for FailingCreates {
    async fn get(&self, collection: &str, id: &str) -> LedgerResult<Option<Document>> {
        self.inner.get(collection, id).await
    }

    async fn create(&self, collection: &str, id: &str, body: Value) -> LedgerResult<Document> {
        if collection == self.collection && self.failing.load(Ordering::SeqCst) {
            return Err(LedgerError::Store("unavailable".to_string()));
        }
        self.inner.create(collection, id, body).await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: u64,
        body: Value,
    ) -> LedgerResult<Document> {
        self.inner.update(collection, id, expected_version, body).await
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> LedgerResult<Vec<Document>> {
        self.inner.query(collection, filters).await
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
