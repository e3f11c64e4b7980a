//! Access-ledger contract calls.
//!
//! The contract itself is external. This module names its four logical
//! calls, the signer capability that authenticates them, and a client
//! wrapper that orders submissions per signer and bounds every call with a
//! timeout.

use crate::error::{LedgerError, LedgerResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use healthvault_crypto::{DerivedKey, generate_random_key};
use healthvault_types::{PermissionId, RecordHash, RecordId, TxHash, WalletAddress};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A contract function call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LedgerCall {
    GrantAccess {
        permission_id: PermissionId,
        record_id: RecordId,
        receiver: WalletAddress,
    },
    RevokeAccess {
        permission_id: PermissionId,
    },
    VerifyRecord {
        record_hash: RecordHash,
        level: u8,
    },
    DisputeRecord {
        record_hash: RecordHash,
        severity: u8,
        reason: String,
    },
}

impl LedgerCall {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerCall::GrantAccess { .. } => "grantAccess",
            LedgerCall::RevokeAccess { .. } => "revokeAccess",
            LedgerCall::VerifyRecord { .. } => "verifyRecord",
            LedgerCall::DisputeRecord { .. } => "disputeRecord",
        }
    }
}

/// An unsigned transaction from one account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub from: WalletAddress,
    pub nonce: u64,
    pub call: LedgerCall,
}

impl Transaction {
    /// Canonical bytes covered by the signature.
    pub fn signing_bytes(&self) -> LedgerResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A transaction plus its signature and the hash it will be known by.
#[derive(Clone, Debug)]
pub struct SignedTransaction {
    pub tx: Transaction,
    pub signature: Vec<u8>,
    pub tx_hash: TxHash,
}

/// Opaque signing capability (external wallet or a local key).
#[async_trait]
pub trait Signer: Send + Sync {
    fn address(&self) -> WalletAddress;

    async fn sign(&self, tx: Transaction) -> LedgerResult<SignedTransaction>;
}

/// Locally generated signer.
///
/// Produces keyed SHA-256 digests rather than chain-valid signatures; the
/// in-memory ledger accepts them as-is.
pub struct LocalSigner {
    secret: DerivedKey,
    address: WalletAddress,
}

impl LocalSigner {
    pub fn generate() -> Self {
        Self::from_secret(generate_random_key())
    }

    pub fn from_secret(secret: DerivedKey) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut account = [0u8; 20];
        account.copy_from_slice(&digest[12..]);
        Self {
            secret,
            address: WalletAddress::from_bytes(account),
        }
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn address(&self) -> WalletAddress {
        self.address.clone()
    }

    async fn sign(&self, tx: Transaction) -> LedgerResult<SignedTransaction> {
        if tx.from != self.address {
            return Err(LedgerError::Denied(format!(
                "signer {} cannot sign for {}",
                self.address, tx.from
            )));
        }
        let payload = tx.signing_bytes()?;
        let signature = Sha256::new()
            .chain_update(self.secret.as_bytes())
            .chain_update(&payload)
            .finalize()
            .to_vec();
        let hash = Sha256::new()
            .chain_update(&payload)
            .chain_update(&signature)
            .finalize();
        Ok(SignedTransaction {
            tx,
            signature,
            tx_hash: TxHash::new(format!("0x{}", hex::encode(hash))),
        })
    }
}

/// On-chain view of one access grant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnChainAccess {
    pub is_active: bool,
    pub sharer: WalletAddress,
    pub receiver: WalletAddress,
    pub record_id: RecordId,
    pub granted_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Network side of the ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Next nonce the ledger will accept from `account`.
    async fn next_nonce(&self, account: &WalletAddress) -> LedgerResult<u64>;

    /// Broadcasts and waits for the receipt. Reverts map to `LedgerWrite`.
    async fn submit(&self, tx: SignedTransaction) -> LedgerResult<TxHash>;

    async fn check_access(&self, permission_id: &PermissionId)
    -> LedgerResult<Option<OnChainAccess>>;
}

/// Contract wrapper used by the dual-write flows.
///
/// Holds the signer's submission lock for nonce-read, sign and submit so
/// one account's transactions reach the ledger in nonce order.
pub struct AccessContract {
    client: Arc<dyn LedgerClient>,
    signer: Arc<dyn Signer>,
    submit_lock: Mutex<()>,
    timeout: Duration,
}

impl AccessContract {
    pub fn new(client: Arc<dyn LedgerClient>, signer: Arc<dyn Signer>, timeout: Duration) -> Self {
        Self {
            client,
            signer,
            submit_lock: Mutex::new(()),
            timeout,
        }
    }

    pub fn signer_address(&self) -> WalletAddress {
        self.signer.address()
    }

    pub async fn grant_access(
        &self,
        permission_id: PermissionId,
        record_id: RecordId,
        receiver: WalletAddress,
    ) -> LedgerResult<TxHash> {
        self.submit(LedgerCall::GrantAccess {
            permission_id,
            record_id,
            receiver,
        })
        .await
    }

    pub async fn revoke_access(&self, permission_id: PermissionId) -> LedgerResult<TxHash> {
        self.submit(LedgerCall::RevokeAccess { permission_id }).await
    }

    pub async fn verify_record(&self, record_hash: RecordHash, level: u8) -> LedgerResult<TxHash> {
        self.submit(LedgerCall::VerifyRecord { record_hash, level })
            .await
    }

    pub async fn dispute_record(
        &self,
        record_hash: RecordHash,
        severity: u8,
        reason: String,
    ) -> LedgerResult<TxHash> {
        self.submit(LedgerCall::DisputeRecord {
            record_hash,
            severity,
            reason,
        })
        .await
    }

    pub async fn check_access(
        &self,
        permission_id: &PermissionId,
    ) -> LedgerResult<Option<OnChainAccess>> {
        tokio::time::timeout(self.timeout, self.client.check_access(permission_id))
            .await
            .map_err(|_| LedgerError::Timeout(self.timeout))?
    }

    /// Signs and submits one call under the signer's submission lock.
    pub async fn submit(&self, call: LedgerCall) -> LedgerResult<TxHash> {
        let _guard = self.submit_lock.lock().await;
        let name = call.name();
        let from = self.signer.address();

        let submission = async {
            let nonce = self.client.next_nonce(&from).await?;
            let signed = self.signer.sign(Transaction { from, nonce, call }).await?;
            self.client.submit(signed).await
        };

        match tokio::time::timeout(self.timeout, submission).await {
            Ok(Ok(tx_hash)) => {
                debug!(call = name, %tx_hash, "ledger call confirmed");
                Ok(tx_hash)
            }
            Ok(Err(e)) => {
                warn!(call = name, "ledger call failed: {e}");
                Err(e)
            }
            Err(_) => {
                warn!(call = name, timeout = ?self.timeout, "ledger call timed out");
                Err(LedgerError::Timeout(self.timeout))
            }
        }
    }
}

/// An anchored verification or dispute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attestation {
    pub tx_hash: TxHash,
    pub from: WalletAddress,
    pub call: LedgerCall,
}

#[derive(Default)]
struct LedgerState {
    access: HashMap<PermissionId, (OnChainAccess, TxHash)>,
    nonces: HashMap<WalletAddress, u64>,
    attestations: Vec<Attestation>,
    fail_next: u32,
    hang_next: u32,
    submissions: u64,
}

/// Ledger emulated in memory, with scripted failures.
///
/// Grants and revokes are idempotent per permission id, so a replay after a
/// lost receipt is harmless.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    latency: std::sync::Mutex<Duration>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` submissions.
    pub async fn fail_next(&self, n: u32) {
        self.state.lock().await.fail_next = n;
    }

    /// Never answer the next `n` submissions.
    pub async fn hang_next(&self, n: u32) {
        self.state.lock().await.hang_next = n;
    }

    /// Delay applied before every submission is processed.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Submissions that reached the ledger, including rejected ones.
    pub async fn submissions(&self) -> u64 {
        self.state.lock().await.submissions
    }

    pub async fn attestations(&self) -> Vec<Attestation> {
        self.state.lock().await.attestations.clone()
    }

    fn latency(&self) -> Duration {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply(state: &mut LedgerState, signed: &SignedTransaction) -> LedgerResult<TxHash> {
        let tx = &signed.tx;
        match &tx.call {
            LedgerCall::GrantAccess {
                permission_id,
                record_id,
                receiver,
            } => match state.access.get(permission_id) {
                Some((entry, hash)) if entry.is_active => Ok(hash.clone()),
                Some(_) => Err(LedgerError::LedgerWrite(format!(
                    "execution reverted: permission {permission_id} was revoked"
                ))),
                None => {
                    let entry = OnChainAccess {
                        is_active: true,
                        sharer: tx.from.clone(),
                        receiver: receiver.clone(),
                        record_id: record_id.clone(),
                        granted_at: Utc::now(),
                        revoked_at: None,
                    };
                    state
                        .access
                        .insert(*permission_id, (entry, signed.tx_hash.clone()));
                    Ok(signed.tx_hash.clone())
                }
            },
            LedgerCall::RevokeAccess { permission_id } => match state.access.get_mut(permission_id)
            {
                Some((entry, _)) => {
                    if entry.sharer != tx.from {
                        return Err(LedgerError::LedgerWrite(
                            "execution reverted: only the sharer may revoke".to_string(),
                        ));
                    }
                    if entry.is_active {
                        entry.is_active = false;
                        entry.revoked_at = Some(Utc::now());
                    }
                    Ok(signed.tx_hash.clone())
                }
                None => Err(LedgerError::LedgerWrite(format!(
                    "execution reverted: unknown permission {permission_id}"
                ))),
            },
            LedgerCall::VerifyRecord { .. } | LedgerCall::DisputeRecord { .. } => {
                state.attestations.push(Attestation {
                    tx_hash: signed.tx_hash.clone(),
                    from: tx.from.clone(),
                    call: tx.call.clone(),
                });
                Ok(signed.tx_hash.clone())
            }
        }
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn next_nonce(&self, account: &WalletAddress) -> LedgerResult<u64> {
        Ok(self
            .state
            .lock()
            .await
            .nonces
            .get(account)
            .copied()
            .unwrap_or_default())
    }

    async fn submit(&self, signed: SignedTransaction) -> LedgerResult<TxHash> {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let hang = {
            let mut state = self.state.lock().await;
            state.submissions += 1;
            let hang = state.hang_next > 0;
            state.hang_next = state.hang_next.saturating_sub(1);
            hang
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().await;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(LedgerError::LedgerWrite(
                "execution reverted: simulated failure".to_string(),
            ));
        }

        let expected = state
            .nonces
            .get(&signed.tx.from)
            .copied()
            .unwrap_or_default();
        if signed.tx.nonce != expected {
            return Err(LedgerError::LedgerWrite(format!(
                "nonce mismatch: expected {expected}, got {}",
                signed.tx.nonce
            )));
        }

        let hash = Self::apply(&mut state, &signed)?;
        state.nonces.insert(signed.tx.from.clone(), expected + 1);
        Ok(hash)
    }

    async fn check_access(
        &self,
        permission_id: &PermissionId,
    ) -> LedgerResult<Option<OnChainAccess>> {
        Ok(self
            .state
            .lock()
            .await
            .access
            .get(permission_id)
            .map(|(entry, _)| entry.clone()))
    }
}
