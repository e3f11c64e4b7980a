//! Dual-write coordinator for access grants and revocations.
//!
//! The document store is authoritative for decryption: a grant is usable
//! as soon as the receiver's wrapped key and the permission document are
//! written. The ledger is the audit trail and catches up through the
//! sync-failure queue when a submission does not confirm. A failed ledger
//! call never rolls back the off-chain grant or revoke.
//!
//! Each grant or revoke runs in its own task holding the per-pair lock, so
//! a caller that stops waiting does not cancel a broadcast submission or
//! the status update that follows it.

use crate::attestation::AttestationService;
use crate::blob::BlobStorage;
use crate::config::LedgerSyncConfig;
use crate::contract::{AccessContract, LedgerClient, Signer};
use crate::directory::KeyDirectory;
use crate::error::{LedgerError, LedgerResult};
use crate::locks::KeyedLocks;
use crate::queue::SyncFailureQueue;
use crate::records::RecordRepository;
use crate::store::{DocumentStore, Filter, TypedStore};
use crate::types::{AccessPermission, SyncAction, SyncContext, SyncFailureRecord, collections};
use chrono::Utc;
use healthvault_crypto::{MasterKey, reencrypt_for_new_recipient};
use healthvault_types::{LedgerStatus, PermissionId, RecordId, Role, TxHash, UserId};
use healthvault_vault::SessionKeyCache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// External systems the coordinator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStorage>,
    pub directory: Arc<dyn KeyDirectory>,
    pub ledger: Arc<dyn LedgerClient>,
    pub signer: Arc<dyn Signer>,
}

/// A grant or revoke whose document-store write is acknowledged.
///
/// The ledger submission continues in the background. Dropping this value
/// only stops waiting for it.
pub struct LedgerSettlement {
    permission: AccessPermission,
    handle: JoinHandle<LedgerResult<AccessPermission>>,
}

impl LedgerSettlement {
    /// Permission as written, with `ledgerStatus = pending`.
    pub fn permission(&self) -> &AccessPermission {
        &self.permission
    }

    /// Waits for the ledger outcome. A ledger failure is not an error here:
    /// the permission comes back `failed` with a sync-failure record open.
    pub async fn settled(self) -> LedgerResult<AccessPermission> {
        self.handle
            .await
            .map_err(|e| LedgerError::Task(e.to_string()))?
    }
}

/// Result of replaying one sync-failure record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryOutcome {
    Confirmed(TxHash),
    Failed { retry_count: u32, abandoned: bool },
    /// Already resolved or abandoned.
    Skipped,
    /// An older grant for the same permission is still pending replay.
    Deferred,
}

/// Summary of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Records replayed against the ledger.
    pub attempted: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub abandoned: usize,
    /// Records passed over without a ledger call (deferred or settled).
    pub skipped: usize,
    pub errors: usize,
}

/// Document store vs. ledger view of one permission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconciliation {
    Consistent,
    /// Ledger disagrees, but an open sync-failure record will replay it.
    LedgerBehind { sync_failure_id: String },
    /// Disagreement with nothing queued to fix it.
    Diverged { reason: String },
}

/// Dual-write coordinator.
#[derive(Clone)]
pub struct AccessLedgerSync {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: SessionKeyCache,
    store: TypedStore,
    records: RecordRepository,
    directory: Arc<dyn KeyDirectory>,
    contract: Arc<AccessContract>,
    queue: SyncFailureQueue,
    locks: KeyedLocks<(RecordId, UserId)>,
    attestations: AttestationService,
    config: LedgerSyncConfig,
}

struct GrantRequest {
    record_id: RecordId,
    owner_id: UserId,
    receiver_id: UserId,
    role: Role,
}

impl AccessLedgerSync {
    /// Fails with `Config` if `config` does not validate.
    pub fn new(
        sessions: SessionKeyCache,
        collaborators: Collaborators,
        config: LedgerSyncConfig,
    ) -> LedgerResult<Self> {
        config.validate()?;
        let store = TypedStore::new(collaborators.store, config.max_write_conflicts);
        let records = RecordRepository::new(store.clone(), collaborators.blobs);
        let contract = Arc::new(AccessContract::new(
            collaborators.ledger,
            collaborators.signer,
            config.ledger_timeout(),
        ));
        let queue = SyncFailureQueue::new(
            store.clone(),
            config.contract_name.clone(),
            config.max_retry_count,
        );

        let attestations = AttestationService::new(
            sessions.clone(),
            store.clone(),
            records.clone(),
            contract.clone(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                sessions,
                store,
                records,
                directory: collaborators.directory,
                contract,
                queue,
                locks: KeyedLocks::new(),
                attestations,
                config,
            }),
        })
    }

    pub fn records(&self) -> &RecordRepository {
        &self.inner.records
    }

    pub fn queue(&self) -> &SyncFailureQueue {
        &self.inner.queue
    }

    pub fn config(&self) -> &LedgerSyncConfig {
        &self.inner.config
    }

    /// Verification and dispute flows over the same store and contract.
    pub fn attestations(&self) -> AttestationService {
        self.inner.attestations.clone()
    }

    /// Shares `record_id` with `receiver_id`.
    ///
    /// Wraps the existing content key for the receiver and writes the
    /// permission; the record's field ciphertext is not touched. Returns once
    /// both writes are acknowledged. Granting an already active pair returns
    /// the existing permission.
    pub async fn grant(
        &self,
        record_id: RecordId,
        owner_id: UserId,
        receiver_id: UserId,
        role: Role,
    ) -> LedgerResult<LedgerSettlement> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let inner = self.inner.clone();
        let request = GrantRequest {
            record_id,
            owner_id,
            receiver_id,
            role,
        };
        let handle = tokio::spawn(async move { inner.grant_task(request, ready_tx).await });
        written(ready_rx, handle).await
    }

    /// Revokes `receiver_id`'s access to `record_id`.
    ///
    /// Removes the receiver's wrapped key, so their next decrypt is
    /// `AccessDenied`, then deactivates the permission.
    pub async fn revoke(
        &self,
        record_id: RecordId,
        owner_id: UserId,
        receiver_id: UserId,
    ) -> LedgerResult<LedgerSettlement> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            inner
                .revoke_task(record_id, owner_id, receiver_id, ready_tx)
                .await
        });
        written(ready_rx, handle).await
    }

    /// Replays the exact ledger call recorded in `record`.
    pub async fn retry(&self, record: &SyncFailureRecord) -> LedgerResult<RetryOutcome> {
        let inner = self.inner.clone();
        let id = record.id.clone();
        tokio::spawn(async move { inner.retry_task(id).await })
            .await
            .map_err(|e| LedgerError::Task(e.to_string()))?
    }

    /// Replays up to `sweep_batch_size` pending records, oldest first.
    ///
    /// Deferred and already-settled records do not count against the
    /// batch, so they never starve newer failures.
    pub async fn sweep(&self) -> LedgerResult<SweepReport> {
        let batch_size = self.inner.config.sweep_batch_size;
        let queued = self.inner.queue.pending(usize::MAX).await?;

        let mut report = SweepReport::default();
        for record in queued {
            if report.attempted >= batch_size {
                break;
            }
            match self.retry(&record).await {
                Ok(RetryOutcome::Confirmed(_)) => {
                    report.attempted += 1;
                    report.confirmed += 1;
                }
                Ok(RetryOutcome::Failed { abandoned, .. }) => {
                    report.attempted += 1;
                    report.failed += 1;
                    if abandoned {
                        report.abandoned += 1;
                    }
                }
                Ok(RetryOutcome::Skipped | RetryOutcome::Deferred) => report.skipped += 1,
                Err(e) => {
                    warn!(id = %record.id, "replay errored: {e}");
                    report.attempted += 1;
                    report.errors += 1;
                }
            }
        }

        if report.attempted + report.skipped > 0 {
            info!(
                attempted = report.attempted,
                confirmed = report.confirmed,
                failed = report.failed,
                abandoned = report.abandoned,
                skipped = report.skipped,
                "sync sweep finished"
            );
        }
        Ok(report)
    }

    /// Compares the permission document with the ledger. Writes nothing.
    pub async fn reconcile(&self, permission_id: PermissionId) -> LedgerResult<Reconciliation> {
        let permission = self.permission(permission_id).await?;
        let on_chain = self.inner.contract.check_access(&permission_id).await?;

        let mismatch = match &on_chain {
            Some(entry) if entry.record_id != permission.record_id => {
                return Ok(Reconciliation::Diverged {
                    reason: format!(
                        "ledger names record {}, store names {}",
                        entry.record_id, permission.record_id
                    ),
                });
            }
            Some(entry) => entry.is_active != permission.is_active,
            None => permission.is_active,
        };
        if !mismatch {
            return Ok(Reconciliation::Consistent);
        }

        let pending_action = if permission.is_active {
            SyncAction::GrantAccess
        } else {
            SyncAction::RevokeAccess
        };
        match self
            .inner
            .queue
            .find_open(permission_id, pending_action)
            .await?
        {
            Some(record) => Ok(Reconciliation::LedgerBehind {
                sync_failure_id: record.id,
            }),
            None => Ok(Reconciliation::Diverged {
                reason: format!(
                    "store says active={}, ledger says {}",
                    permission.is_active,
                    on_chain.map_or("absent".to_string(), |e| format!("active={}", e.is_active))
                ),
            }),
        }
    }

    pub async fn permission(&self, permission_id: PermissionId) -> LedgerResult<AccessPermission> {
        Ok(self
            .inner
            .store
            .require::<AccessPermission>(collections::ACCESS_PERMISSIONS, &permission_id.to_string())
            .await?
            .value)
    }

    pub async fn permissions_for_record(
        &self,
        record_id: &RecordId,
    ) -> LedgerResult<Vec<AccessPermission>> {
        self.inner
            .permissions(&[Filter::eq("recordId", record_id.as_str())])
            .await
    }

    pub async fn permissions_for_receiver(
        &self,
        receiver_id: &UserId,
    ) -> LedgerResult<Vec<AccessPermission>> {
        self.inner
            .permissions(&[Filter::eq("receiverId", receiver_id.as_str())])
            .await
    }
}

/// Waits for the document-store phase of a spawned grant or revoke.
async fn written(
    ready: oneshot::Receiver<AccessPermission>,
    handle: JoinHandle<LedgerResult<AccessPermission>>,
) -> LedgerResult<LedgerSettlement> {
    match ready.await {
        Ok(permission) => Ok(LedgerSettlement { permission, handle }),
        // The task ended before the permission was written.
        Err(_) => match handle.await {
            Ok(Err(e)) => Err(e),
            Ok(Ok(_)) => Err(LedgerError::Task(
                "task finished without reporting its write".to_string(),
            )),
            Err(e) => Err(LedgerError::Task(e.to_string())),
        },
    }
}

impl Inner {
    fn master_key(&self, user_id: &UserId) -> LedgerResult<Arc<MasterKey>> {
        self.sessions.get_for(user_id).ok_or(LedgerError::Locked)
    }

    async fn permissions(&self, filters: &[Filter]) -> LedgerResult<Vec<AccessPermission>> {
        let mut out: Vec<AccessPermission> = self
            .store
            .query::<AccessPermission>(collections::ACCESS_PERMISSIONS, filters)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect();
        out.sort_by(|a, b| a.granted_at.cmp(&b.granted_at));
        Ok(out)
    }

    async fn active_permission(
        &self,
        record_id: &RecordId,
        receiver_id: &UserId,
    ) -> LedgerResult<Option<AccessPermission>> {
        Ok(self
            .permissions(&[
                Filter::eq("recordId", record_id.as_str()),
                Filter::eq("receiverId", receiver_id.as_str()),
                Filter::eq("isActive", true),
            ])
            .await?
            .into_iter()
            .next())
    }

    async fn grant_task(
        self: Arc<Self>,
        req: GrantRequest,
        ready: oneshot::Sender<AccessPermission>,
    ) -> LedgerResult<AccessPermission> {
        let _guard = self
            .locks
            .lock((req.record_id.clone(), req.receiver_id.clone()))
            .await;

        let master = self.master_key(&req.owner_id)?;
        if req.owner_id == req.receiver_id {
            return Err(LedgerError::Denied(
                "cannot share a record with its owner".to_string(),
            ));
        }
        let doc = self.records.load(&req.record_id).await?;
        if doc.owner_id != req.owner_id {
            return Err(LedgerError::Denied(format!(
                "{} does not own record {}",
                req.owner_id, req.record_id
            )));
        }

        if let Some(existing) = self
            .active_permission(&req.record_id, &req.receiver_id)
            .await?
        {
            debug!(permission = %existing.permission_id, "grant already active");
            let _ = ready.send(existing.clone());
            return Ok(existing);
        }

        let public_key = self.directory.public_key(&req.receiver_id).await?;
        let receiver_address = self.directory.wallet_address(&req.receiver_id).await?;

        let entry = {
            let content_key = self
                .records
                .owner_content_key(&doc, &req.owner_id, &master)?;
            reencrypt_for_new_recipient(&content_key, &req.receiver_id, &public_key)?
        };
        self.records.upsert_wrapped_key(&req.record_id, entry).await?;

        let permission = AccessPermission {
            permission_id: PermissionId::new(),
            record_id: req.record_id.clone(),
            owner_id: req.owner_id.clone(),
            receiver_id: req.receiver_id.clone(),
            role: req.role,
            is_active: true,
            granted_at: Utc::now(),
            revoked_at: None,
            ledger_tx_id: None,
            ledger_status: LedgerStatus::Pending,
            ledger_error: None,
        };
        if let Err(e) = self
            .store
            .create(
                collections::ACCESS_PERMISSIONS,
                &permission.permission_id.to_string(),
                &permission,
            )
            .await
        {
            // No key may outlive a failed permission write: nothing could revoke it.
            warn!(record = %req.record_id, receiver = %req.receiver_id, "permission write failed: {e}");
            if let Err(undo) = self
                .records
                .remove_wrapped_key(&req.record_id, &req.receiver_id)
                .await
            {
                error!(
                    record = %req.record_id,
                    receiver = %req.receiver_id,
                    "could not remove wrapped key after failed grant: {undo}"
                );
            }
            return Err(e);
        }
        info!(
            permission = %permission.permission_id,
            record = %req.record_id,
            receiver = %req.receiver_id,
            role = ?req.role,
            "access granted in document store"
        );
        let _ = ready.send(permission.clone());

        let context = SyncContext::PermissionGrant {
            permission_id: permission.permission_id,
            record_id: req.record_id,
            receiver_address,
        };
        self.settle(&req.owner_id, context).await
    }

    async fn revoke_task(
        self: Arc<Self>,
        record_id: RecordId,
        owner_id: UserId,
        receiver_id: UserId,
        ready: oneshot::Sender<AccessPermission>,
    ) -> LedgerResult<AccessPermission> {
        let _guard = self
            .locks
            .lock((record_id.clone(), receiver_id.clone()))
            .await;

        self.master_key(&owner_id)?;
        let permission = self
            .active_permission(&record_id, &receiver_id)
            .await?
            .ok_or_else(|| {
                LedgerError::NotFound(format!("active permission for {receiver_id} on {record_id}"))
            })?;
        if permission.owner_id != owner_id {
            return Err(LedgerError::Denied(format!(
                "{owner_id} does not own record {record_id}"
            )));
        }

        let removed = self.records.remove_wrapped_key(&record_id, &receiver_id).await?;
        let permission = self
            .store
            .modify(
                collections::ACCESS_PERMISSIONS,
                &permission.permission_id.to_string(),
                |p: &mut AccessPermission| {
                    p.is_active = false;
                    p.revoked_at = Some(Utc::now());
                    p.ledger_status = LedgerStatus::Pending;
                    p.ledger_error = None;
                    Ok(())
                },
            )
            .await?;
        info!(
            permission = %permission.permission_id,
            record = %record_id,
            receiver = %receiver_id,
            key_removed = removed,
            "access revoked in document store"
        );
        let _ = ready.send(permission.clone());

        let context = SyncContext::PermissionRevoke {
            permission_id: permission.permission_id,
            record_id,
        };
        self.settle(&owner_id, context).await
    }

    /// Submits the ledger half and records its outcome on the permission.
    ///
    /// On failure the sync-failure record is written before the permission
    /// is marked `failed`, so an active permission is never left without
    /// either a confirmation or an open retry.
    async fn settle(&self, actor: &UserId, context: SyncContext) -> LedgerResult<AccessPermission> {
        let permission_id = context.permission_id();
        let action = context.action();

        match self.submit(&context).await {
            Ok(tx_hash) => {
                info!(permission = %permission_id, %action, %tx_hash, "ledger confirmed");
                self.set_ledger_status(permission_id, LedgerStatus::Confirmed, Some(tx_hash), None)
                    .await
            }
            Err(e) => {
                warn!(permission = %permission_id, %action, "ledger write failed: {e}");
                let wallet = self.contract.signer_address();
                self.queue.append(actor, &wallet, context, &e).await?;
                self.set_ledger_status(permission_id, LedgerStatus::Failed, None, Some(e.to_string()))
                    .await
            }
        }
    }

    async fn submit(&self, context: &SyncContext) -> LedgerResult<TxHash> {
        match context {
            SyncContext::PermissionGrant {
                permission_id,
                record_id,
                receiver_address,
            } => {
                self.contract
                    .grant_access(*permission_id, record_id.clone(), receiver_address.clone())
                    .await
            }
            SyncContext::PermissionRevoke { permission_id, .. } => {
                self.contract.revoke_access(*permission_id).await
            }
        }
    }

    async fn set_ledger_status(
        &self,
        permission_id: PermissionId,
        status: LedgerStatus,
        tx_hash: Option<TxHash>,
        error: Option<String>,
    ) -> LedgerResult<AccessPermission> {
        self.store
            .modify(
                collections::ACCESS_PERMISSIONS,
                &permission_id.to_string(),
                |p: &mut AccessPermission| {
                    p.ledger_status = status;
                    if let Some(tx_hash) = &tx_hash {
                        p.ledger_tx_id = Some(tx_hash.clone());
                    }
                    p.ledger_error = error.clone();
                    Ok(())
                },
            )
            .await
    }

    async fn retry_task(self: Arc<Self>, id: String) -> LedgerResult<RetryOutcome> {
        let record = self.queue.get(&id).await?;
        let permission_id = record.context.permission_id();
        let permission = self
            .store
            .require::<AccessPermission>(collections::ACCESS_PERMISSIONS, &permission_id.to_string())
            .await?
            .value;

        let _guard = self
            .locks
            .lock((permission.record_id.clone(), permission.receiver_id.clone()))
            .await;

        // Re-read under the lock; another replay may have settled it.
        let record = self.queue.get(&id).await?;
        if !record.is_replayable() {
            return Ok(RetryOutcome::Skipped);
        }
        // An abandoned grant no longer holds the revoke back.
        if record.action == SyncAction::RevokeAccess
            && self
                .queue
                .find_open(permission_id, SyncAction::GrantAccess)
                .await?
                .is_some_and(|grant| grant.is_replayable())
        {
            debug!(id = %id, "revoke replay waits for the open grant");
            return Ok(RetryOutcome::Deferred);
        }

        let permission = self
            .store
            .require::<AccessPermission>(collections::ACCESS_PERMISSIONS, &permission_id.to_string())
            .await?
            .value;
        // Only the write matching the permission's current state may
        // change its ledger status.
        let current = match record.action {
            SyncAction::GrantAccess => permission.is_active,
            SyncAction::RevokeAccess => !permission.is_active,
        };

        match self.submit(&record.context).await {
            Ok(tx_hash) => {
                self.queue.mark_resolved(&id, &tx_hash).await?;
                if current {
                    self.set_ledger_status(
                        permission_id,
                        LedgerStatus::Confirmed,
                        Some(tx_hash.clone()),
                        None,
                    )
                    .await?;
                }
                info!(id = %id, permission = %permission_id, action = %record.action, "replay confirmed");
                Ok(RetryOutcome::Confirmed(tx_hash))
            }
            Err(e) => {
                let updated = self.queue.record_failure(&id, &e).await?;
                if current {
                    self.set_ledger_status(
                        permission_id,
                        LedgerStatus::Failed,
                        None,
                        Some(e.to_string()),
                    )
                    .await?;
                }
                debug!(id = %id, retries = updated.retry_count, "replay failed: {e}");
                Ok(RetryOutcome::Failed {
                    retry_count: updated.retry_count,
                    abandoned: !updated.is_replayable(),
                })
            }
        }
    }
}
