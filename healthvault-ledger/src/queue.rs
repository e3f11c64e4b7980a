//! Durable log of ledger writes awaiting replay.
//!
//! One record per failed logical write: a failed replay updates the
//! existing record instead of appending another, and a second failure of
//! the same call before any replay refreshes the open record.

use crate::error::{LedgerError, LedgerResult};
use crate::store::{Filter, TypedStore};
use crate::types::{SyncAction, SyncContext, SyncFailureRecord, SyncFailureStatus, collections};
use chrono::Utc;
use healthvault_types::{PermissionId, TxHash, UserId, WalletAddress};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Record counts by status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub resolved: usize,
    pub abandoned: usize,
}

impl QueueStats {
    pub fn open(&self) -> usize {
        self.pending + self.abandoned
    }
}

/// Sync-failure queue over the `blockchainSyncQueue` collection.
#[derive(Clone)]
pub struct SyncFailureQueue {
    store: TypedStore,
    contract_name: String,
    max_retry_count: u32,
}

impl SyncFailureQueue {
    pub fn new(store: TypedStore, contract_name: impl Into<String>, max_retry_count: u32) -> Self {
        Self {
            store,
            contract_name: contract_name.into(),
            max_retry_count,
        }
    }

    /// Logs a failed ledger call.
    ///
    /// If an unresolved record already describes the same call, that record
    /// is refreshed and returned instead.
    pub async fn append(
        &self,
        actor_user_id: &UserId,
        actor_wallet_address: &WalletAddress,
        context: SyncContext,
        error: &LedgerError,
    ) -> LedgerResult<SyncFailureRecord> {
        if let Some(existing) = self
            .find_open(context.permission_id(), context.action())
            .await?
        {
            let message = error.to_string();
            return self
                .store
                .modify(collections::SYNC_QUEUE, &existing.id, |r: &mut SyncFailureRecord| {
                    r.error_message = message.clone();
                    r.updated_at = Utc::now();
                    Ok(())
                })
                .await;
        }

        let now = Utc::now();
        let record = SyncFailureRecord {
            id: Uuid::new_v4().to_string(),
            contract_name: self.contract_name.clone(),
            action: context.action(),
            actor_user_id: actor_user_id.clone(),
            actor_wallet_address: actor_wallet_address.clone(),
            error_message: error.to_string(),
            context,
            status: SyncFailureStatus::Pending,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            resolved_tx_id: None,
        };
        self.store
            .create(collections::SYNC_QUEUE, &record.id, &record)
            .await?;
        info!(
            id = %record.id,
            action = %record.action,
            permission = %record.context.permission_id(),
            "logged ledger write for retry"
        );
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> LedgerResult<SyncFailureRecord> {
        Ok(self
            .store
            .require::<SyncFailureRecord>(collections::SYNC_QUEUE, id)
            .await?
            .value)
    }

    /// Oldest pending records first, at most `limit`.
    pub async fn pending(&self, limit: usize) -> LedgerResult<Vec<SyncFailureRecord>> {
        let mut records = self.with_status(SyncFailureStatus::Pending).await?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records.truncate(limit);
        Ok(records)
    }

    pub async fn with_status(
        &self,
        status: SyncFailureStatus,
    ) -> LedgerResult<Vec<SyncFailureRecord>> {
        Ok(self
            .store
            .query::<SyncFailureRecord>(
                collections::SYNC_QUEUE,
                &[Filter::eq("status", serde_json::to_value(status)?)],
            )
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    /// Unresolved record for one call on one permission, if any.
    pub async fn find_open(
        &self,
        permission_id: PermissionId,
        action: SyncAction,
    ) -> LedgerResult<Option<SyncFailureRecord>> {
        Ok(self
            .store
            .query::<SyncFailureRecord>(
                collections::SYNC_QUEUE,
                &[Filter::eq("action", serde_json::to_value(action)?)],
            )
            .await?
            .into_iter()
            .map(|v| v.value)
            .find(|r| r.is_open() && r.context.permission_id() == permission_id))
    }

    /// Every record touching `permission_id`, oldest first.
    pub async fn for_permission(
        &self,
        permission_id: PermissionId,
    ) -> LedgerResult<Vec<SyncFailureRecord>> {
        let mut records: Vec<_> = self
            .store
            .query::<SyncFailureRecord>(collections::SYNC_QUEUE, &[])
            .await?
            .into_iter()
            .map(|v| v.value)
            .filter(|r| r.context.permission_id() == permission_id)
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Marks a record resolved by a confirmed replay. Records are kept.
    pub async fn mark_resolved(
        &self,
        id: &str,
        tx_hash: &TxHash,
    ) -> LedgerResult<SyncFailureRecord> {
        let record = self
            .store
            .modify(collections::SYNC_QUEUE, id, |r: &mut SyncFailureRecord| {
                let now = Utc::now();
                r.status = SyncFailureStatus::Resolved;
                r.resolved_at = Some(now);
                r.resolved_tx_id = Some(tx_hash.clone());
                r.updated_at = now;
                Ok(())
            })
            .await?;
        info!(id, %tx_hash, "sync failure resolved");
        Ok(record)
    }

    /// Counts a failed replay. At the configured limit the record is
    /// abandoned and excluded from further sweeps.
    pub async fn record_failure(
        &self,
        id: &str,
        error: &LedgerError,
    ) -> LedgerResult<SyncFailureRecord> {
        let max = self.max_retry_count;
        let message = error.to_string();
        let record = self
            .store
            .modify(collections::SYNC_QUEUE, id, |r: &mut SyncFailureRecord| {
                r.retry_count += 1;
                r.error_message = message.clone();
                r.updated_at = Utc::now();
                if r.retry_count >= max {
                    r.status = SyncFailureStatus::Abandoned;
                }
                Ok(())
            })
            .await?;

        if record.status == SyncFailureStatus::Abandoned {
            warn!(
                id,
                action = %record.action,
                retries = record.retry_count,
                "sync failure abandoned, needs operator attention"
            );
        }
        Ok(record)
    }

    /// Returns an abandoned record to the sweep with a fresh retry budget.
    pub async fn reopen(&self, id: &str) -> LedgerResult<SyncFailureRecord> {
        self.store
            .modify(collections::SYNC_QUEUE, id, |r: &mut SyncFailureRecord| {
                if r.status != SyncFailureStatus::Abandoned {
                    return Err(LedgerError::Denied(format!(
                        "sync failure {} is not abandoned",
                        r.id
                    )));
                }
                r.status = SyncFailureStatus::Pending;
                r.retry_count = 0;
                r.updated_at = Utc::now();
                Ok(())
            })
            .await
    }

    pub async fn stats(&self) -> LedgerResult<QueueStats> {
        let mut stats = QueueStats::default();
        for v in self
            .store
            .query::<SyncFailureRecord>(collections::SYNC_QUEUE, &[])
            .await?
        {
            match v.value.status {
                SyncFailureStatus::Pending => stats.pending += 1,
                SyncFailureStatus::Resolved => stats.resolved += 1,
                SyncFailureStatus::Abandoned => stats.abandoned += 1,
            }
        }
        Ok(stats)
    }
}
