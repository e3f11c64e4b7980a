//! Verification and dispute flows.
//!
//! Three steps per action: write the entry `pending`, submit the ledger
//! transaction, then mark it `confirmed` (and recompute the record's
//! credibility score) or `failed`. Failures are surfaced to the caller and
//! kept on the entry; they are never queued for a silent retry. The user
//! re-triggers a failed entry explicitly.

use crate::contract::{AccessContract, LedgerCall};
use crate::error::{LedgerError, LedgerResult};
use crate::locks::KeyedLocks;
use crate::records::RecordRepository;
use crate::store::{Filter, TypedStore};
use crate::types::{CredibilityScore, DisputeEntry, VerificationEntry, collections};
use chrono::Utc;
use healthvault_types::{
    DisputeSeverity, LedgerStatus, RecordHash, RecordId, TxHash, UserId, VerificationLevel,
};
use healthvault_vault::SessionKeyCache;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Points per verification level step.
const VERIFICATION_WEIGHT: i64 = 10;
/// Points deducted per dispute severity step.
const DISPUTE_WEIGHT: i64 = 15;
const MAX_SCORE: i64 = 100;

/// An off-chain entry mirrored by one ledger transaction.
trait Anchored: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: &'static str;
    const KIND: &'static str;

    fn id(&self) -> &str;
    fn actor(&self) -> &UserId;
    fn record_hash(&self) -> RecordHash;
    fn ledger_status(&self) -> LedgerStatus;
    fn ledger_call(&self) -> LedgerCall;
    fn set_ledger(&mut self, status: LedgerStatus, tx: Option<TxHash>, error: Option<String>);
}

impl Anchored for VerificationEntry {
    const COLLECTION: &'static str = collections::VERIFICATIONS;
    const KIND: &'static str = "verification";

    fn id(&self) -> &str {
        &self.id
    }

    fn actor(&self) -> &UserId {
        &self.actor_id
    }

    fn record_hash(&self) -> RecordHash {
        self.record_hash
    }

    fn ledger_status(&self) -> LedgerStatus {
        self.ledger_status
    }

    fn ledger_call(&self) -> LedgerCall {
        LedgerCall::VerifyRecord {
            record_hash: self.record_hash,
            level: self.level.code(),
        }
    }

    fn set_ledger(&mut self, status: LedgerStatus, tx: Option<TxHash>, error: Option<String>) {
        self.ledger_status = status;
        if tx.is_some() {
            self.ledger_tx_id = tx;
        }
        self.ledger_error = error;
    }
}

impl Anchored for DisputeEntry {
    const COLLECTION: &'static str = collections::DISPUTES;
    const KIND: &'static str = "dispute";

    fn id(&self) -> &str {
        &self.id
    }

    fn actor(&self) -> &UserId {
        &self.actor_id
    }

    fn record_hash(&self) -> RecordHash {
        self.record_hash
    }

    fn ledger_status(&self) -> LedgerStatus {
        self.ledger_status
    }

    fn ledger_call(&self) -> LedgerCall {
        LedgerCall::DisputeRecord {
            record_hash: self.record_hash,
            severity: self.severity.code(),
            reason: self.reason.clone(),
        }
    }

    fn set_ledger(&mut self, status: LedgerStatus, tx: Option<TxHash>, error: Option<String>) {
        self.ledger_status = status;
        if tx.is_some() {
            self.ledger_tx_id = tx;
        }
        self.ledger_error = error;
    }
}

/// Score from the active, confirmed entries for one record hash, in
/// `0..=100`.
pub fn credibility_score(verifications: &[VerificationEntry], disputes: &[DisputeEntry]) -> u32 {
    let counted = |active: bool, status: LedgerStatus| active && status == LedgerStatus::Confirmed;
    let plus: i64 = verifications
        .iter()
        .filter(|v| counted(v.is_active, v.ledger_status))
        .map(|v| i64::from(v.level.code()) * VERIFICATION_WEIGHT)
        .sum();
    let minus: i64 = disputes
        .iter()
        .filter(|d| counted(d.is_active, d.ledger_status))
        .map(|d| i64::from(d.severity.code()) * DISPUTE_WEIGHT)
        .sum();
    (plus - minus).clamp(0, MAX_SCORE) as u32
}

/// Verification and dispute flows.
#[derive(Clone)]
pub struct AttestationService {
    inner: Arc<AttestationInner>,
}

struct AttestationInner {
    sessions: SessionKeyCache,
    store: TypedStore,
    records: RecordRepository,
    contract: Arc<AccessContract>,
    /// Held by entry id for the whole of a retry.
    retrying: KeyedLocks<String>,
}

impl AttestationService {
    pub fn new(
        sessions: SessionKeyCache,
        store: TypedStore,
        records: RecordRepository,
        contract: Arc<AccessContract>,
    ) -> Self {
        Self {
            inner: Arc::new(AttestationInner {
                sessions,
                store,
                records,
                contract,
                retrying: KeyedLocks::new(),
            }),
        }
    }

    /// Attests to a record the actor can read.
    pub async fn verify_record(
        &self,
        record_id: RecordId,
        actor_id: UserId,
        level: VerificationLevel,
    ) -> LedgerResult<VerificationEntry> {
        let record_hash = self.inner.authorize(&record_id, &actor_id).await?;
        let entry = VerificationEntry {
            id: Uuid::new_v4().to_string(),
            record_id,
            record_hash,
            actor_id,
            level,
            is_active: true,
            ledger_status: LedgerStatus::Pending,
            ledger_tx_id: None,
            ledger_error: None,
            created_at: Utc::now(),
        };
        self.spawn_anchor(entry, true).await
    }

    /// Disputes a record the actor can read.
    pub async fn dispute_record(
        &self,
        record_id: RecordId,
        actor_id: UserId,
        severity: DisputeSeverity,
        reason: String,
    ) -> LedgerResult<DisputeEntry> {
        let record_hash = self.inner.authorize(&record_id, &actor_id).await?;
        let entry = DisputeEntry {
            id: Uuid::new_v4().to_string(),
            record_id,
            record_hash,
            actor_id,
            severity,
            reason,
            is_active: true,
            ledger_status: LedgerStatus::Pending,
            ledger_tx_id: None,
            ledger_error: None,
            created_at: Utc::now(),
        };
        self.spawn_anchor(entry, true).await
    }

    /// Resubmits a failed verification on the actor's request.
    ///
    /// Concurrent retries of one entry run one at a time; the later one
    /// finds the entry no longer `failed` and is denied.
    pub async fn retry_verification(
        &self,
        id: &str,
        actor_id: &UserId,
    ) -> LedgerResult<VerificationEntry> {
        self.spawn_retry(id, actor_id).await
    }

    /// Resubmits a failed dispute on the actor's request.
    pub async fn retry_dispute(&self, id: &str, actor_id: &UserId) -> LedgerResult<DisputeEntry> {
        self.spawn_retry(id, actor_id).await
    }

    pub async fn verification(&self, id: &str) -> LedgerResult<VerificationEntry> {
        Ok(self
            .inner
            .store
            .require::<VerificationEntry>(collections::VERIFICATIONS, id)
            .await?
            .value)
    }

    pub async fn dispute(&self, id: &str) -> LedgerResult<DisputeEntry> {
        Ok(self
            .inner
            .store
            .require::<DisputeEntry>(collections::DISPUTES, id)
            .await?
            .value)
    }

    pub async fn score(&self, record_hash: &RecordHash) -> LedgerResult<Option<CredibilityScore>> {
        Ok(self
            .inner
            .store
            .get::<CredibilityScore>(collections::CREDIBILITY_SCORES, &record_hash.to_hex())
            .await?
            .map(|v| v.value))
    }

    /// Runs the anchor in its own task so a caller that stops waiting does
    /// not cancel a broadcast transaction.
    async fn spawn_anchor<E: Anchored>(&self, entry: E, create: bool) -> LedgerResult<E> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.anchor(entry, create).await })
            .await
            .map_err(|e| LedgerError::Task(e.to_string()))?
    }

    async fn spawn_retry<E: Anchored>(&self, id: &str, actor_id: &UserId) -> LedgerResult<E> {
        let inner = self.inner.clone();
        let id = id.to_string();
        let actor_id = actor_id.clone();
        tokio::spawn(async move {
            let _guard = inner.retrying.lock(id.clone()).await;
            let entry = inner.failed_entry::<E>(&id, &actor_id).await?;
            inner.anchor(entry, false).await
        })
        .await
        .map_err(|e| LedgerError::Task(e.to_string()))?
    }
}

impl AttestationInner {
    /// Session and read access check. Returns the hash to anchor.
    async fn authorize(&self, record_id: &RecordId, actor_id: &UserId) -> LedgerResult<RecordHash> {
        if self.sessions.get_for(actor_id).is_none() {
            return Err(LedgerError::Locked);
        }
        let doc = self.records.load(record_id).await?;
        if !doc.has_reader(actor_id) {
            return Err(LedgerError::Denied(format!(
                "{actor_id} cannot read record {record_id}"
            )));
        }
        Ok(doc.record_hash)
    }

    async fn failed_entry<E: Anchored>(&self, id: &str, actor_id: &UserId) -> LedgerResult<E> {
        if self.sessions.get_for(actor_id).is_none() {
            return Err(LedgerError::Locked);
        }
        let entry = self.store.require::<E>(E::COLLECTION, id).await?.value;
        if entry.actor() != actor_id {
            return Err(LedgerError::Denied(format!(
                "{} {id} belongs to another user",
                E::KIND
            )));
        }
        if entry.ledger_status() != LedgerStatus::Failed {
            return Err(LedgerError::Denied(format!(
                "{} {id} has not failed",
                E::KIND
            )));
        }
        Ok(entry)
    }

    async fn anchor<E: Anchored>(&self, mut entry: E, create: bool) -> LedgerResult<E> {
        let id = entry.id().to_string();

        // (i) off-chain entry, pending
        if create {
            self.store.create(E::COLLECTION, &id, &entry).await?;
        } else {
            entry = self.set_status(&id, LedgerStatus::Pending, None, None).await?;
        }

        // (ii) ledger transaction
        match self.contract.submit(entry.ledger_call()).await {
            // (iii) confirmation and dependent recomputation
            Ok(tx_hash) => {
                let entry = self
                    .set_status::<E>(&id, LedgerStatus::Confirmed, Some(tx_hash.clone()), None)
                    .await?;
                info!(kind = E::KIND, id = %id, %tx_hash, "anchored on ledger");
                self.recompute_score(entry.record_hash()).await?;
                Ok(entry)
            }
            Err(e) => {
                warn!(kind = E::KIND, id = %id, "ledger anchor failed: {e}");
                self.set_status::<E>(&id, LedgerStatus::Failed, None, Some(e.to_string()))
                    .await?;
                Err(LedgerError::AttestationFailed {
                    kind: E::KIND,
                    id,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn set_status<E: Anchored>(
        &self,
        id: &str,
        status: LedgerStatus,
        tx: Option<TxHash>,
        error: Option<String>,
    ) -> LedgerResult<E> {
        self.store
            .modify(E::COLLECTION, id, |e: &mut E| {
                e.set_ledger(status, tx.clone(), error.clone());
                Ok(())
            })
            .await
    }

    async fn recompute_score(&self, record_hash: RecordHash) -> LedgerResult<CredibilityScore> {
        let by_hash = [Filter::eq("recordHash", record_hash.to_hex())];
        let verifications: Vec<VerificationEntry> = self
            .store
            .query(collections::VERIFICATIONS, &by_hash)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect();
        let disputes: Vec<DisputeEntry> = self
            .store
            .query(collections::DISPUTES, &by_hash)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect();

        let confirmed = |status: LedgerStatus| status == LedgerStatus::Confirmed;
        let score = CredibilityScore {
            record_hash,
            score: credibility_score(&verifications, &disputes),
            verification_count: verifications
                .iter()
                .filter(|v| v.is_active && confirmed(v.ledger_status))
                .count() as u32,
            dispute_count: disputes
                .iter()
                .filter(|d| d.is_active && confirmed(d.ledger_status))
                .count() as u32,
            updated_at: Utc::now(),
        };

        let key = record_hash.to_hex();
        match self
            .store
            .get::<CredibilityScore>(collections::CREDIBILITY_SCORES, &key)
            .await?
        {
            Some(_) => {
                let fresh = score.clone();
                self.store
                    .modify(collections::CREDIBILITY_SCORES, &key, |s: &mut CredibilityScore| {
                        *s = fresh.clone();
                        Ok(())
                    })
                    .await?;
            }
            None => match self
                .store
                .create(collections::CREDIBILITY_SCORES, &key, &score)
                .await
            {
                Ok(_) => {}
                // Another confirmation created it first; overwrite with ours.
                Err(LedgerError::Conflict { .. }) => {
                    let fresh = score.clone();
                    self.store
                        .modify(collections::CREDIBILITY_SCORES, &key, |s: &mut CredibilityScore| {
                            *s = fresh.clone();
                            Ok(())
                        })
                        .await?;
                }
                Err(e) => return Err(e),
            },
        }
        info!(hash = %record_hash, score = score.score, "credibility score updated");
        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use healthvault_types::{DisputeSeverity, VerificationLevel};

    fn verification(level: VerificationLevel, status: LedgerStatus) -> VerificationEntry {
        VerificationEntry {
            id: Uuid::new_v4().to_string(),
            record_id: RecordId::new("r1"),
            record_hash: RecordHash([1; 32]),
            actor_id: UserId::new("p1"),
            level,
            is_active: true,
            ledger_status: status,
            ledger_tx_id: None,
            ledger_error: None,
            created_at: Utc::now(),
        }
    }

    fn dispute(severity: DisputeSeverity) -> DisputeEntry {
        DisputeEntry {
            id: Uuid::new_v4().to_string(),
            record_id: RecordId::new("r1"),
            record_hash: RecordHash([1; 32]),
            actor_id: UserId::new("p2"),
            severity,
            reason: "wrong date".to_string(),
            is_active: true,
            ledger_status: LedgerStatus::Confirmed,
            ledger_tx_id: None,
            ledger_error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn only_confirmed_entries_count() {
        let vs = vec![
            verification(VerificationLevel::ProviderVerified, LedgerStatus::Confirmed),
            verification(VerificationLevel::ProviderVerified, LedgerStatus::Failed),
            verification(VerificationLevel::SelfAttested, LedgerStatus::Pending),
        ];
        assert_eq!(credibility_score(&vs, &[]), 30);
    }

    #[test]
    fn disputes_subtract_and_score_is_clamped() {
        let vs = vec![verification(
            VerificationLevel::ProviderReviewed,
            LedgerStatus::Confirmed,
        )];
        assert_eq!(credibility_score(&vs, &[dispute(DisputeSeverity::Minor)]), 5);
        assert_eq!(credibility_score(&vs, &[dispute(DisputeSeverity::Severe)]), 0);

        let many: Vec<_> = (0..20)
            .map(|_| verification(VerificationLevel::ProviderVerified, LedgerStatus::Confirmed))
            .collect();
        assert_eq!(credibility_score(&many, &[]), 100);
    }
}
