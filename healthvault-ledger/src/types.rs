//! Persisted documents for the dual-write flows.

use chrono::{DateTime, Utc};
use healthvault_types::{
    DisputeSeverity, LedgerStatus, PermissionId, RecordHash, RecordId, Role, TxHash, UserId,
    VerificationLevel, WalletAddress,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Document-store collection names.
pub mod collections {
    pub const RECORDS: &str = "records";
    pub const ACCESS_PERMISSIONS: &str = "accessPermissions";
    pub const SYNC_QUEUE: &str = "blockchainSyncQueue";
    pub const VERIFICATIONS: &str = "verifications";
    pub const DISPUTES: &str = "disputes";
    pub const CREDIBILITY_SCORES: &str = "credibilityScores";
}

/// Off-chain mirror of an on-chain access grant.
///
/// `is_active = true` holds only while `ledger_status` is `Confirmed` or a
/// sync-failure record for the grant is still open.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPermission {
    pub permission_id: PermissionId,
    pub record_id: RecordId,
    pub owner_id: UserId,
    pub receiver_id: UserId,
    pub role: Role,
    pub is_active: bool,
    pub granted_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ledger_tx_id: Option<TxHash>,
    pub ledger_status: LedgerStatus,
    /// Last ledger error, shown in the pending/failed indicator.
    #[serde(default)]
    pub ledger_error: Option<String>,
}

/// Ledger call that failed and awaits replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncAction {
    GrantAccess,
    RevokeAccess,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncAction::GrantAccess => write!(f, "grantAccess"),
            SyncAction::RevokeAccess => write!(f, "revokeAccess"),
        }
    }
}

/// Everything needed to replay one ledger call exactly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SyncContext {
    PermissionGrant {
        permission_id: PermissionId,
        record_id: RecordId,
        receiver_address: WalletAddress,
    },
    PermissionRevoke {
        permission_id: PermissionId,
        record_id: RecordId,
    },
}

impl SyncContext {
    pub fn action(&self) -> SyncAction {
        match self {
            SyncContext::PermissionGrant { .. } => SyncAction::GrantAccess,
            SyncContext::PermissionRevoke { .. } => SyncAction::RevokeAccess,
        }
    }

    pub fn permission_id(&self) -> PermissionId {
        match self {
            SyncContext::PermissionGrant { permission_id, .. }
            | SyncContext::PermissionRevoke { permission_id, .. } => *permission_id,
        }
    }
}

/// Lifecycle of a sync-failure record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncFailureStatus {
    /// Awaiting replay by a sweep.
    Pending,
    /// A replay confirmed on the ledger.
    Resolved,
    /// Gave up after the configured number of replays; needs an operator.
    Abandoned,
}

/// Durable record of a ledger write that did not confirm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailureRecord {
    pub id: String,
    pub contract_name: String,
    pub action: SyncAction,
    pub actor_user_id: UserId,
    pub actor_wallet_address: WalletAddress,
    pub error_message: String,
    pub context: SyncContext,
    pub status: SyncFailureStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_tx_id: Option<TxHash>,
}

impl SyncFailureRecord {
    /// Not yet resolved. Abandoned records stay open until an operator
    /// reopens or resolves them.
    pub fn is_open(&self) -> bool {
        self.status != SyncFailureStatus::Resolved
    }

    /// Eligible for the next sweep.
    pub fn is_replayable(&self) -> bool {
        self.status == SyncFailureStatus::Pending
    }
}

/// A verification anchored against a record hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationEntry {
    pub id: String,
    pub record_id: RecordId,
    pub record_hash: RecordHash,
    pub actor_id: UserId,
    pub level: VerificationLevel,
    pub is_active: bool,
    pub ledger_status: LedgerStatus,
    #[serde(default)]
    pub ledger_tx_id: Option<TxHash>,
    #[serde(default)]
    pub ledger_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A dispute anchored against a record hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeEntry {
    pub id: String,
    pub record_id: RecordId,
    pub record_hash: RecordHash,
    pub actor_id: UserId,
    pub severity: DisputeSeverity,
    pub reason: String,
    pub is_active: bool,
    pub ledger_status: LedgerStatus,
    #[serde(default)]
    pub ledger_tx_id: Option<TxHash>,
    #[serde(default)]
    pub ledger_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate trust score for a record hash, recomputed on confirmation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredibilityScore {
    pub record_hash: RecordHash,
    pub score: u32,
    pub verification_count: u32,
    pub dispute_count: u32,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_context_is_tagged_by_kind() {
        let ctx = SyncContext::PermissionGrant {
            permission_id: PermissionId::new(),
            record_id: RecordId::new("r1"),
            receiver_address: WalletAddress::from_bytes([1; 20]),
        };
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["kind"], "permissionGrant");
        assert_eq!(value["recordId"], "r1");
        assert!(value["receiverAddress"].as_str().unwrap().starts_with("0x"));
        assert_eq!(ctx.action(), SyncAction::GrantAccess);
    }

    #[test]
    fn sync_action_display_matches_contract_function() {
        assert_eq!(SyncAction::GrantAccess.to_string(), "grantAccess");
        assert_eq!(
            serde_json::to_value(SyncAction::RevokeAccess).unwrap(),
            "revokeAccess"
        );
    }
}
