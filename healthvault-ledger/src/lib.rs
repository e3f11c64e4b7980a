//! Cross-ledger access control for HealthVault.
//!
//! Keeps the document store and the access ledger consistent without
//! cross-system transactions:
//! - Grant/revoke with a document-store-first write and a queued ledger replay
//! - Sync-failure queue with a bounded retry budget
//! - Verification/dispute anchoring with surfaced failures
//! - Encrypted record documents with blob-stored attachments
//! - Collaborator traits with in-memory implementations

pub mod access;
pub mod attestation;
pub mod blob;
pub mod config;
pub mod contract;
pub mod directory;
pub mod error;
mod locks;
pub mod queue;
pub mod records;
pub mod store;
pub mod sweeper;
pub mod types;

pub use access::{
    AccessLedgerSync, Collaborators, LedgerSettlement, Reconciliation, RetryOutcome, SweepReport,
};
pub use attestation::{AttestationService, credibility_score};
pub use config::LedgerSyncConfig;
pub use error::{LedgerError, LedgerResult};
pub use queue::{QueueStats, SyncFailureQueue};
pub use sweeper::{RetrySweeper, RetrySweeperHandle, create_retry_sweeper};
pub use types::*;
