//! Dual-write configuration.

use crate::error::{LedgerError, LedgerResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for ledger calls and the retry sweep.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSyncConfig {
    /// Contract name recorded on sync-failure records.
    pub contract_name: String,

    /// Upper bound on one ledger submission, in milliseconds.
    pub ledger_timeout_ms: u64,

    /// Failed replays after which a queue record is marked abandoned.
    pub max_retry_count: u32,

    /// Interval between sweeps when a `RetrySweeper` is running (seconds).
    pub sweep_interval_secs: u64,

    /// Maximum queue records replayed per sweep.
    pub sweep_batch_size: usize,

    /// Optimistic-concurrency retries for a single document update.
    pub max_write_conflicts: u32,
}

impl Default for LedgerSyncConfig {
    fn default() -> Self {
        Self {
            contract_name: "HealthRecordAccess".to_string(),
            ledger_timeout_ms: 30_000,
            max_retry_count: 10,
            sweep_interval_secs: 300,
            sweep_batch_size: 50,
            max_write_conflicts: 5,
        }
    }
}

impl LedgerSyncConfig {
    /// Short timeouts for tests.
    pub fn test() -> Self {
        Self {
            ledger_timeout_ms: 200,
            max_retry_count: 3,
            sweep_interval_secs: 1,
            ..Self::default()
        }
    }

    /// Rejects values the coordinator and sweeper cannot run with.
    pub fn validate(&self) -> LedgerResult<()> {
        let positive = [
            ("ledgerTimeoutMs", self.ledger_timeout_ms),
            ("maxRetryCount", u64::from(self.max_retry_count)),
            ("sweepIntervalSecs", self.sweep_interval_secs),
            ("sweepBatchSize", self.sweep_batch_size as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(LedgerError::Config(format!("{name} must be greater than zero")));
        }
        if self.contract_name.trim().is_empty() {
            return Err(LedgerError::Config("contractName must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = LedgerSyncConfig::default();
        assert_eq!(cfg.ledger_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.max_retry_count, 10);
        assert_eq!(cfg.contract_name, "HealthRecordAccess");
    }

    #[test]
    fn deserializes_from_camel_case() {
        let json = serde_json::json!({
            "contractName": "AccessV2",
            "ledgerTimeoutMs": 5000,
            "maxRetryCount": 4,
            "sweepIntervalSecs": 60,
            "sweepBatchSize": 10,
            "maxWriteConflicts": 2
        });
        let cfg: LedgerSyncConfig = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.ledger_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(60));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(LedgerSyncConfig::default().validate().is_ok());
        assert!(LedgerSyncConfig::test().validate().is_ok());

        let json = serde_json::json!({
            "contractName": "AccessV2",
            "ledgerTimeoutMs": 5000,
            "maxRetryCount": 4,
            "sweepIntervalSecs": 0,
            "sweepBatchSize": 10,
            "maxWriteConflicts": 2
        });
        let cfg: LedgerSyncConfig = serde_json::from_value(json).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, LedgerError::Config(ref m) if m.contains("sweepIntervalSecs")));

        for broken in [
            LedgerSyncConfig { ledger_timeout_ms: 0, ..LedgerSyncConfig::default() },
            LedgerSyncConfig { sweep_batch_size: 0, ..LedgerSyncConfig::default() },
            LedgerSyncConfig { max_retry_count: 0, ..LedgerSyncConfig::default() },
            LedgerSyncConfig { contract_name: " ".to_string(), ..LedgerSyncConfig::default() },
        ] {
            assert!(matches!(broken.validate(), Err(LedgerError::Config(_))));
        }
    }
}
