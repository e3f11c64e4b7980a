//! Master-key lifecycle for HealthVault.
//!
//! `KeyVault` runs enrollment, unlock and lock against the process-wide
//! [`SessionKeyCache`]. Key derivation is CPU-bound, so the async entry
//! points run it on the blocking pool instead of the interactive path.

mod enrollment;
mod error;
mod session;

pub use enrollment::{Enrollment, MIN_PASSWORD_LEN, NewEnrollment};
pub use error::{VaultError, VaultResult};
pub use session::{SessionConfig, SessionKeyCache};

use healthvault_crypto::{KdfParams, MasterKey, RecoveryKey, SharingKeyPair};
use healthvault_types::UserId;
use std::sync::Arc;
use tracing::{info, warn};

/// Unlock/lock flow bound to one session cache.
#[derive(Clone)]
pub struct KeyVault {
    cache: SessionKeyCache,
    params: KdfParams,
}

async fn run_blocking<T, F>(f: F) -> VaultResult<T>
where
    F: FnOnce() -> VaultResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VaultError::Task(e.to_string()))?
}

impl KeyVault {
    pub fn new(cache: SessionKeyCache, params: KdfParams) -> Self {
        Self { cache, params }
    }

    pub fn cache(&self) -> &SessionKeyCache {
        &self.cache
    }

    /// Enrolls `user_id` and leaves the session unlocked.
    pub async fn enroll(
        &self,
        user_id: UserId,
        password: String,
    ) -> VaultResult<(Enrollment, RecoveryKey)> {
        let params = self.params;
        let NewEnrollment {
            enrollment,
            recovery_key,
            master_key,
        } = run_blocking(move || Enrollment::create(&password, params)).await?;

        info!(user = %user_id, "enrolled new user");
        self.cache.initialize(user_id, master_key);
        Ok((enrollment, recovery_key))
    }

    /// Unlocks with the password.
    pub async fn unlock(
        &self,
        user_id: UserId,
        enrollment: &Enrollment,
        password: String,
    ) -> VaultResult<()> {
        let enrollment = enrollment.clone();
        let key = run_blocking(move || enrollment.unlock(&password)).await;
        self.install(user_id, key)
    }

    /// Unlocks with the recovery key.
    pub async fn unlock_with_recovery(
        &self,
        user_id: UserId,
        enrollment: &Enrollment,
        recovery_key: RecoveryKey,
    ) -> VaultResult<()> {
        let enrollment = enrollment.clone();
        let key = run_blocking(move || enrollment.unlock_with_recovery(&recovery_key)).await;
        self.install(user_id, key)
    }

    /// Resets the password using the recovery key and unlocks with the new
    /// master key. Returns the new enrollment and the replaced master key.
    pub async fn recover(
        &self,
        user_id: UserId,
        enrollment: &Enrollment,
        recovery_key: RecoveryKey,
        new_password: String,
    ) -> VaultResult<(Enrollment, MasterKey)> {
        let enrollment = enrollment.clone();
        let (next, old_key, new_key) =
            run_blocking(move || enrollment.recover(&recovery_key, &new_password)).await?;
        self.cache.initialize(user_id, new_key);
        Ok((next, old_key))
    }

    /// Changes the password for the unlocked user.
    pub async fn change_password(
        &self,
        user_id: UserId,
        enrollment: &Enrollment,
        old_password: String,
        new_password: String,
        recovery_key: RecoveryKey,
    ) -> VaultResult<(Enrollment, MasterKey)> {
        let enrollment = enrollment.clone();
        let (next, old_key, new_key) = run_blocking(move || {
            enrollment.change_password(&old_password, &new_password, &recovery_key)
        })
        .await?;
        self.cache.initialize(user_id, new_key);
        Ok((next, old_key))
    }

    /// Clears the session key.
    pub fn lock(&self) {
        self.cache.clear();
    }

    /// Master key for `user_id`, or `Locked`.
    pub fn master_key(&self, user_id: &UserId) -> VaultResult<Arc<MasterKey>> {
        self.cache.get_for(user_id).ok_or(VaultError::Locked)
    }

    /// Decrypts the unlocked user's sharing keypair.
    pub fn sharing_keypair(
        &self,
        user_id: &UserId,
        enrollment: &Enrollment,
    ) -> VaultResult<SharingKeyPair> {
        let key = self.master_key(user_id)?;
        enrollment.sharing_keypair(&key)
    }

    fn install(&self, user_id: UserId, key: VaultResult<MasterKey>) -> VaultResult<()> {
        match key {
            Ok(key) => {
                self.cache.initialize(user_id, key);
                Ok(())
            }
            Err(e) => {
                warn!(user = %user_id, "unlock failed: {e}");
                Err(e)
            }
        }
    }
}
