//! Per-user key enrollment.
//!
//! The enrollment document is stored with the user profile. It contains
//! nothing secret in the clear: the salt and KDF parameters, a verification
//! token, the recovery blob, and the user's sharing keypair with the secret
//! half encrypted under the master key.

use crate::error::{VaultError, VaultResult};
use healthvault_crypto::envelope::{decrypt_secret_key, encrypt_secret_key};
use healthvault_crypto::{
    EncryptedData, KdfParams, MasterKey, PublicKey, RecoveryBlob, RecoveryKey, Salt,
    SharingKeyPair, create_recovery_blob, decrypt, derive_from_recovery, derive_master_key,
    encrypt, reencrypt_recovery_blob,
};
use serde::{Deserialize, Serialize};

/// Minimum password length accepted at enrollment and password change.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Known plaintext encrypted under the master key; decrypting it on unlock
/// tells a wrong password apart from a right one.
const VERIFICATION_PLAINTEXT: &[u8] = b"healthvault-master-key-verification-v1";

/// Stored enrollment for one user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub salt: Salt,
    pub kdf_params: KdfParams,
    pub verification: EncryptedData,
    pub recovery_blob: RecoveryBlob,
    #[serde(with = "healthvault_crypto::encoding::base64_array")]
    pub sharing_public_key: [u8; 32],
    pub encrypted_sharing_secret: EncryptedData,
    pub created_at: i64,
}

/// Result of a fresh enrollment. The recovery key is shown to the user once.
pub struct NewEnrollment {
    pub enrollment: Enrollment,
    pub recovery_key: RecoveryKey,
    pub master_key: MasterKey,
}

fn check_password(password: &str) -> VaultResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(VaultError::PasswordTooShort {
            min: MIN_PASSWORD_LEN,
        });
    }
    Ok(())
}

impl Enrollment {
    /// Enrolls a new user: fresh salt, master key, recovery key and keypair.
    pub fn create(password: &str, params: KdfParams) -> VaultResult<NewEnrollment> {
        check_password(password)?;

        let salt = Salt::random();
        let master_key = derive_master_key(password, &salt, &params)?;
        let verification = encrypt(master_key.key(), VERIFICATION_PLAINTEXT)?;
        let (recovery_key, recovery_blob) = create_recovery_blob(&master_key, &params)?;

        let sharing = SharingKeyPair::generate();
        let encrypted_sharing_secret = encrypt_secret_key(&sharing.secret, &master_key)?;

        let enrollment = Enrollment {
            salt,
            kdf_params: params,
            verification,
            recovery_blob,
            sharing_public_key: sharing.public_bytes(),
            encrypted_sharing_secret,
            created_at: chrono::Utc::now().timestamp(),
        };

        Ok(NewEnrollment {
            enrollment,
            recovery_key,
            master_key,
        })
    }

    /// Re-derives the master key from the password and checks it.
    pub fn unlock(&self, password: &str) -> VaultResult<MasterKey> {
        let key = derive_master_key(password, &self.salt, &self.kdf_params)?;
        self.verify(&key).map_err(|_| VaultError::InvalidPassword)?;
        Ok(key)
    }

    /// Reconstructs the master key from the recovery key.
    pub fn unlock_with_recovery(&self, recovery_key: &RecoveryKey) -> VaultResult<MasterKey> {
        let key = derive_from_recovery(recovery_key, &self.recovery_blob)
            .map_err(|_| VaultError::InvalidRecoveryKey)?;
        self.verify(&key).map_err(|_| VaultError::InvalidRecoveryKey)?;
        Ok(key)
    }

    /// Whether `key` is this enrollment's master key.
    pub fn verify(&self, key: &MasterKey) -> VaultResult<()> {
        let plaintext = decrypt(key.key(), &self.verification)?;
        if plaintext != VERIFICATION_PLAINTEXT {
            return Err(VaultError::InvalidPassword);
        }
        Ok(())
    }

    pub fn sharing_public_key(&self) -> PublicKey {
        PublicKey::from(self.sharing_public_key)
    }

    /// Decrypts the sharing keypair with the master key.
    pub fn sharing_keypair(&self, master_key: &MasterKey) -> VaultResult<SharingKeyPair> {
        let secret = decrypt_secret_key(&self.encrypted_sharing_secret, master_key)?;
        Ok(SharingKeyPair::from_secret_bytes(secret.to_bytes()))
    }

    /// Replaces the password path with a new password.
    ///
    /// The recovery key is required so the recovery blob can be moved to
    /// the new master key; the same recovery key stays valid afterwards.
    /// Returns the new enrollment plus the old and new master keys so the
    /// caller can re-wrap the user's own content keys.
    pub fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
        recovery_key: &RecoveryKey,
    ) -> VaultResult<(Enrollment, MasterKey, MasterKey)> {
        let old_key = self.unlock(old_password)?;
        let (next, new_key) = self.rekey(&old_key, new_password, recovery_key)?;
        Ok((next, old_key, new_key))
    }

    /// Resets the password using only the recovery key.
    pub fn recover(
        &self,
        recovery_key: &RecoveryKey,
        new_password: &str,
    ) -> VaultResult<(Enrollment, MasterKey, MasterKey)> {
        let old_key = self.unlock_with_recovery(recovery_key)?;
        let (next, new_key) = self.rekey(&old_key, new_password, recovery_key)?;
        Ok((next, old_key, new_key))
    }

    fn rekey(
        &self,
        old_key: &MasterKey,
        new_password: &str,
        recovery_key: &RecoveryKey,
    ) -> VaultResult<(Enrollment, MasterKey)> {
        check_password(new_password)?;

        let sharing = self.sharing_keypair(old_key)?;
        let salt = Salt::random();
        let new_key = derive_master_key(new_password, &salt, &self.kdf_params)?;
        let recovery_blob = reencrypt_recovery_blob(&self.recovery_blob, recovery_key, &new_key)
            .map_err(|_| VaultError::InvalidRecoveryKey)?;

        let next = Enrollment {
            salt,
            kdf_params: self.kdf_params,
            verification: encrypt(new_key.key(), VERIFICATION_PLAINTEXT)?,
            recovery_blob,
            sharing_public_key: self.sharing_public_key,
            encrypted_sharing_secret: encrypt_secret_key(&sharing.secret, &new_key)?,
            created_at: self.created_at,
        };
        Ok((next, new_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_password_rejected() {
        let err = Enrollment::create("short", KdfParams::test()).err().unwrap();
        assert!(matches!(err, VaultError::PasswordTooShort { min: 8 }));
    }

    #[test]
    fn wrong_password_is_invalid_password() {
        let new = Enrollment::create("correct horse battery staple 42!", KdfParams::test()).unwrap();
        let err = new.enrollment.unlock("incorrect horse").unwrap_err();
        assert!(matches!(err, VaultError::InvalidPassword));
    }

    #[test]
    fn empty_password_on_unlock_is_crypto_invalid_input() {
        let new = Enrollment::create("correct horse battery staple 42!", KdfParams::test()).unwrap();
        let err = new.enrollment.unlock("").unwrap_err();
        assert!(matches!(
            err,
            VaultError::Crypto(healthvault_crypto::CryptoError::InvalidInput(_))
        ));
    }

    #[test]
    fn sharing_keypair_matches_public_key() {
        let new = Enrollment::create("correct horse battery staple 42!", KdfParams::test()).unwrap();
        let kp = new.enrollment.sharing_keypair(&new.master_key).unwrap();
        assert_eq!(kp.public_bytes(), new.enrollment.sharing_public_key);
    }

    #[test]
    fn enrollment_json_has_no_plaintext_secrets() {
        let new = Enrollment::create("correct horse battery staple 42!", KdfParams::test()).unwrap();
        let json = serde_json::to_string(&new.enrollment).unwrap();
        assert!(!json.contains(new.recovery_key.as_str()));
        let back: Enrollment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, new.enrollment);
    }
}
