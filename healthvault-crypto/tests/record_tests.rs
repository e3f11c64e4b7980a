//! Record-level scenarios: sharing without re-encryption, access denial,
//! per-field tamper reporting, and recovery-key equivalence.

use healthvault_crypto::record::fields;
use healthvault_crypto::{
    CryptoError, DecryptMode, KdfParams, KeyMaterial, MasterKey, Party, RecoveryKey, Salt,
    SharingKeyPair, WrapMode, create_recovery_blob, decrypt_record, derive_from_recovery,
    derive_master_key, encrypt_record, reencrypt_for_new_recipient, unwrap_content_key,
};
use healthvault_types::UserId;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;

fn lab_report() -> BTreeMap<String, Vec<u8>> {
    BTreeMap::from([
        (fields::TITLE.to_string(), b"Lab Report".to_vec()),
        ("notes".to_string(), b"BP 120/80".to_vec()),
    ])
}

fn owner_key() -> MasterKey {
    derive_master_key("correct horse battery staple 42!", &Salt::random(), &KdfParams::test())
        .unwrap()
}

#[test]
fn enrollment_and_recovery_yield_the_same_master_key() {
    let salt = Salt::random();
    let params = KdfParams::test();
    let m1 = derive_master_key("correct horse battery staple 42!", &salt, &params).unwrap();

    let (recovery_key, blob) = create_recovery_blob(&m1, &params).unwrap();
    let typed_back = RecoveryKey::parse(recovery_key.as_str()).unwrap();
    let m2 = derive_from_recovery(&typed_back, &blob).unwrap();

    assert_eq!(m1, m2);
}

#[test]
fn shared_reader_recovers_identical_fields() {
    let u1 = UserId::new("u1");
    let u2 = UserId::new("u2");
    let m1 = owner_key();
    let u2_keys = SharingKeyPair::generate();

    let record = encrypt_record(
        &lab_report(),
        Party { user_id: &u1, wrap: WrapMode::Symmetric(&m1) },
        &[],
    )
    .unwrap();

    let ck = unwrap_content_key(&record.wrapped_keys, &u1, KeyMaterial::Symmetric(&m1)).unwrap();
    let mut wrapped_keys = record.wrapped_keys.clone();
    wrapped_keys.push(reencrypt_for_new_recipient(&ck, &u2, &u2_keys.public).unwrap());

    let decrypted = decrypt_record(
        &record.encrypted_fields,
        &wrapped_keys,
        &u2,
        KeyMaterial::Asymmetric(&u2_keys.secret),
        DecryptMode::AllOrNothing,
    )
    .unwrap();

    assert_eq!(decrypted.fields, lab_report());
}

#[test]
fn sharing_never_changes_field_ciphertext() {
    let u1 = UserId::new("u1");
    let m1 = owner_key();
    let record = encrypt_record(
        &lab_report(),
        Party { user_id: &u1, wrap: WrapMode::Symmetric(&m1) },
        &[],
    )
    .unwrap();
    let before = serde_json::to_vec(&record.encrypted_fields).unwrap();

    let ck = unwrap_content_key(&record.wrapped_keys, &u1, KeyMaterial::Symmetric(&m1)).unwrap();
    let mut wrapped_keys = record.wrapped_keys.clone();
    for i in 0..5 {
        let kp = SharingKeyPair::generate();
        let user = UserId::new(format!("reader-{i}"));
        wrapped_keys.push(reencrypt_for_new_recipient(&ck, &user, &kp.public).unwrap());
    }

    let after = serde_json::to_vec(&record.encrypted_fields).unwrap();
    assert_eq!(before, after);
    assert_eq!(wrapped_keys.len(), 6);
}

#[test]
fn reader_without_entry_is_denied_even_with_valid_keys() {
    let u1 = UserId::new("u1");
    let outsider = UserId::new("outsider");
    let m1 = owner_key();
    let outsider_keys = SharingKeyPair::generate();

    let record = encrypt_record(
        &lab_report(),
        Party { user_id: &u1, wrap: WrapMode::Symmetric(&m1) },
        &[],
    )
    .unwrap();

    let err = decrypt_record(
        &record.encrypted_fields,
        &record.wrapped_keys,
        &outsider,
        KeyMaterial::Asymmetric(&outsider_keys.secret),
        DecryptMode::Partial,
    )
    .unwrap_err();

    match err {
        CryptoError::AccessDenied { user } => assert_eq!(user, outsider),
        other => panic!("expected AccessDenied, got {other:?}"),
    }
}

#[test]
fn tampered_field_is_reported_without_aborting_siblings() {
    let u1 = UserId::new("u1");
    let m1 = owner_key();
    let mut record = encrypt_record(
        &lab_report(),
        Party { user_id: &u1, wrap: WrapMode::Symmetric(&m1) },
        &[],
    )
    .unwrap();

    let notes = record
        .encrypted_fields
        .iter_mut()
        .find(|f| f.field_name == "notes")
        .unwrap();
    notes.ciphertext[0] ^= 0x01;

    let partial = decrypt_record(
        &record.encrypted_fields,
        &record.wrapped_keys,
        &u1,
        KeyMaterial::Symmetric(&m1),
        DecryptMode::Partial,
    )
    .unwrap();
    assert_eq!(partial.tampered, vec!["notes".to_string()]);
    assert_eq!(partial.text(fields::TITLE), Some("Lab Report"));
    assert!(!partial.fields.contains_key("notes"));

    let err = decrypt_record(
        &record.encrypted_fields,
        &record.wrapped_keys,
        &u1,
        KeyMaterial::Symmetric(&m1),
        DecryptMode::AllOrNothing,
    )
    .unwrap_err();
    assert!(matches!(err, CryptoError::FieldTampered { field } if field == "notes"));
}

#[test]
fn corrupted_owner_wrap_is_unwrap_error_not_denied() {
    let u1 = UserId::new("u1");
    let m1 = owner_key();
    let mut record = encrypt_record(
        &lab_report(),
        Party { user_id: &u1, wrap: WrapMode::Symmetric(&m1) },
        &[],
    )
    .unwrap();
    if let healthvault_crypto::WrappedKey::Symmetric { sealed } =
        &mut record.wrapped_keys[0].wrapped_content_key
    {
        sealed.ciphertext[5] ^= 0x80;
    }

    let err = decrypt_record(
        &record.encrypted_fields,
        &record.wrapped_keys,
        &u1,
        KeyMaterial::Symmetric(&m1),
        DecryptMode::Partial,
    )
    .unwrap_err();
    assert!(matches!(err, CryptoError::KeyUnwrap(_)));
}

#[test]
fn encrypted_record_survives_json_storage() {
    let u1 = UserId::new("u1");
    let m1 = owner_key();
    let record = encrypt_record(
        &lab_report(),
        Party { user_id: &u1, wrap: WrapMode::Symmetric(&m1) },
        &[],
    )
    .unwrap();

    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["wrappedKeys"][0]["subjectUserId"], "u1");
    assert_eq!(json["wrappedKeys"][0]["isCreator"], true);
    assert_eq!(
        json["wrappedKeys"][0]["wrappedContentKey"]["wrapAlgorithm"],
        "chacha20poly1305-master"
    );

    let restored: healthvault_crypto::EncryptedRecord = serde_json::from_value(json).unwrap();
    let decrypted = decrypt_record(
        &restored.encrypted_fields,
        &restored.wrapped_keys,
        &u1,
        KeyMaterial::Symmetric(&m1),
        DecryptMode::AllOrNothing,
    )
    .unwrap();
    assert_eq!(decrypted.fields, lab_report());
}
