//! Properties of field encryption and key wrapping.
//!
//! Round-trips, nonce freshness, and tamper detection on every byte of the
//! ciphertext and IV.

use healthvault_crypto::{
    ContentKey, CryptoError, KeyMaterial, MasterKey, SharingKeyPair, WrapMode, decrypt_field,
    encrypt_field, generate_random_key, unwrap_key, wrap_key,
};
use proptest::prelude::*;
use std::collections::HashSet;

fn master() -> MasterKey {
    MasterKey::from_bytes(*generate_random_key().as_bytes())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn field_roundtrip(plaintext in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let key = ContentKey::generate();
        let field = encrypt_field("notes", &plaintext, &key).unwrap();
        prop_assert_eq!(field.ciphertext.len(), plaintext.len() + healthvault_crypto::TAG_SIZE);
        prop_assert_eq!(decrypt_field(&field, &key).unwrap(), plaintext);
    }

    #[test]
    fn flipping_any_bit_is_detected(
        plaintext in proptest::collection::vec(any::<u8>(), 1..256),
        pos in any::<prop::sample::Index>(),
        bit in 0u8..8,
        in_iv in any::<bool>(),
    ) {
        let key = ContentKey::generate();
        let mut field = encrypt_field("title", &plaintext, &key).unwrap();
        if in_iv {
            let i = pos.index(field.iv.len());
            field.iv[i] ^= 1 << bit;
        } else {
            let i = pos.index(field.ciphertext.len());
            field.ciphertext[i] ^= 1 << bit;
        }
        let err = decrypt_field(&field, &key).unwrap_err();
        let is_tampered = matches!(err, CryptoError::FieldTampered { ref field } if field == "title");
        prop_assert!(is_tampered);
    }
}

#[test]
fn same_field_twice_never_reuses_iv() {
    let key = ContentKey::generate();
    let mut ivs = HashSet::new();
    for _ in 0..1000 {
        let field = encrypt_field("title", b"Lab Report", &key).unwrap();
        assert!(ivs.insert(field.iv), "IV repeated under the same content key");
    }
}

#[test]
fn ciphertext_moved_to_other_field_is_rejected() {
    let key = ContentKey::generate();
    let mut field = encrypt_field("title", b"Lab Report", &key).unwrap();
    field.field_name = "notes".into();
    assert!(matches!(
        decrypt_field(&field, &key),
        Err(CryptoError::FieldTampered { .. })
    ));
}

#[test]
fn wrong_content_key_is_tampered_not_garbage() {
    let field = encrypt_field("title", b"Lab Report", &ContentKey::generate()).unwrap();
    let err = decrypt_field(&field, &ContentKey::generate()).unwrap_err();
    assert!(matches!(err, CryptoError::FieldTampered { .. }));
}

#[test]
fn symmetric_wrap_roundtrip_for_many_keys() {
    let m = master();
    for _ in 0..32 {
        let ck = ContentKey::generate();
        let wrapped = wrap_key(&ck, WrapMode::Symmetric(&m)).unwrap();
        assert_eq!(unwrap_key(&wrapped, KeyMaterial::Symmetric(&m)).unwrap(), ck);
    }
}

#[test]
fn asymmetric_wrap_for_wrong_recipient_fails() {
    let intended = SharingKeyPair::generate();
    let other = SharingKeyPair::generate();
    let wrapped = wrap_key(&ContentKey::generate(), WrapMode::Asymmetric(&intended.public)).unwrap();

    let err = unwrap_key(&wrapped, KeyMaterial::Asymmetric(&other.secret)).unwrap_err();
    assert!(matches!(err, CryptoError::KeyUnwrap(_)));
}

#[test]
fn tampered_sealed_envelope_fails_closed() {
    let kp = SharingKeyPair::generate();
    let mut wrapped = wrap_key(&ContentKey::generate(), WrapMode::Asymmetric(&kp.public)).unwrap();
    if let healthvault_crypto::WrappedKey::Sealed { envelope } = &mut wrapped {
        envelope.ciphertext[0] ^= 0xFF;
    }
    assert!(matches!(
        unwrap_key(&wrapped, KeyMaterial::Asymmetric(&kp.secret)),
        Err(CryptoError::KeyUnwrap(_))
    ));
}

#[test]
fn tampered_symmetric_wrap_fails_closed() {
    let m = master();
    let mut wrapped = wrap_key(&ContentKey::generate(), WrapMode::Symmetric(&m)).unwrap();
    if let healthvault_crypto::WrappedKey::Symmetric { sealed } = &mut wrapped {
        sealed.nonce[3] ^= 0x10;
    }
    assert!(matches!(
        unwrap_key(&wrapped, KeyMaterial::Symmetric(&m)),
        Err(CryptoError::KeyUnwrap(_))
    ));
}

#[test]
fn each_asymmetric_wrap_uses_fresh_ephemeral_key() {
    let kp = SharingKeyPair::generate();
    let ck = ContentKey::generate();
    let a = wrap_key(&ck, WrapMode::Asymmetric(&kp.public)).unwrap();
    let b = wrap_key(&ck, WrapMode::Asymmetric(&kp.public)).unwrap();
    assert_ne!(a, b);
    assert_eq!(unwrap_key(&a, KeyMaterial::Asymmetric(&kp.secret)).unwrap(), ck);
    assert_eq!(unwrap_key(&b, KeyMaterial::Asymmetric(&kp.secret)).unwrap(), ck);
}
