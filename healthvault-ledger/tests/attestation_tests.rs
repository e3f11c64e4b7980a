//! Verification and dispute anchoring.

mod support;

use healthvault_ledger::contract::LedgerCall;
use healthvault_ledger::{LedgerError, QueueStats};
use healthvault_types::{DisputeSeverity, LedgerStatus, Role, VerificationLevel};
use pretty_assertions::assert_eq;
use support::{Harness, TestUser};

/// Owner u1 shares r1 with provider p1, who is then signed in.
async fn shared_with_provider(h: &Harness) -> (TestUser, TestUser) {
    let u1 = h.user("u1").await;
    let p1 = h.user("p1").await;
    h.sign_in(&u1);
    h.lab_report(&u1, "r1").await;
    h.sync
        .grant("r1".into(), u1.id.clone(), p1.id.clone(), Role::Viewer)
        .await
        .unwrap()
        .settled()
        .await
        .unwrap();
    h.sign_in(&p1);
    (u1, p1)
}

#[tokio::test]
async fn confirmed_verification_updates_the_score() {
    let h = Harness::new();
    let (_u1, p1) = shared_with_provider(&h).await;
    let attest = h.sync.attestations();

    let entry = attest
        .verify_record("r1".into(), p1.id.clone(), VerificationLevel::ProviderVerified)
        .await
        .unwrap();
    assert_eq!(entry.ledger_status, LedgerStatus::Confirmed);
    assert!(entry.ledger_tx_id.is_some());

    let doc = h.sync.records().load(&"r1".into()).await.unwrap();
    assert_eq!(entry.record_hash, doc.record_hash);

    let anchored = h.ledger.attestations().await;
    assert_eq!(anchored.len(), 1);
    assert_eq!(
        anchored[0].call,
        LedgerCall::VerifyRecord {
            record_hash: doc.record_hash,
            level: 3
        }
    );

    let score = attest.score(&doc.record_hash).await.unwrap().unwrap();
    assert_eq!(score.score, 30);
    assert_eq!(score.verification_count, 1);
    assert_eq!(score.dispute_count, 0);
}

#[tokio::test]
async fn failed_verification_is_surfaced_not_queued() {
    let h = Harness::new();
    let (_u1, p1) = shared_with_provider(&h).await;
    let attest = h.sync.attestations();

    h.ledger.fail_next(1).await;
    let err = attest
        .verify_record("r1".into(), p1.id.clone(), VerificationLevel::ProviderReviewed)
        .await
        .unwrap_err();
    let LedgerError::AttestationFailed { kind, id, reason } = err else {
        panic!("expected AttestationFailed, got {err:?}");
    };
    assert_eq!(kind, "verification");
    assert!(reason.contains("simulated failure"));

    let entry = attest.verification(&id).await.unwrap();
    assert_eq!(entry.ledger_status, LedgerStatus::Failed);
    assert!(entry.ledger_error.is_some());
    assert_eq!(h.sync.queue().stats().await.unwrap(), QueueStats::default());

    let doc = h.sync.records().load(&"r1".into()).await.unwrap();
    assert!(attest.score(&doc.record_hash).await.unwrap().is_none());

    // The user re-triggers it.
    let entry = attest.retry_verification(&id, &p1.id).await.unwrap();
    assert_eq!(entry.ledger_status, LedgerStatus::Confirmed);
    assert_eq!(entry.ledger_error, None);
    assert_eq!(attest.score(&doc.record_hash).await.unwrap().unwrap().score, 20);

    // Confirmed entries cannot be re-triggered.
    assert!(matches!(
        attest.retry_verification(&id, &p1.id).await,
        Err(LedgerError::Denied(_))
    ));
}

#[tokio::test]
async fn dispute_lowers_the_score() {
    let h = Harness::new();
    let (_u1, p1) = shared_with_provider(&h).await;
    let attest = h.sync.attestations();

    attest
        .verify_record("r1".into(), p1.id.clone(), VerificationLevel::ProviderVerified)
        .await
        .unwrap();
    let dispute = attest
        .dispute_record(
            "r1".into(),
            p1.id.clone(),
            DisputeSeverity::Minor,
            "dosage transcribed wrong".into(),
        )
        .await
        .unwrap();
    assert_eq!(dispute.ledger_status, LedgerStatus::Confirmed);

    let score = attest.score(&dispute.record_hash).await.unwrap().unwrap();
    assert_eq!(score.score, 15);
    assert_eq!(score.verification_count, 1);
    assert_eq!(score.dispute_count, 1);
}

#[tokio::test]
async fn failed_dispute_can_be_retried_by_its_author_only() {
    let h = Harness::new();
    let (u1, p1) = shared_with_provider(&h).await;
    let attest = h.sync.attestations();

    h.ledger.fail_next(1).await;
    let err = attest
        .dispute_record(
            "r1".into(),
            p1.id.clone(),
            DisputeSeverity::Severe,
            "not my record".into(),
        )
        .await
        .unwrap_err();
    let LedgerError::AttestationFailed { kind, id, .. } = err else {
        panic!("expected AttestationFailed, got {err:?}");
    };
    assert_eq!(kind, "dispute");

    h.sign_in(&u1);
    assert!(matches!(
        attest.retry_dispute(&id, &u1.id).await,
        Err(LedgerError::Denied(_))
    ));

    h.sign_in(&p1);
    let entry = attest.retry_dispute(&id, &p1.id).await.unwrap();
    assert_eq!(entry.ledger_status, LedgerStatus::Confirmed);
}

#[tokio::test]
async fn outsiders_and_locked_sessions_cannot_attest() {
    let h = Harness::new();
    let (_u1, _p1) = shared_with_provider(&h).await;
    let stranger = h.user("s1").await;
    let attest = h.sync.attestations();

    assert!(matches!(
        attest
            .verify_record("r1".into(), stranger.id.clone(), VerificationLevel::SelfAttested)
            .await,
        Err(LedgerError::Locked)
    ));

    h.sign_in(&stranger);
    assert!(matches!(
        attest
            .verify_record("r1".into(), stranger.id.clone(), VerificationLevel::SelfAttested)
            .await,
        Err(LedgerError::Denied(_))
    ));
    assert!(h.ledger.attestations().await.is_empty());
}

#[tokio::test]
async fn concurrent_retries_anchor_a_failed_entry_once() {
    let h = Harness::new();
    let (_u1, p1) = shared_with_provider(&h).await;
    let attest = h.sync.attestations();

    h.ledger.fail_next(1).await;
    let err = attest
        .verify_record("r1".into(), p1.id.clone(), VerificationLevel::ProviderVerified)
        .await
        .unwrap_err();
    let LedgerError::AttestationFailed { id, .. } = err else {
        panic!("expected AttestationFailed, got {err:?}");
    };

    h.ledger.set_latency(std::time::Duration::from_millis(20));
    let other = h.sync.attestations();
    let (first, second) = tokio::join!(
        attest.retry_verification(&id, &p1.id),
        other.retry_verification(&id, &p1.id)
    );

    let confirmed = [&first, &second]
        .iter()
        .filter(|r| matches!(r, Ok(entry) if entry.ledger_status == LedgerStatus::Confirmed))
        .count();
    let denied = [&first, &second]
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::Denied(_))))
        .count();
    assert_eq!((confirmed, denied), (1, 1));
    assert_eq!(h.ledger.attestations().await.len(), 1);

    let doc = h.sync.records().load(&"r1".into()).await.unwrap();
    let score = attest.score(&doc.record_hash).await.unwrap().unwrap();
    assert_eq!(score.verification_count, 1);
}
