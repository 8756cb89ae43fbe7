#![forbid(unsafe_code)]

use medproof_kernel_contracts::audit::{AuditAction, AuditEntryInput};
use medproof_kernel_contracts::consent::{ConsentGrant, ConsentStatus};
use medproof_kernel_contracts::ids::{ConsentId, RecordId, UserId};
use medproof_kernel_contracts::ledger::{LedgerAddress, TokenId, TxRef};
use medproof_kernel_contracts::UnixTimeMs;
use medproof_storage::{AuditTrail, MedStore, StorageError};
use std::time::{SystemTime, UNIX_EPOCH};

const T0: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

fn consent(id: &str) -> ConsentGrant {
    ConsentGrant::v1_pending(
        ConsentId::new(id).unwrap(),
        UserId::new("patient_1").unwrap(),
        UserId::new("clinic_1").unwrap(),
        LedgerAddress::new(format!("0x{}", "cd".repeat(20))).unwrap(),
        "referral".to_string(),
        [RecordId::new("rec_1").unwrap()].into_iter().collect(),
        T0,
        30,
    )
    .unwrap()
}

fn audit(action: AuditAction, subject: &str, tx: Option<&str>) -> AuditEntryInput {
    AuditEntryInput::v1(
        UserId::new("patient_1").unwrap(),
        action,
        subject,
        tx.map(|t| TxRef::new(t).unwrap()),
        T0,
    )
    .unwrap()
}

fn seeded(id: &str) -> MedStore {
    let mut s = MedStore::new_in_memory();
    s.insert_consent_with_audit(consent(id), audit(AuditAction::ConsentRequest, id, None))
        .unwrap();
    s
}

#[test]
fn at_consents_db_01_approve_then_reject_fails() {
    let mut s = seeded("c_1");
    let cid = ConsentId::new("c_1").unwrap();
    let approved = s
        .consent_approve_commit(
            UnixTimeMs(T0.0 + 1),
            &cid,
            TokenId(5),
            TxRef::new("0xgrant").unwrap(),
            audit(AuditAction::ConsentApprove, "c_1", Some("0xgrant")),
        )
        .unwrap();
    assert_eq!(approved.status, ConsentStatus::Approved);
    assert_eq!(approved.ledger_token_ref, Some(TokenId(5)));

    let err = s
        .consent_reject_commit(
            UnixTimeMs(T0.0 + 2),
            &cid,
            audit(AuditAction::ConsentReject, "c_1", None),
        )
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidTransition { from: "approved", .. }));
    // request + approve only; the failed reject left no trace
    assert_eq!(s.audit_entries().len(), 2);
}

#[test]
fn at_consents_db_02_revoke_requires_approved() {
    let mut s = seeded("c_2");
    let cid = ConsentId::new("c_2").unwrap();
    assert!(matches!(
        s.consent_revoke_commit(
            UnixTimeMs(T0.0 + 1),
            &cid,
            TxRef::new("0xrevoke").unwrap(),
            audit(AuditAction::ConsentRevoke, "c_2", Some("0xrevoke")),
        ),
        Err(StorageError::InvalidTransition { from: "pending", .. })
    ));

    s.consent_approve_commit(
        UnixTimeMs(T0.0 + 1),
        &cid,
        TokenId(9),
        TxRef::new("0xgrant").unwrap(),
        audit(AuditAction::ConsentApprove, "c_2", Some("0xgrant")),
    )
    .unwrap();
    let revoked = s
        .consent_revoke_commit(
            UnixTimeMs(T0.0 + 2),
            &cid,
            TxRef::new("0xrevoke").unwrap(),
            audit(AuditAction::ConsentRevoke, "c_2", Some("0xrevoke")),
        )
        .unwrap();
    assert_eq!(revoked.status, ConsentStatus::Revoked);
    assert_eq!(revoked.ledger_token_ref, Some(TokenId(9)));
    assert_eq!(revoked.revoked_at, Some(UnixTimeMs(T0.0 + 2)));
}

#[test]
fn at_consents_db_03_duplicate_consent_id_is_rejected() {
    let mut s = seeded("c_3");
    assert!(matches!(
        s.insert_consent_with_audit(consent("c_3"), audit(AuditAction::ConsentRequest, "c_3", None)),
        Err(StorageError::DuplicateKey { .. })
    ));
}

#[test]
fn at_consents_db_04_active_consent_respects_scope_and_expiry() {
    let mut s = seeded("c_4");
    let cid = ConsentId::new("c_4").unwrap();
    let grantee = UserId::new("clinic_1").unwrap();
    let rec_1 = RecordId::new("rec_1").unwrap();
    let rec_2 = RecordId::new("rec_2").unwrap();
    assert!(!s.has_active_consent(UnixTimeMs(T0.0 + 1), &grantee, &rec_1));

    let approved = s
        .consent_approve_commit(
            UnixTimeMs(T0.0 + 1),
            &cid,
            TokenId(1),
            TxRef::new("0xgrant").unwrap(),
            audit(AuditAction::ConsentApprove, "c_4", Some("0xgrant")),
        )
        .unwrap();
    assert!(s.has_active_consent(UnixTimeMs(T0.0 + 1), &grantee, &rec_1));
    assert!(!s.has_active_consent(UnixTimeMs(T0.0 + 1), &grantee, &rec_2));
    assert!(!s.has_active_consent(approved.expires_at, &grantee, &rec_1));
    assert_eq!(s.consents_for_grantee(&grantee).len(), 1);
}

#[test]
fn at_consents_db_05_row_journal_keeps_last_status_per_consent() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    let base = std::env::temp_dir().join(format!("medproof-consent-rows-test-{suffix}"));
    let rows = base.join("rows.jsonl");
    let cid = ConsentId::new("c_1").unwrap();
    {
        let mut s = MedStore::open_jsonl(&rows, AuditTrail::new_in_memory()).unwrap();
        s.insert_consent_with_audit(consent("c_1"), audit(AuditAction::ConsentRequest, "c_1", None))
            .unwrap();
        s.consent_approve_commit(
            UnixTimeMs(T0.0 + 1),
            &cid,
            TokenId(7),
            TxRef::new("0xgrant").unwrap(),
            audit(AuditAction::ConsentApprove, "c_1", Some("0xgrant")),
        )
        .unwrap();
    }

    let mut reopened = MedStore::open_jsonl(&rows, AuditTrail::new_in_memory()).unwrap();
    let grant = reopened.consent(&cid).unwrap().clone();
    assert_eq!(grant.status, ConsentStatus::Approved);
    assert_eq!(grant.ledger_token_ref, Some(TokenId(7)));
    assert!(matches!(
        reopened.consent_reject_commit(
            UnixTimeMs(T0.0 + 2),
            &cid,
            audit(AuditAction::ConsentReject, "c_1", None),
        ),
        Err(StorageError::InvalidTransition { .. })
    ));
    std::fs::remove_dir_all(base).unwrap();
}
