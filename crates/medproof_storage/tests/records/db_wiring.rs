#![forbid(unsafe_code)]

use medproof_kernel_contracts::audit::{AuditAction, AuditEntryInput};
use medproof_kernel_contracts::ids::{RecordId, UserId};
use medproof_kernel_contracts::ledger::{Digest32, TxRef};
use medproof_kernel_contracts::record::{
    ContentAddress, DescriptiveMetadata, RecordMetadata, RecordStatus,
};
use medproof_kernel_contracts::UnixTimeMs;
use medproof_storage::{AuditTrail, MedStore, StorageError};
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

fn row(record_id: &str, owner: &str, status: RecordStatus) -> RecordMetadata {
    RecordMetadata::v1(
        RecordId::new(record_id).unwrap(),
        UserId::new(owner).unwrap(),
        ContentAddress::new(format!("cas1-{record_id}")).unwrap(),
        Digest32([0x11; 32]),
        Digest32([0x22; 32]),
        [3; 12],
        [4; 16],
        42,
        DescriptiveMetadata {
            title: Some("lab panel".to_string()),
            category: Some("lab_results".to_string()),
            media_type: Some("application/pdf".to_string()),
        },
        TxRef::new(format!("0xtx_{record_id}")).unwrap(),
        status,
        UnixTimeMs(100),
    )
    .unwrap()
}

fn ingest_audit(record_id: &str) -> AuditEntryInput {
    AuditEntryInput::v1(
        UserId::new("provider_1").unwrap(),
        AuditAction::Ingest,
        record_id,
        Some(TxRef::new(format!("0xtx_{record_id}")).unwrap()),
        UnixTimeMs(100),
    )
    .unwrap()
}

#[test]
fn at_records_db_01_row_and_audit_land_together() {
    let mut s = MedStore::new_in_memory();
    let entry = s
        .insert_record_with_audit(row("rec_a", "patient_1", RecordStatus::Verified), ingest_audit("rec_a"))
        .unwrap();

    assert_eq!(entry.seq.0, 1);
    assert!(s.has_record(&RecordId::new("rec_a").unwrap()));
    assert_eq!(s.audit_entries().len(), 1);
    assert_eq!(s.audit_entries()[0].subject_id, "rec_a");
}

#[test]
fn at_records_db_02_duplicate_record_id_writes_nothing() {
    let mut s = MedStore::new_in_memory();
    s.insert_record_with_audit(row("rec_a", "patient_1", RecordStatus::Verified), ingest_audit("rec_a"))
        .unwrap();

    let err = s
        .insert_record_with_audit(row("rec_a", "patient_2", RecordStatus::Verified), ingest_audit("rec_a"))
        .unwrap_err();
    assert!(matches!(err, StorageError::DuplicateKey { .. }));
    assert_eq!(s.audit_entries().len(), 1);
    assert_eq!(
        s.record(&RecordId::new("rec_a").unwrap()).unwrap().owner_id.as_str(),
        "patient_1"
    );
}

#[test]
fn at_records_db_03_status_never_moves_backward() {
    let mut s = MedStore::new_in_memory();
    let rid = RecordId::new("rec_p").unwrap();
    s.insert_record(row("rec_p", "patient_1", RecordStatus::Pending)).unwrap();

    let verified = s
        .transition_record_status(&rid, RecordStatus::Verified, None)
        .unwrap();
    assert_eq!(verified.status, RecordStatus::Verified);

    for next in [RecordStatus::Pending, RecordStatus::Failed] {
        assert!(matches!(
            s.transition_record_status(&rid, next, None),
            Err(StorageError::InvalidTransition { .. })
        ));
    }
}

#[test]
fn at_records_db_04_records_are_never_deleted() {
    let mut s = MedStore::new_in_memory();
    s.insert_record(row("rec_d", "patient_1", RecordStatus::Verified)).unwrap();
    assert!(matches!(
        s.attempt_delete_record(&RecordId::new("rec_d").unwrap()),
        Err(StorageError::AppendOnlyViolation { .. })
    ));
}

#[test]
fn at_records_db_05_owner_index_is_scoped() {
    let mut s = MedStore::new_in_memory();
    s.insert_record(row("rec_1", "patient_1", RecordStatus::Verified)).unwrap();
    s.insert_record(row("rec_2", "patient_2", RecordStatus::Verified)).unwrap();
    s.insert_record(row("rec_3", "patient_1", RecordStatus::Pending)).unwrap();

    let owned = s.records_by_owner(&UserId::new("patient_1").unwrap());
    assert_eq!(owned.len(), 2);
    assert!(owned.iter().all(|r| r.owner_id.as_str() == "patient_1"));
    assert_eq!(s.records_rows().len(), 3);
}

#[test]
fn at_records_db_06_row_journal_survives_reopen() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    let base = std::env::temp_dir().join(format!("medproof-rows-test-{suffix}"));
    let rows = base.join("rows.jsonl");
    let audit = base.join("audit.jsonl");
    let rid = RecordId::new("rec_p").unwrap();
    {
        let mut s = MedStore::open_jsonl(&rows, AuditTrail::open_jsonl(&audit).unwrap()).unwrap();
        s.insert_record_with_audit(row("rec_a", "patient_1", RecordStatus::Verified), ingest_audit("rec_a"))
            .unwrap();
        s.insert_record(row("rec_p", "patient_1", RecordStatus::Pending)).unwrap();
        s.transition_record_status(&rid, RecordStatus::Verified, None)
            .unwrap();
    }

    let mut reopened =
        MedStore::open_jsonl(&rows, AuditTrail::open_jsonl(&audit).unwrap()).unwrap();
    assert_eq!(reopened.records_rows().len(), 2);
    assert_eq!(reopened.audit_entries().len(), 1);
    assert_eq!(reopened.record(&rid).unwrap().status, RecordStatus::Verified);

    let err = reopened
        .insert_record_with_audit(row("rec_a", "patient_2", RecordStatus::Verified), ingest_audit("rec_a"))
        .unwrap_err();
    assert!(matches!(err, StorageError::DuplicateKey { .. }));
    assert_eq!(reopened.audit_entries().len(), 1);

    fs::write(&rows, "{\"table\":\"record\",\"row\":42}\n").unwrap();
    assert!(matches!(
        MedStore::open_jsonl(&rows, AuditTrail::new_in_memory()),
        Err(StorageError::Journal { .. })
    ));
    fs::remove_dir_all(base).unwrap();
}
