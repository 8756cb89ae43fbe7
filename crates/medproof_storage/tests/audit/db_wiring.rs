#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use medproof_kernel_contracts::audit::{AuditAction, AuditEntryInput, AuditSeq};
use medproof_kernel_contracts::ids::UserId;
use medproof_kernel_contracts::ledger::TxRef;
use medproof_kernel_contracts::UnixTimeMs;
use medproof_storage::{AuditTrail, StorageError};

fn temp_journal(name: &str) -> (PathBuf, PathBuf) {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    let base = std::env::temp_dir().join(format!("medproof-audit-test-{name}-{suffix}"));
    let path = base.join("audit.jsonl");
    (base, path)
}

fn entry(action: AuditAction, subject: &str, tx: Option<&str>, t: u64) -> AuditEntryInput {
    AuditEntryInput::v1(
        UserId::new("provider_1").unwrap(),
        action,
        subject,
        tx.map(|v| TxRef::new(v).unwrap()),
        UnixTimeMs(t),
    )
    .unwrap()
}

#[test]
fn at_audit_db_01_sequence_is_monotonic_and_gap_free() {
    let mut trail = AuditTrail::new_in_memory();
    for i in 0..5u64 {
        trail
            .append(entry(AuditAction::ConsentReject, &format!("c_{i}"), None, 10 + i))
            .unwrap();
    }
    let seqs: Vec<u64> = trail.entries().iter().map(|e| e.seq.0).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}

#[test]
fn at_audit_db_02_overwrite_and_delete_are_refused() {
    let mut trail = AuditTrail::new_in_memory();
    trail
        .append(entry(AuditAction::Ingest, "rec_1", Some("0x01"), 10))
        .unwrap();
    assert!(matches!(
        trail.attempt_overwrite_audit_entry(AuditSeq(1)),
        Err(StorageError::AppendOnlyViolation { .. })
    ));
    assert!(matches!(
        trail.attempt_delete_audit_entry(AuditSeq(1)),
        Err(StorageError::AppendOnlyViolation { .. })
    ));
    assert_eq!(trail.len(), 1);
}

#[test]
fn at_audit_db_03_journal_replays_and_continues_sequence() {
    let (base, path) = temp_journal("replay");
    {
        let mut trail = AuditTrail::open_jsonl(&path).unwrap();
        trail
            .append(entry(AuditAction::Ingest, "rec_1", Some("0x01"), 10))
            .unwrap();
        trail
            .append(entry(AuditAction::ConsentReject, "c_1", None, 11))
            .unwrap();
    }

    let mut reopened = AuditTrail::open_jsonl(&path).unwrap();
    assert_eq!(reopened.len(), 2);
    assert_eq!(reopened.entries_with_ledger_ref().len(), 1);
    let next = reopened
        .append(entry(AuditAction::View, "rec_1", Some("0x02"), 12))
        .unwrap();
    assert_eq!(next.seq, AuditSeq(3));

    let raw = fs::read_to_string(&path).unwrap();
    assert_eq!(raw.lines().count(), 3);
    fs::remove_dir_all(base).unwrap();
}

#[test]
fn at_audit_db_04_tampered_journal_fails_closed() {
    let (base, path) = temp_journal("tamper");
    {
        let mut trail = AuditTrail::open_jsonl(&path).unwrap();
        trail
            .append(entry(AuditAction::ConsentReject, "c_1", None, 10))
            .unwrap();
        trail
            .append(entry(AuditAction::ConsentReject, "c_2", None, 11))
            .unwrap();
    }
    let raw = fs::read_to_string(&path).unwrap();
    let mut lines: Vec<&str> = raw.lines().collect();
    lines.remove(0);
    fs::write(&path, format!("{}\n", lines.join("\n"))).unwrap();

    assert!(matches!(
        AuditTrail::open_jsonl(&path),
        Err(StorageError::Journal { .. })
    ));
    fs::remove_dir_all(base).unwrap();
}
